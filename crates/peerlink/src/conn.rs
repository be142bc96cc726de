//! Stream-socket view of one raw engine stream.
//!
//! Reads go through a one-slot queue filled by a background probe that
//! performs a single raw read at a time, so a read abandoned on its deadline
//! never loses the message the probe is about to deliver.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use peerlink_core::wire::{ensure_payload_len, MAX_MESSAGE_SIZE};
use peerlink_core::{EngineError, Error, Result};

use crate::engine::{channel_closed, ChannelState, RawStream};
use crate::lock;

enum Chunk {
    Data(Bytes),
    Eof,
}

/// A bidirectional message stream with socket-style deadlines.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<ConnShared>,
}

struct ConnShared {
    label: String,
    stream_id: u16,
    raw: Arc<dyn RawStream>,
    queue_tx: mpsc::Sender<Chunk>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Chunk>>,
    /// Set while a probe is running or its chunk is still queued.
    probing: AtomicBool,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    idle: AtomicBool,
    write_order: tokio::sync::Mutex<()>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl Conn {
    pub(crate) fn new(
        label: impl Into<String>,
        stream_id: u16,
        raw: Arc<dyn RawStream>,
        path: Option<(SocketAddr, SocketAddr)>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(ConnShared {
                label: label.into(),
                stream_id,
                raw,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                probing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                closed_tx: watch::channel(false).0,
                idle: AtomicBool::new(false),
                write_order: tokio::sync::Mutex::new(()),
                read_deadline: Mutex::new(None),
                write_deadline: Mutex::new(None),
                local_addr: path.map(|(local, _)| local),
                remote_addr: path.map(|(_, remote)| remote),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn stream_id(&self) -> u16 {
        self.shared.stream_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Read one message into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream. A message longer than `buf` fills it
    /// and fails with `Error::ShortBuffer`; the rest of that message is lost.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let deadline = *lock(&self.shared.read_deadline);
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(Error::DeadlineExceeded);
        }

        let mut queue = tokio::select! {
            biased;
            _ = self.closed() => return Ok(0),
            _ = sleep_until(deadline) => return Err(Error::DeadlineExceeded),
            queue = self.shared.queue_rx.lock() => queue,
        };

        if let Ok(chunk) = queue.try_recv() {
            return self.deliver(chunk, buf);
        }
        self.spawn_probe();

        tokio::select! {
            biased;
            chunk = queue.recv() => match chunk {
                Some(chunk) => self.deliver(chunk, buf),
                None => Ok(0),
            },
            _ = self.closed() => Ok(0),
            _ = sleep_until(deadline) => Err(Error::DeadlineExceeded),
        }
    }

    fn deliver(&self, chunk: Chunk, buf: &mut [u8]) -> Result<usize> {
        self.shared.probing.store(false, Ordering::Release);
        match chunk {
            Chunk::Eof => {
                self.mark_closed();
                Ok(0)
            }
            Chunk::Data(data) => {
                let copied = data.len().min(buf.len());
                buf[..copied].copy_from_slice(&data[..copied]);
                if data.len() > buf.len() {
                    return Err(Error::ShortBuffer {
                        copied,
                        len: data.len(),
                    });
                }
                Ok(copied)
            }
        }
    }

    fn spawn_probe(&self) {
        if self.shared.probing.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let chunk = match shared.raw.read(&mut buf).await {
                Ok(0) => Chunk::Eof,
                Ok(n) => {
                    buf.truncate(n);
                    Chunk::Data(Bytes::from(buf))
                }
                Err(e) => {
                    tracing::debug!(
                        label = %shared.label,
                        stream = shared.stream_id,
                        error = %e,
                        "raw read failed"
                    );
                    Chunk::Eof
                }
            };
            let _ = shared.queue_tx.send(chunk).await;
        });
    }

    /// Write `buf` as one message.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        ensure_payload_len(buf.len())?;
        let deadline = *lock(&self.shared.write_deadline);
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(Error::DeadlineExceeded);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let written = tokio::select! {
            biased;
            _ = self.closed() => return Err(Error::StreamClosed),
            _ = sleep_until(deadline) => return Err(Error::DeadlineExceeded),
            written = async {
                let _order = self.shared.write_order.lock().await;
                self.shared.raw.write(buf).await
            } => written,
        };

        let n = written.map_err(|e| match e {
            EngineError::ChannelClosed | EngineError::SessionClosed => Error::StreamClosed,
            other => Error::Io(std::io::Error::other(other)),
        })?;
        if n > 0 {
            self.shared.idle.store(false, Ordering::Release);
        }
        Ok(n)
    }

    /// Close the stream. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        tracing::debug!(label = %self.shared.label, stream = self.shared.stream_id, "conn closed");
        self.shared
            .raw
            .close()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    /// Sets the closed flag; returns false if it was already set.
    fn mark_closed(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.closed_tx.send_replace(true);
        true
    }

    /// Resolves once the stream is closed, locally or by end of stream.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Set both deadlines. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        check_deadline(deadline)?;
        *lock(&self.shared.read_deadline) = deadline;
        *lock(&self.shared.write_deadline) = deadline;
        Ok(())
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        check_deadline(deadline)?;
        *lock(&self.shared.read_deadline) = deadline;
        Ok(())
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        check_deadline(deadline)?;
        *lock(&self.shared.write_deadline) = deadline;
        Ok(())
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        *lock(&self.shared.read_deadline)
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        *lock(&self.shared.write_deadline)
    }

    /// Close the stream after `timeout` passes without a write. Zero disables.
    pub(crate) fn start_idle_timer(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                conn.shared.idle.store(true, Ordering::Release);
                tokio::select! {
                    _ = conn.closed() => return,
                    _ = tokio::time::sleep(timeout) => {}
                }
                if conn.shared.idle.load(Ordering::Acquire) {
                    tracing::debug!(
                        label = %conn.shared.label,
                        stream = conn.shared.stream_id,
                        "closing idle conn"
                    );
                    let _ = conn.close().await;
                    return;
                }
            }
        });
    }

    /// Close the conn once the engine reports its channel closed.
    pub(crate) fn close_with_channel(&self, state: watch::Receiver<ChannelState>) {
        let conn = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.closed() => {}
                _ = channel_closed(state) => {
                    let _ = conn.close().await;
                }
            }
        });
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("label", &self.shared.label)
            .field("stream_id", &self.shared.stream_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if d <= Instant::now() => Err(Error::DeadlineInPast),
        _ => Ok(()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
