//! Inbound side: answer offers and hand out the remote side's streams.
//!
//! Each offer gets its own session in the pool. Streams the remote opens on
//! it are wrapped as `Conn`s and queued for `accept`. A session whose last
//! stream closed is evicted once it has stayed empty for the idle timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use peerlink_core::config::{EngineConfig, ListenerConfig};
use peerlink_core::wire::SUSPENDED_POLL_INTERVAL;
use peerlink_core::{EngineError, Error, Phase, Result, SignalError};

use crate::conn::Conn;
use crate::context::Context;
use crate::dialer::apply_error;
use crate::engine::{
    channel_opened, session_ended, DataChannel, Engine, EngineSession, SessionState,
};
use crate::pool::SessionPool;
use crate::signal::Signal;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Running,
    Suspended,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Running => "running",
            Status::Suspended => "suspended",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts inbound streams.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    engine: Arc<dyn Engine>,
    engine_config: EngineConfig,
    signal: Option<Arc<dyn Signal>>,
    idle_timeout: Duration,
    negotiation_timeout: Duration,
    status: watch::Sender<Status>,
    loop_running: AtomicBool,
    pool: SessionPool,
    accept_tx: mpsc::Sender<Conn>,
    accept_rx: Mutex<mpsc::Receiver<Conn>>,
}

impl Listener {
    /// Without a signal no accept loop runs; feed offers through `answer_offer`.
    pub fn new(
        engine: Arc<dyn Engine>,
        engine_config: EngineConfig,
        signal: Option<Arc<dyn Signal>>,
        config: &ListenerConfig,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        Self {
            inner: Arc::new(ListenerInner {
                engine,
                engine_config,
                signal,
                idle_timeout: config.idle_timeout(),
                negotiation_timeout: config.negotiation_timeout(),
                status: watch::channel(Status::New).0,
                loop_running: AtomicBool::new(false),
                pool: SessionPool::new(),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
            }),
        }
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    /// Sessions currently pooled.
    pub async fn session_count(&self) -> usize {
        self.inner.pool.len().await
    }

    /// Begin (or resume) serving offers.
    pub fn start(&self) -> Result<()> {
        let from = self.inner.transition(
            &[Status::New, Status::Suspended, Status::Stopped],
            Status::Running,
        )?;
        tracing::info!(from = %from, "listener running");
        if let Some(signal) = &self.inner.signal {
            if !self.inner.loop_running.swap(true, Ordering::AcqRel) {
                tokio::spawn(accept_loop(self.inner.clone(), signal.clone()));
            }
        }
        Ok(())
    }

    /// Stop serving and close every pooled session.
    pub async fn stop(&self) -> Result<()> {
        self.inner
            .transition(&[Status::Running, Status::Suspended], Status::Stopped)?;
        let sessions = self.inner.pool.drain().await;
        let closed = sessions.len();
        for session in sessions {
            session.close().await;
        }
        let mut queue = self.inner.accept_rx.lock().await;
        while let Ok(conn) = queue.try_recv() {
            let _ = conn.close().await;
        }
        tracing::info!(sessions = closed, "listener stopped");
        Ok(())
    }

    /// Alias for `stop`.
    pub async fn close(&self) -> Result<()> {
        self.stop().await
    }

    /// Pause offer consumption. Established sessions keep running.
    pub fn suspend(&self) -> Result<()> {
        self.inner
            .transition(&[Status::Running], Status::Suspended)?;
        tracing::info!("listener suspended");
        Ok(())
    }

    pub async fn accept(&self) -> Result<Conn> {
        self.accept_context(&Context::background()).await
    }

    /// Wait for the next inbound stream. Fails with `ListenerClosed` once stopped.
    pub async fn accept_context(&self, ctx: &Context) -> Result<Conn> {
        let status = self.inner.status.subscribe();
        ctx.run(async {
            tokio::select! {
                biased;
                _ = wait_stopped(status.clone()) => Err(Error::ListenerClosed),
                conn = async {
                    let mut queue = self.inner.accept_rx.lock().await;
                    queue.recv().await
                } => conn.ok_or(Error::ListenerClosed),
            }
        })
        .await
    }

    /// Answer `offer` directly, without a signal. The resulting streams
    /// arrive through `accept`.
    pub async fn answer_offer(&self, ctx: &Context, offer: Bytes) -> Result<Bytes> {
        if self.status() == Status::Stopped {
            return Err(Error::ListenerClosed);
        }
        let ctx = ctx.child_with_timeout(self.inner.negotiation_timeout);
        let (_, answer) = self.inner.next_session(&ctx, offer).await?;
        Ok(answer)
    }
}

impl ListenerInner {
    /// Compare-and-swap the status. Returns the previous one.
    fn transition(&self, allowed: &[Status], to: Status) -> Result<Status> {
        let mut from = Status::New;
        let swapped = self.status.send_if_modified(|current| {
            from = *current;
            if allowed.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        });
        if swapped {
            Ok(from)
        } else {
            Err(Error::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            })
        }
    }

    /// Negotiate one session for `offer`. Returns its pool id and the encoded answer.
    async fn next_session(self: &Arc<Self>, ctx: &Context, offer: Bytes) -> Result<(u64, Bytes)> {
        let session = self
            .engine
            .new_session(&self.engine_config)
            .await
            .map_err(|e| Error::negotiation(Phase::SessionCreate, e))?;
        let (id, active) = self.pool.insert(session.clone()).await;
        // `stop` drains the pool after switching status, so a session pooled
        // once the listener reads as stopped may have missed the drain.
        if self.is_stopped() {
            self.discard(id).await;
            return Err(Error::ListenerClosed);
        }
        tracing::debug!(session = %session_hex(id), "session allocated");

        self.observe_state(id, session.clone(), active);
        self.observe_streams(id, session.clone());

        let answer = ctx
            .run(async {
                session
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| apply_error(Phase::OfferApply, e))?;
                session
                    .create_answer()
                    .await
                    .map_err(|e| Error::negotiation(Phase::AnswerCreate, e))?;
                session
                    .gathering_complete()
                    .await
                    .map_err(|e| Error::negotiation(Phase::Gather, e))?;
                session.local_description().await.ok_or(Error::negotiation(
                    Phase::Gather,
                    EngineError::InvalidState("no local description"),
                ))
            })
            .await;

        match answer {
            Ok(_) if self.is_stopped() => {
                self.discard(id).await;
                Err(Error::ListenerClosed)
            }
            Ok(answer) => {
                self.expire_unconnected(id, session);
                Ok((id, answer))
            }
            Err(e) => {
                self.discard(id).await;
                Err(e)
            }
        }
    }

    fn is_stopped(&self) -> bool {
        *self.status.borrow() == Status::Stopped
    }

    /// Discard the session unless it connects within the negotiation timeout.
    fn expire_unconnected(self: &Arc<Self>, id: u64, session: Arc<dyn EngineSession>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let settled =
                tokio::time::timeout(inner.negotiation_timeout, session_settled(session.state()))
                    .await;
            if settled.is_err() {
                tracing::info!(session = %session_hex(id), "session never connected");
                inner.discard(id).await;
            }
        });
    }

    async fn discard(&self, id: u64) {
        if let Some((session, remaining)) = self.pool.remove(id).await {
            session.close().await;
            tracing::debug!(session = %session_hex(id), remaining, "session discarded");
        }
    }

    /// Drop the session from the pool when it ends; start the idle reaper once connected.
    fn observe_state(
        self: &Arc<Self>,
        id: u64,
        session: Arc<dyn EngineSession>,
        active: watch::Receiver<usize>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut state = session.state();
            let mut reaper_started = false;
            loop {
                let current = *state.borrow_and_update();
                if current.is_terminal() {
                    if let Some((session, remaining)) = inner.pool.remove(id).await {
                        session.close().await;
                        tracing::info!(
                            session = %session_hex(id),
                            state = ?current,
                            remaining,
                            "session ended"
                        );
                    }
                    return;
                }
                if current == SessionState::Connected && !reaper_started {
                    reaper_started = true;
                    tracing::info!(session = %session_hex(id), "session connected");
                    tokio::spawn(reap_when_idle(
                        inner.clone(),
                        id,
                        active.clone(),
                    ));
                }
                if state.changed().await.is_err() {
                    inner.discard(id).await;
                    return;
                }
            }
        });
    }

    /// Wrap every inbound channel as a `Conn` and queue it for `accept`.
    fn observe_streams(self: &Arc<Self>, id: u64, session: Arc<dyn EngineSession>) {
        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(channel) = session.accept_channel().await {
                tokio::spawn(inner.clone().admit_stream(id, session.clone(), channel));
            }
        });
    }

    async fn admit_stream(
        self: Arc<Self>,
        id: u64,
        session: Arc<dyn EngineSession>,
        channel: Arc<dyn DataChannel>,
    ) {
        let label = channel.label().to_string();
        let stream = channel.id();
        tokio::select! {
            opened = channel_opened(channel.state()) => {
                if !opened {
                    return;
                }
            }
            _ = session_ended(session.state()) => return,
        }
        let raw = match channel.detach().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    session = %session_hex(id),
                    label = %label,
                    error = %e,
                    "detach failed"
                );
                return;
            }
        };

        let path = session.selected_path().await;
        let conn = Conn::new(label.clone(), stream, raw, path);
        conn.start_idle_timer(self.idle_timeout);
        conn.close_with_channel(channel.state());

        if !self.pool.track_stream(id, stream).await {
            let _ = conn.close().await;
            return;
        }
        {
            let inner = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.closed().await;
                inner.pool.release_stream(id, stream).await;
                tracing::debug!(session = %session_hex(id), stream, "stream released");
            });
        }

        tracing::debug!(session = %session_hex(id), label = %label, stream, "stream accepted");
        let status = self.status.subscribe();
        tokio::select! {
            sent = self.accept_tx.send(conn.clone()) => {
                if sent.is_err() {
                    let _ = conn.close().await;
                }
            }
            _ = wait_stopped(status) => {
                let _ = conn.close().await;
            }
        }
    }
}

/// Close the session after its stream count has stayed at zero for the idle timeout.
async fn reap_when_idle(inner: Arc<ListenerInner>, id: u64, mut active: watch::Receiver<usize>) {
    if inner.idle_timeout.is_zero() {
        return;
    }
    loop {
        loop {
            if *active.borrow_and_update() == 0 {
                break;
            }
            if active.changed().await.is_err() {
                return;
            }
        }
        let busy = tokio::time::timeout(inner.idle_timeout, async {
            loop {
                if *active.borrow_and_update() > 0 {
                    return true;
                }
                if active.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match busy {
            Ok(true) => continue,
            Ok(false) => return,
            Err(_) => {
                if let Some(session) = inner.pool.remove_if_idle(id).await {
                    session.close().await;
                    tracing::info!(session = %session_hex(id), "idle session evicted");
                    return;
                }
            }
        }
    }
}

async fn accept_loop(inner: Arc<ListenerInner>, signal: Arc<dyn Signal>) {
    let mut status = inner.status.subscribe();
    tracing::debug!("accept loop started");
    loop {
        let current = *status.borrow_and_update();
        match current {
            Status::Stopped => {
                inner.loop_running.store(false, Ordering::Release);
                // A start that raced with this exit must not be left without a loop.
                if *inner.status.borrow() != Status::Stopped
                    && !inner.loop_running.swap(true, Ordering::AcqRel)
                {
                    continue;
                }
                tracing::debug!("accept loop exited");
                return;
            }
            Status::New | Status::Suspended => {
                let _ = tokio::time::timeout(SUSPENDED_POLL_INTERVAL, status.changed()).await;
            }
            Status::Running => {
                tokio::select! {
                    _ = status.changed() => {}
                    offer = signal.read_offer() => match offer {
                        Ok((offer_id, offer)) => {
                            let inner = inner.clone();
                            tokio::spawn(handle_offer(inner, signal.clone(), offer_id, offer));
                        }
                        Err(SignalError::Closed) => {
                            tracing::warn!("signal closed, waiting");
                            let _ = tokio::time::timeout(SUSPENDED_POLL_INTERVAL, status.changed())
                                .await;
                        }
                        Err(e) => {
                            let e = Error::signaling(Phase::OfferReceive, e);
                            tracing::warn!(error = %e, "failed to read offer");
                            tokio::task::yield_now().await;
                        }
                    },
                }
            }
        }
    }
}

async fn handle_offer(
    inner: Arc<ListenerInner>,
    signal: Arc<dyn Signal>,
    offer_id: u64,
    offer: Bytes,
) {
    let ctx = Context::with_timeout(inner.negotiation_timeout);
    let (id, answer) = match inner.next_session(&ctx, offer).await {
        Ok(negotiated) => negotiated,
        Err(e) => {
            let offer = session_hex(offer_id);
            tracing::warn!(offer = %offer, error = %e, "offer negotiation failed");
            return;
        }
    };
    if inner.is_stopped() {
        inner.discard(id).await;
        return;
    }
    let sent = ctx
        .run(async {
            signal
                .answer(offer_id, answer)
                .await
                .map_err(|e| Error::signaling(Phase::AnswerSend, e))
        })
        .await;
    match sent {
        Ok(()) => tracing::debug!(session = %session_hex(id), "answer sent"),
        Err(e) => {
            tracing::warn!(session = %session_hex(id), error = %e, "answer failed");
            inner.discard(id).await;
        }
    }
}

/// Wait until the session connects or ends.
async fn session_settled(mut state: watch::Receiver<SessionState>) {
    loop {
        let current = *state.borrow_and_update();
        if current == SessionState::Connected || current.is_terminal() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_stopped(mut status: watch::Receiver<Status>) {
    loop {
        if *status.borrow_and_update() == Status::Stopped {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

fn session_hex(id: u64) -> String {
    hex::encode(id.to_be_bytes())
}
