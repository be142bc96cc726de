//! Outbound side: negotiate sessions and open streams on them.
//!
//! With session reuse enabled the dialer keeps the last negotiated session
//! and opens further streams on it until the engine reports it dead. Without
//! reuse every dial negotiates a fresh session that lives exactly as long as
//! its one stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};

use peerlink_core::config::{DialerConfig, EngineConfig};
use peerlink_core::wire::ANSWER_POLL_INTERVAL;
use peerlink_core::{EngineError, Error, Phase, Result, SignalError};

use crate::conn::Conn;
use crate::context::Context;
use crate::engine::{channel_opened, session_ended, DataChannel, Engine, EngineSession, RawStream};
use crate::signal::Signal;

#[derive(Clone)]
struct CachedSession {
    generation: u64,
    session: Arc<dyn EngineSession>,
}

/// Opens outbound streams.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    engine: Arc<dyn Engine>,
    engine_config: EngineConfig,
    signal: Option<Arc<dyn Signal>>,
    reuse_session: bool,
    idle_timeout: Duration,
    slot: Mutex<Option<CachedSession>>,
    generation: AtomicU64,
}

impl Dialer {
    /// Without a signal the dialer stops after gathering; exchange descriptions
    /// with `local_description` and `set_remote_description`.
    pub fn new(
        engine: Arc<dyn Engine>,
        engine_config: EngineConfig,
        signal: Option<Arc<dyn Signal>>,
        config: &DialerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                engine,
                engine_config,
                signal,
                reuse_session: config.reuse_session,
                idle_timeout: config.idle_timeout(),
                slot: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub async fn dial(&self, label: &str) -> Result<Conn> {
        self.dial_context(&Context::background(), label).await
    }

    pub async fn dial_context(&self, ctx: &Context, label: &str) -> Result<Conn> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let (session, channel) = {
            let mut slot = ctx.run(async { Ok::<_, Error>(self.inner.slot.lock().await) }).await?;
            self.inner.session_for(ctx, &mut slot, label).await?
        };

        let (done_tx, done_rx) = oneshot::channel();
        {
            let channel = channel.clone();
            tokio::spawn(async move {
                let outcome = open_stream(channel.as_ref()).await;
                if let Err(Ok(raw)) = done_tx.send(outcome) {
                    // The dial was abandoned after the channel opened.
                    let _ = raw.close().await;
                }
            });
        }

        let raw = match ctx
            .run(async { done_rx.await.unwrap_or(Err(Error::StreamClosed)) })
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                if !self.inner.reuse_session {
                    session.close().await;
                }
                return Err(e);
            }
        };

        let path = session.selected_path().await;
        let conn = Conn::new(label, channel.id(), raw, path);
        conn.start_idle_timer(self.inner.idle_timeout);
        conn.close_with_channel(channel.state());
        if !self.inner.reuse_session {
            let conn = conn.clone();
            let session = session.clone();
            tokio::spawn(async move {
                conn.closed().await;
                session.close().await;
            });
        }
        tracing::debug!(label, stream = conn.stream_id(), "stream dialed");
        Ok(conn)
    }

    /// Encoded offer of the cached session, for manual signaling.
    pub async fn local_description(&self) -> Option<Bytes> {
        let session = self.inner.slot.lock().await.as_ref()?.session.clone();
        session.local_description().await
    }

    /// Apply the remote answer to the cached session; pending dials then complete.
    pub async fn set_remote_description(&self, answer: Bytes) -> Result<()> {
        let session = self
            .inner
            .slot
            .lock()
            .await
            .as_ref()
            .map(|cached| cached.session.clone())
            .ok_or(Error::SessionUnavailable)?;
        session
            .set_remote_description(answer)
            .await
            .map_err(|e| apply_error(Phase::AnswerApply, e))
    }

    /// Close the cached session and every stream on it.
    pub async fn close(&self) {
        let cached = self.inner.slot.lock().await.take();
        if let Some(cached) = cached {
            tracing::info!(generation = cached.generation, "closing cached session");
            cached.session.close().await;
        }
    }

    /// Whether a live session is cached.
    pub async fn has_session(&self) -> bool {
        match self.inner.slot.lock().await.as_ref() {
            Some(cached) => !cached.session.state().borrow().is_terminal(),
            None => false,
        }
    }
}

impl DialerInner {
    fn caches_sessions(&self) -> bool {
        self.reuse_session || self.signal.is_none()
    }

    async fn session_for(
        self: &Arc<Self>,
        ctx: &Context,
        slot: &mut Option<CachedSession>,
        label: &str,
    ) -> Result<(Arc<dyn EngineSession>, Arc<dyn DataChannel>)> {
        if self.reuse_session {
            if let Some(cached) = slot.clone() {
                match self.reuse(&cached, label).await {
                    Ok(channel) => return Ok((cached.session, channel)),
                    Err(e) => {
                        tracing::info!(
                            generation = cached.generation,
                            error = %e,
                            "cached session unusable, renegotiating"
                        );
                        cached.session.close().await;
                        *slot = None;
                    }
                }
            }
        }

        let (session, channel) = self.negotiate(ctx, label).await?;
        if self.caches_sessions() {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *slot = Some(CachedSession {
                generation,
                session: session.clone(),
            });
            self.watch_session(generation, session.clone());
        }
        Ok((session, channel))
    }

    async fn reuse(&self, cached: &CachedSession, label: &str) -> Result<Arc<dyn DataChannel>> {
        if cached.session.state().borrow().is_terminal() {
            return Err(Error::SessionUnavailable);
        }
        cached
            .session
            .open_channel(label)
            .await
            .map_err(|e| Error::negotiation(Phase::ChannelOpen, e))
    }

    async fn negotiate(
        &self,
        ctx: &Context,
        label: &str,
    ) -> Result<(Arc<dyn EngineSession>, Arc<dyn DataChannel>)> {
        let session = self
            .engine
            .new_session(&self.engine_config)
            .await
            .map_err(|e| Error::negotiation(Phase::SessionCreate, e))?;

        let outcome = ctx
            .run(async {
                let channel = session
                    .open_channel(label)
                    .await
                    .map_err(|e| Error::negotiation(Phase::ChannelOpen, e))?;
                session
                    .create_offer()
                    .await
                    .map_err(|e| Error::negotiation(Phase::OfferCreate, e))?;
                session
                    .gathering_complete()
                    .await
                    .map_err(|e| Error::negotiation(Phase::Gather, e))?;

                if let Some(signal) = &self.signal {
                    let offer = session.local_description().await.ok_or(Error::negotiation(
                        Phase::Gather,
                        EngineError::InvalidState("no local description"),
                    ))?;
                    let id = signal
                        .offer(offer)
                        .await
                        .map_err(|e| Error::signaling(Phase::OfferSend, e))?;
                    let answer = poll_answer(signal.as_ref(), id).await?;
                    session
                        .set_remote_description(answer)
                        .await
                        .map_err(|e| apply_error(Phase::AnswerApply, e))?;
                }
                Ok::<_, Error>(channel)
            })
            .await;

        match outcome {
            Ok(channel) => {
                tracing::info!(label, "session negotiated");
                Ok((session, channel))
            }
            Err(e) => {
                tracing::debug!(label, error = %e, "negotiation failed");
                session.close().await;
                Err(e)
            }
        }
    }

    /// Clear the cache once the engine reports `session` dead.
    fn watch_session(self: &Arc<Self>, generation: u64, session: Arc<dyn EngineSession>) {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let state = session_ended(session.state()).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut slot = inner.slot.lock().await;
            if slot.as_ref().is_some_and(|cached| cached.generation == generation) {
                *slot = None;
                tracing::info!(generation, ?state, "cached session ended");
            }
        });
    }
}

/// Wait for the channel to open and take its raw stream.
async fn open_stream(channel: &dyn DataChannel) -> Result<Arc<dyn RawStream>> {
    if !channel_opened(channel.state()).await {
        return Err(Error::StreamClosed);
    }
    channel
        .detach()
        .await
        .map_err(|e| Error::negotiation(Phase::Detach, e))
}

async fn poll_answer(signal: &dyn Signal, id: u64) -> Result<Bytes> {
    loop {
        match signal.read_answer(id).await {
            Ok(answer) => return Ok(answer),
            Err(SignalError::AnswerNotReady) => tokio::time::sleep(ANSWER_POLL_INTERVAL).await,
            Err(e) => return Err(Error::signaling(Phase::AnswerReceive, e)),
        }
    }
}

/// Malformed descriptions report the decode phase; anything else the apply phase.
pub(crate) fn apply_error(phase: Phase, e: EngineError) -> Error {
    match e {
        EngineError::Decode(_) => Error::negotiation(Phase::Decode, e),
        other => Error::negotiation(phase, other),
    }
}
