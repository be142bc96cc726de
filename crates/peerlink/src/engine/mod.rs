//! Session engine seam.
//!
//! The engine owns candidate gathering, NAT traversal, the handshake and the
//! multiplexed stream transport. The dialer and listener only drive it
//! through these traits. Engine events are published as values: session and
//! channel state on `watch` channels, inbound channels through
//! `EngineSession::accept_channel`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use peerlink_core::config::EngineConfig;
use peerlink_core::EngineError;

pub mod memory;
#[cfg(feature = "webrtc")]
pub mod rtc;

pub use memory::{MemoryEngine, MemoryNetwork};
#[cfg(feature = "webrtc")]
pub use rtc::WebRtcEngine;

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// A terminal session never carries traffic again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Builds sessions.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn new_session(
        &self,
        config: &EngineConfig,
    ) -> Result<Arc<dyn EngineSession>, EngineError>;
}

/// One negotiated (or negotiating) peer session.
#[async_trait]
pub trait EngineSession: Send + Sync + 'static {
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Open a locally initiated channel. It reports `Open` once the session connects.
    async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;

    /// Next channel opened by the remote side. `None` once the session has ended.
    async fn accept_channel(&self) -> Option<Arc<dyn DataChannel>>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<(), EngineError>;

    /// Create an answer to the applied remote offer and install it locally.
    async fn create_answer(&self) -> Result<(), EngineError>;

    /// Resolves once candidate gathering for the local description has finished.
    async fn gathering_complete(&self) -> Result<(), EngineError>;

    /// The encoded local description, candidates included once gathering is done.
    async fn local_description(&self) -> Option<Bytes>;

    /// Apply an encoded remote offer or answer.
    async fn set_remote_description(&self, description: Bytes) -> Result<(), EngineError>;

    /// Local and remote address of the selected network path, if known.
    async fn selected_path(&self) -> Option<(SocketAddr, SocketAddr)>;

    async fn close(&self);
}

/// A channel on a session, before it is detached into a raw stream.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> &str;
    fn id(&self) -> u16;
    fn state(&self) -> watch::Receiver<ChannelState>;

    /// Take the channel's message stream. Valid once the channel is open.
    async fn detach(&self) -> Result<Arc<dyn RawStream>, EngineError>;
}

/// Message-oriented bidirectional stream. Each `read` yields at most one message.
#[async_trait]
pub trait RawStream: Send + Sync + 'static {
    /// `Ok(0)` signals end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError>;
    async fn write(&self, buf: &[u8]) -> Result<usize, EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

/// Wait until `state` reaches `Open` (true) or `Closed` (false).
pub(crate) async fn channel_opened(mut state: watch::Receiver<ChannelState>) -> bool {
    loop {
        let current = *state.borrow_and_update();
        match current {
            ChannelState::Open => return true,
            ChannelState::Closed => return false,
            ChannelState::Connecting => {}
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

/// Wait until the channel reports `Closed` or its publisher goes away.
pub(crate) async fn channel_closed(mut state: watch::Receiver<ChannelState>) {
    loop {
        if *state.borrow_and_update() == ChannelState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Wait until the session reaches a terminal state; returns that state.
pub(crate) async fn session_ended(mut state: watch::Receiver<SessionState>) -> SessionState {
    loop {
        let current = *state.borrow_and_update();
        if current.is_terminal() {
            return current;
        }
        if state.changed().await.is_err() {
            return SessionState::Closed;
        }
    }
}
