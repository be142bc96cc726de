//! In-process session engine.
//!
//! Sessions created from engines of the same `MemoryNetwork` find each other
//! through the endpoint id carried in their descriptions. Descriptions are
//! small JSON documents; messages travel over bounded queues, so a reader
//! that falls behind applies backpressure to the writer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use peerlink_core::config::EngineConfig;
use peerlink_core::EngineError;

use super::{
    channel_closed, session_ended, ChannelState, DataChannel, Engine, EngineSession, RawStream,
    SessionState,
};
use crate::lock;

/// Messages buffered per channel direction before writes wait.
const CHANNEL_QUEUE_DEPTH: usize = 64;

/// A shared rendezvous for in-process sessions.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    sessions: DashMap<u64, Weak<SessionInner>>,
    rng: Mutex<StdRng>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                sessions: DashMap::new(),
                rng: Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    /// An engine whose sessions live on this network.
    pub fn engine(&self) -> MemoryEngine {
        MemoryEngine {
            network: self.inner.clone(),
        }
    }

    /// Sessions that have not reached a terminal state.
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .upgrade()
                    .is_some_and(|session| !session.state.borrow().is_terminal())
            })
            .count()
    }

    /// Drive every live session to `Failed`, as if the network path dropped.
    pub fn fail_sessions(&self) {
        let live: Vec<Arc<SessionInner>> = self
            .inner
            .sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for session in live {
            session.shutdown(SessionState::Failed);
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInner {
    fn register(self: &Arc<Self>) -> Arc<SessionInner> {
        let mut rng = lock(&self.rng);
        loop {
            let endpoint: u64 = rng.gen();
            if let Entry::Vacant(slot) = self.sessions.entry(endpoint) {
                let session = SessionInner::new(endpoint, Arc::downgrade(self));
                slot.insert(Arc::downgrade(&session));
                return session;
            }
        }
    }

    fn lookup(&self, endpoint: u64) -> Option<Arc<SessionInner>> {
        self.sessions.get(&endpoint).and_then(|entry| entry.value().upgrade())
    }
}

/// Engine handle for one `MemoryNetwork`. Ignores the engine configuration.
#[derive(Clone)]
pub struct MemoryEngine {
    network: Arc<NetworkInner>,
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn new_session(
        &self,
        _config: &EngineConfig,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        let inner = self.network.register();
        tracing::trace!(
            endpoint = %hex::encode(inner.endpoint.to_be_bytes()),
            "memory session created"
        );
        Ok(Arc::new(MemorySession { inner }))
    }
}

// ── Descriptions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Serialize, Deserialize)]
struct Description {
    #[serde(rename = "type")]
    kind: DescriptionKind,
    endpoint: u64,
}

impl Description {
    fn encode(kind: DescriptionKind, endpoint: u64) -> Result<Bytes, EngineError> {
        serde_json::to_vec(&Description { kind, endpoint })
            .map(Bytes::from)
            .map_err(|e| EngineError::Backend(e.to_string()))
    }

    fn decode(raw: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(raw).map_err(|e| EngineError::Decode(e.to_string()))
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

#[derive(Default)]
struct SessionCore {
    role: Option<Role>,
    local: Option<Bytes>,
    peer: Option<Weak<SessionInner>>,
    channels: Vec<Arc<ChannelInner>>,
    next_channel: u16,
}

struct SessionInner {
    endpoint: u64,
    network: Weak<NetworkInner>,
    state: watch::Sender<SessionState>,
    core: Mutex<SessionCore>,
    inbound_tx: mpsc::UnboundedSender<Arc<ChannelInner>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<ChannelInner>>>,
}

impl SessionInner {
    fn new(endpoint: u64, network: Weak<NetworkInner>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoint,
            network,
            state: watch::channel(SessionState::New).0,
            core: Mutex::new(SessionCore::default()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Terminal states are sticky, except that `Closed` replaces any of them.
    fn set_state(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == next || *state == SessionState::Closed {
                return false;
            }
            if state.is_terminal() && next != SessionState::Closed {
                return false;
            }
            *state = next;
            true
        })
    }

    fn peer(&self) -> Option<Arc<SessionInner>> {
        lock(&self.core).peer.as_ref().and_then(Weak::upgrade)
    }

    fn path(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1024 + (self.endpoint % 64000) as u16))
    }

    fn new_channel(&self, label: &str) -> Arc<ChannelInner> {
        let mut core = lock(&self.core);
        // SCTP-style split: the offering side uses even ids.
        let parity = match core.role {
            Some(Role::Answerer) => 1,
            _ => 0,
        };
        let id = core.next_channel.wrapping_mul(2).wrapping_add(parity);
        core.next_channel = core.next_channel.wrapping_add(1);
        let channel = ChannelInner::new(label, id);
        core.channels.push(channel.clone());
        channel
    }

    /// Create the remote half of `local` on `peer` and hand it to the peer's accept queue.
    fn link_remote(local: &Arc<ChannelInner>, peer: &Arc<SessionInner>) {
        if local.linked.swap(true, Ordering::AcqRel) {
            return;
        }
        let remote = ChannelInner::new(&local.label, local.id);
        remote.linked.store(true, Ordering::Release);
        lock(&peer.core).channels.push(remote.clone());
        ChannelInner::pair(local, &remote);
        let _ = peer.inbound_tx.send(remote);
    }

    fn connect(self: &Arc<Self>, peer: Arc<SessionInner>) -> Result<(), EngineError> {
        if peer.current().is_terminal() {
            return Err(EngineError::SessionClosed);
        }
        lock(&self.core).peer = Some(Arc::downgrade(&peer));
        lock(&peer.core).peer = Some(Arc::downgrade(self));
        self.set_state(SessionState::Connected);
        peer.set_state(SessionState::Connected);

        let pending: Vec<Arc<ChannelInner>> = lock(&self.core).channels.clone();
        for channel in pending {
            if channel.current() == ChannelState::Connecting {
                Self::link_remote(&channel, &peer);
            }
        }
        Ok(())
    }

    /// Move to the terminal state `next` and leave the registry.
    fn shutdown(&self, next: SessionState) {
        if !self.set_state(next) {
            return;
        }
        let (channels, peer) = {
            let mut core = lock(&self.core);
            (
                std::mem::take(&mut core.channels),
                core.peer.as_ref().and_then(Weak::upgrade),
            )
        };
        for channel in channels {
            channel.shut();
        }
        if let Some(peer) = peer {
            peer.shutdown(SessionState::Disconnected);
        }
        if let Some(network) = self.network.upgrade() {
            network.sessions.remove(&self.endpoint);
        }
    }
}

struct MemorySession {
    inner: Arc<SessionInner>,
}

#[async_trait]
impl EngineSession for MemorySession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        if self.inner.current().is_terminal() {
            return Err(EngineError::SessionClosed);
        }
        let channel = self.inner.new_channel(label);
        if self.inner.current() == SessionState::Connected {
            if let Some(peer) = self.inner.peer() {
                SessionInner::link_remote(&channel, &peer);
            }
        }
        Ok(Arc::new(MemoryChannel { inner: channel }))
    }

    async fn accept_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let mut inbound = self.inner.inbound_rx.lock().await;
        tokio::select! {
            biased;
            channel = inbound.recv() => {
                channel.map(|inner| Arc::new(MemoryChannel { inner }) as Arc<dyn DataChannel>)
            }
            _ = session_ended(self.inner.state.subscribe()) => None,
        }
    }

    async fn create_offer(&self) -> Result<(), EngineError> {
        if self.inner.current().is_terminal() {
            return Err(EngineError::SessionClosed);
        }
        let offer = Description::encode(DescriptionKind::Offer, self.inner.endpoint)?;
        let mut core = lock(&self.inner.core);
        if core.role == Some(Role::Answerer) {
            return Err(EngineError::InvalidState("session is answering an offer"));
        }
        core.role = Some(Role::Offerer);
        core.local = Some(offer);
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), EngineError> {
        if self.inner.current().is_terminal() {
            return Err(EngineError::SessionClosed);
        }
        let answer = Description::encode(DescriptionKind::Answer, self.inner.endpoint)?;
        let mut core = lock(&self.inner.core);
        if core.role != Some(Role::Answerer) {
            return Err(EngineError::InvalidState("no remote offer applied"));
        }
        core.local = Some(answer);
        Ok(())
    }

    async fn gathering_complete(&self) -> Result<(), EngineError> {
        if lock(&self.inner.core).local.is_some() {
            Ok(())
        } else {
            Err(EngineError::InvalidState("no local description"))
        }
    }

    async fn local_description(&self) -> Option<Bytes> {
        lock(&self.inner.core).local.clone()
    }

    async fn set_remote_description(&self, description: Bytes) -> Result<(), EngineError> {
        if self.inner.current().is_terminal() {
            return Err(EngineError::SessionClosed);
        }
        let remote = Description::decode(&description)?;
        match remote.kind {
            DescriptionKind::Offer => {
                {
                    let mut core = lock(&self.inner.core);
                    if core.role.is_some() {
                        return Err(EngineError::InvalidState(
                            "remote offer on a negotiated session",
                        ));
                    }
                    core.role = Some(Role::Answerer);
                }
                self.inner.set_state(SessionState::Connecting);
                Ok(())
            }
            DescriptionKind::Answer => {
                {
                    let core = lock(&self.inner.core);
                    if core.role != Some(Role::Offerer) || core.local.is_none() {
                        return Err(EngineError::InvalidState("answer without a local offer"));
                    }
                    if core.peer.is_some() {
                        return Err(EngineError::InvalidState("answer already applied"));
                    }
                }
                let peer = self
                    .inner
                    .network
                    .upgrade()
                    .and_then(|network| network.lookup(remote.endpoint))
                    .ok_or(EngineError::SessionClosed)?;
                if lock(&peer.core).role != Some(Role::Answerer) {
                    return Err(EngineError::InvalidState("remote endpoint is not answering"));
                }
                self.inner.set_state(SessionState::Connecting);
                self.inner.connect(peer)
            }
        }
    }

    async fn selected_path(&self) -> Option<(SocketAddr, SocketAddr)> {
        if self.inner.current() != SessionState::Connected {
            return None;
        }
        let peer = self.inner.peer()?;
        Some((self.inner.path(), peer.path()))
    }

    async fn close(&self) {
        self.inner.shutdown(SessionState::Closed);
    }
}

// ── Channels ──────────────────────────────────────────────────────────────────

struct ChannelInner {
    label: String,
    id: u16,
    state: watch::Sender<ChannelState>,
    linked: AtomicBool,
    detached: AtomicBool,
    inbox_tx: mpsc::Sender<Bytes>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    peer: Mutex<Weak<ChannelInner>>,
}

impl ChannelInner {
    fn new(label: &str, id: u16) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        Arc::new(Self {
            label: label.to_string(),
            id,
            state: watch::channel(ChannelState::Connecting).0,
            linked: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            peer: Mutex::new(Weak::new()),
        })
    }

    fn current(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn pair(a: &Arc<ChannelInner>, b: &Arc<ChannelInner>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
        a.open();
        b.open();
    }

    fn open(&self) {
        self.state.send_if_modified(|state| {
            if *state != ChannelState::Connecting {
                return false;
            }
            *state = ChannelState::Open;
            true
        });
    }

    fn peer(&self) -> Option<Arc<ChannelInner>> {
        lock(&self.peer).upgrade()
    }

    /// Close this half and the remote one.
    fn shut(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Closed {
                return false;
            }
            *state = ChannelState::Closed;
            true
        });
        if changed {
            if let Some(peer) = self.peer() {
                peer.shut();
            }
        }
    }
}

struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.inner.label
    }

    fn id(&self) -> u16 {
        self.inner.id
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    async fn detach(&self) -> Result<Arc<dyn RawStream>, EngineError> {
        if self.inner.current() != ChannelState::Open {
            return Err(EngineError::InvalidState("channel not open"));
        }
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return Err(EngineError::InvalidState("channel already detached"));
        }
        Ok(Arc::new(MemoryStream {
            inner: self.inner.clone(),
        }))
    }
}

struct MemoryStream {
    inner: Arc<ChannelInner>,
}

#[async_trait]
impl RawStream for MemoryStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let mut inbox = self.inner.inbox_rx.lock().await;
        // Queued messages are delivered before the close is reported.
        let message = tokio::select! {
            biased;
            message = inbox.recv() => message,
            _ = channel_closed(self.inner.state.subscribe()) => None,
        };
        match message {
            None => Ok(0),
            Some(message) if message.len() > buf.len() => Err(EngineError::ShortBuffer),
            Some(message) => {
                buf[..message.len()].copy_from_slice(&message);
                Ok(message.len())
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, EngineError> {
        if self.inner.current() != ChannelState::Open {
            return Err(EngineError::ChannelClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let peer = self.inner.peer().ok_or(EngineError::ChannelClosed)?;
        let outbox = peer.inbox_tx.clone();
        drop(peer);
        tokio::select! {
            sent = outbox.send(Bytes::copy_from_slice(buf)) => {
                sent.map_err(|_| EngineError::ChannelClosed)?;
            }
            _ = channel_closed(self.inner.state.subscribe()) => {
                return Err(EngineError::ChannelClosed);
            }
        }
        Ok(buf.len())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.shut();
        Ok(())
    }
}
