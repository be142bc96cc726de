//! Listener-side session pool.
//!
//! Every mutation happens under one async lock. The active-stream count of a
//! session is published on a `watch` channel updated under that lock, so the
//! idle reaper observes the same value the pool does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Mutex};

use crate::engine::EngineSession;

struct PooledSession {
    session: Arc<dyn EngineSession>,
    active: watch::Sender<usize>,
    streams: HashSet<u16>,
}

struct PoolState {
    sessions: HashMap<u64, PooledSession>,
    rng: StdRng,
}

pub(crate) struct SessionPool {
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Insert `session` under a fresh id. Returns the id and the active-stream counter.
    pub(crate) async fn insert(
        &self,
        session: Arc<dyn EngineSession>,
    ) -> (u64, watch::Receiver<usize>) {
        let mut state = self.state.lock().await;
        let id = loop {
            let candidate: u64 = state.rng.gen();
            if !state.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let (active, active_rx) = watch::channel(0);
        state.sessions.insert(
            id,
            PooledSession {
                session,
                active,
                streams: HashSet::new(),
            },
        );
        (id, active_rx)
    }

    /// Record an open stream. False if the session has left the pool.
    pub(crate) async fn track_stream(&self, id: u64, stream: u16) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&id) {
            Some(pooled) => {
                pooled.streams.insert(stream);
                pooled.active.send_replace(pooled.streams.len());
                true
            }
            None => false,
        }
    }

    pub(crate) async fn release_stream(&self, id: u64, stream: u16) {
        let mut state = self.state.lock().await;
        if let Some(pooled) = state.sessions.get_mut(&id) {
            if pooled.streams.remove(&stream) {
                pooled.active.send_replace(pooled.streams.len());
            }
        }
    }

    /// Remove a session. Returns it with the number of sessions left.
    pub(crate) async fn remove(&self, id: u64) -> Option<(Arc<dyn EngineSession>, usize)> {
        let mut state = self.state.lock().await;
        let pooled = state.sessions.remove(&id)?;
        Some((pooled.session, state.sessions.len()))
    }

    /// Remove a session only if it carries no streams.
    pub(crate) async fn remove_if_idle(&self, id: u64) -> Option<Arc<dyn EngineSession>> {
        let mut state = self.state.lock().await;
        if !state.sessions.get(&id)?.streams.is_empty() {
            return None;
        }
        state.sessions.remove(&id).map(|pooled| pooled.session)
    }

    /// Empty the pool, returning every session it held.
    pub(crate) async fn drain(&self) -> Vec<Arc<dyn EngineSession>> {
        let mut state = self.state.lock().await;
        state
            .sessions
            .drain()
            .map(|(_, pooled)| pooled.session)
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}
