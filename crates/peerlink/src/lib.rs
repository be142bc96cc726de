//! peerlink — stream sockets over peer-to-peer multiplexed sessions.
//!
//! A `Dialer` negotiates sessions with offer/answer signaling and hands out
//! one `Conn` per stream; a `Listener` answers offers and yields the remote
//! side's streams from `accept`. The session engine sits behind the traits in
//! `engine`.

pub mod conn;
pub mod context;
pub mod dialer;
pub mod engine;
pub mod listener;
mod pool;
pub mod signal;
pub mod transport;

pub use conn::Conn;
pub use context::{CancelHandle, Context};
pub use dialer::Dialer;
pub use engine::{MemoryEngine, MemoryNetwork};
pub use listener::{Listener, Status};
pub use peerlink_core::{config, wire, EngineError, Error, Phase, Result, SignalError};
pub use signal::{DebugSignal, Signal};
pub use transport::Transport;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
