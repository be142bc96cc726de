//! peerlink-core — shared error types, limits and configuration.
//! The peerlink crate depends on this one.

pub mod config;
pub mod error;
pub mod wire;

pub use config::PeerlinkConfig;
pub use error::{EngineError, Error, Phase, Result, SignalError};
