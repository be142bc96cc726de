//! One configuration, one engine, one optional signal; dialers and listeners built from them.

use std::sync::Arc;

use peerlink_core::config::{ConfigError, PeerlinkConfig};

use crate::dialer::Dialer;
use crate::engine::Engine;
use crate::listener::Listener;
use crate::signal::Signal;

#[derive(Clone)]
pub struct Transport {
    config: PeerlinkConfig,
    engine: Arc<dyn Engine>,
    signal: Option<Arc<dyn Signal>>,
}

impl Transport {
    pub fn new(config: PeerlinkConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            config,
            engine,
            signal: None,
        }
    }

    /// Build from the config file and `PEERLINK_*` environment.
    pub fn from_env(engine: Arc<dyn Engine>) -> Result<Self, ConfigError> {
        Ok(Self::new(PeerlinkConfig::load()?, engine))
    }

    /// Exchange offers and answers through `signal` instead of manually.
    pub fn with_signal(mut self, signal: Arc<dyn Signal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn config(&self) -> &PeerlinkConfig {
        &self.config
    }

    pub fn dialer(&self) -> Dialer {
        Dialer::new(
            self.engine.clone(),
            self.config.engine.clone(),
            self.signal.clone(),
            &self.config.dialer,
        )
    }

    /// A listener in the `New` state; call `start` to serve offers.
    pub fn listener(&self) -> Listener {
        Listener::new(
            self.engine.clone(),
            self.config.engine.clone(),
            self.signal.clone(),
            &self.config.listener,
        )
    }
}
