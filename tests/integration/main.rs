//! peerlink integration test harness.
//!
//! Dialers and listeners run against an in-process `MemoryNetwork`, wired
//! through a `DebugSignal` unless a test exchanges descriptions by hand.
//!
//!   RUST_LOG=peerlink=debug cargo test --test integration
//!
//! Every test builds its own network; nothing is shared between tests.

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{ensure, Result};
use peerlink::config::PeerlinkConfig;
use peerlink::{Conn, DebugSignal, Dialer, Listener, MemoryNetwork, Transport};
use tokio::time::Instant;

mod dialing;
mod lifecycle;
mod manual;
mod streams;

// ── Harness ───────────────────────────────────────────────────────────────────

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One dialer and one listener sharing a network and a signal.
pub struct Harness {
    pub network: MemoryNetwork,
    pub signal: Arc<DebugSignal>,
    pub dialer: Dialer,
    pub listener: Listener,
}

pub fn harness(config: PeerlinkConfig) -> Harness {
    harness_with_signal(config, DebugSignal::new(16))
}

pub fn harness_with_signal(config: PeerlinkConfig, signal: DebugSignal) -> Harness {
    init_tracing();
    let network = MemoryNetwork::new();
    let signal = Arc::new(signal);
    let transport =
        Transport::new(config, Arc::new(network.engine())).with_signal(signal.clone());
    Harness {
        dialer: transport.dialer(),
        listener: transport.listener(),
        network,
        signal,
    }
}

/// Defaults with session reuse switched on or off.
pub fn config(reuse_session: bool) -> PeerlinkConfig {
    let mut config = PeerlinkConfig::default();
    config.dialer.reuse_session = reuse_session;
    config
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Write `message` on `from` and check `to` reads exactly it.
pub async fn roundtrip(from: &Conn, to: &Conn, message: &[u8]) -> Result<()> {
    let written = from.write(message).await?;
    ensure!(written == message.len(), "short write: {written} of {}", message.len());

    to.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)))?;
    let mut buf = vec![0u8; message.len().max(1)];
    let n = to.read(&mut buf).await?;
    to.set_read_deadline(None)?;
    ensure!(&buf[..n] == message, "read {n} bytes that differ from what was written");
    Ok(())
}
