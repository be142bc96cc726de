//! Limits and timing constants shared by every peerlink component.
//!
//! A stream carries discrete messages. Offer and answer blobs are opaque to
//! the core; only the engine that produced them knows their encoding.

use std::time::Duration;

use crate::error::Error;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Largest message a single write may carry, and the size of the buffer
/// used for each raw read.
pub const MAX_MESSAGE_SIZE: usize = 65535;

// ── Timing ────────────────────────────────────────────────────────────────────

/// Interval between `read_answer` polls while the answer is not ready.
pub const ANSWER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a suspended or not-yet-started accept loop sleeps between status checks.
pub const SUSPENDED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Check a payload against `MAX_MESSAGE_SIZE`.
pub fn ensure_payload_len(len: usize) -> Result<(), Error> {
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::PayloadTooLarge(len));
    }
    Ok(())
}
