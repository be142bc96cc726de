//! Error types surfaced by dialers, listeners and connections.

use std::fmt;

use crate::wire::MAX_MESSAGE_SIZE;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("context cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("signaling failed during {phase}: {source}")]
    Signaling {
        phase: Phase,
        #[source]
        source: SignalError,
    },

    #[error("negotiation failed during {phase}: {source}")]
    Negotiation {
        phase: Phase,
        #[source]
        source: EngineError,
    },

    #[error("cached session is unavailable")]
    SessionUnavailable,

    #[error("stream closed")]
    StreamClosed,

    #[error("payload length {0} exceeds maximum {}", MAX_MESSAGE_SIZE)]
    PayloadTooLarge(usize),

    #[error("short buffer: copied {copied} of {len} bytes")]
    ShortBuffer { copied: usize, len: usize },

    #[error("deadline is in the past")]
    DeadlineInPast,

    #[error("listener closed")]
    ListenerClosed,

    #[error("invalid listener transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn signaling(phase: Phase, source: SignalError) -> Self {
        Error::Signaling { phase, source }
    }

    pub fn negotiation(phase: Phase, source: EngineError) -> Self {
        Error::Negotiation { phase, source }
    }

    /// Phase tag of a signaling or negotiation failure.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Signaling { phase, .. } | Error::Negotiation { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Step of session establishment a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    SessionCreate,
    ChannelOpen,
    OfferCreate,
    AnswerCreate,
    Gather,
    Decode,
    OfferApply,
    AnswerApply,
    Detach,
    OfferSend,
    OfferReceive,
    AnswerSend,
    AnswerReceive,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::SessionCreate => "session-create",
            Phase::ChannelOpen => "channel-open",
            Phase::OfferCreate => "offer-create",
            Phase::AnswerCreate => "answer-create",
            Phase::Gather => "gather",
            Phase::Decode => "decode",
            Phase::OfferApply => "offer-apply",
            Phase::AnswerApply => "answer-apply",
            Phase::Detach => "detach",
            Phase::OfferSend => "offer-send",
            Phase::OfferReceive => "offer-receive",
            Phase::AnswerSend => "answer-send",
            Phase::AnswerReceive => "answer-receive",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by a signaling backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// No answer has been posted yet; poll again.
    #[error("answer not ready")]
    AnswerNotReady,

    #[error("no pending offer with id {0:016x}")]
    UnknownOffer(u64),

    #[error("signal closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

/// Failures reported by a session engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("session closed")]
    SessionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("malformed description: {0}")]
    Decode(String),

    #[error("buffer too small for message")]
    ShortBuffer,

    #[error("{0}")]
    Backend(String),
}
