use std::time::Duration;

use crate::room::PeerId;

// ─── StoreError ─────────────────────────────────────────────────────────────

/// Failure talking to the rendezvous store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store connection closed")]
    Closed,

    #[error("store write rejected: {0}")]
    Rejected(String),
}

// ─── CallError ──────────────────────────────────────────────────────────────

/// Every failure the call orchestrator can surface.
///
/// Only `CaptureDenied` is fatal to a join.  Per-peer failures
/// (`NegotiationStalled`, `Link`) never leave the peer pair they belong to,
/// and `SummarizationFailed` leaves the previous digest in place.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("local media capture denied: {0}")]
    CaptureDenied(String),

    #[error("negotiation with peer {peer} stalled after {waited:?}")]
    NegotiationStalled { peer: PeerId, waited: Duration },

    #[error("signaling write to '{path}' failed: {source}")]
    SignalingWriteFailed {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("notes summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("peer link: {0}")]
    Link(String),

    #[error("malformed signaling record at '{path}': {reason}")]
    MalformedSignal { path: String, reason: String },

    #[error("invalid room id '{0}'")]
    InvalidRoom(String),

    #[error("already joined room '{0}'")]
    AlreadyJoined(String),

    #[error("not in a room")]
    NotJoined,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallError {
    /// Stable machine-readable code, used in events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CaptureDenied(_) => "capture_denied",
            Self::NegotiationStalled { .. } => "negotiation_stalled",
            Self::SignalingWriteFailed { .. } => "signaling_write_failed",
            Self::SummarizationFailed(_) => "summarization_failed",
            Self::Link(_) => "peer_link_error",
            Self::MalformedSignal { .. } => "malformed_signal",
            Self::InvalidRoom(_) => "invalid_room",
            Self::AlreadyJoined(_) => "already_joined",
            Self::NotJoined => "not_joined",
            Self::Cancelled => "cancelled",
            Self::Store(_) => "store_error",
        }
    }

    /// `true` when the error ends the session (or prevents it from starting).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CaptureDenied(_))
    }

    pub fn link(err: impl std::fmt::Display) -> Self {
        Self::Link(err.to_string())
    }
}

pub type CallResult<T> = Result<T, CallError>;

// ─── Tests ──────────────────────────────────────────────────────────────────
