use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CallError;

// ---------------------------------------------------------------------------
// RoomId
// ---------------------------------------------------------------------------

/// Opaque room identifier.  A room is created implicitly by the first peer
/// that references it and simply empties when the last peer leaves.
///
/// Only `[A-Za-z0-9_.-]` is accepted so that store paths (and Redis glob
/// patterns built from them) stay unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub const MAX_LEN: usize = 128;

    pub fn new(raw: impl Into<String>) -> Result<Self, CallError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(CallError::InvalidRoom(raw));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(CallError::InvalidRoom(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Process-generated token identifying one participant's presence in a room
/// for the duration of one session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Fresh identity for a new join.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an identity observed in the store.  Returns `None` for values that
    /// could not have been produced by `generate` (empty or containing a path
    /// separator).
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.contains('/') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used as a default chat label and in log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Negotiation role for one peer pair.
///
/// The peer whose identity sorts lower initiates (sends the first offer); the
/// other waits for it.  Both sides compute the same answer from the same two
/// identities, so there is no glare on first contact.  The role is also kept
/// for collision handling during renegotiation: the initiator ignores a
/// colliding offer, the responder rolls its own back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn assign(local: &PeerId, remote: &PeerId) -> Role {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TrackSource / TrackKind
// ---------------------------------------------------------------------------

/// Where an outgoing track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

// ---------------------------------------------------------------------------
// RoomPaths -- store layout
// ---------------------------------------------------------------------------

/// Signaling message kind, doubling as the store path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn segment(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offers",
            SignalKind::Answer => "answers",
            SignalKind::Candidate => "candidates",
        }
    }
}

/// Path builder for everything a room keeps in the rendezvous store.
///
/// ```text
/// rooms/{room}/peers/{peer}
/// rooms/{room}/offers/{from}/{to}
/// rooms/{room}/answers/{from}/{to}
/// rooms/{room}/candidates/{from}/{to}/{seq}
/// rooms/{room}/chat/{peer}/{seq}
/// ```
#[derive(Debug, Clone)]
pub struct RoomPaths {
    root: String,
}

impl RoomPaths {
    pub fn new(room: &RoomId) -> Self {
        Self {
            root: format!("rooms/{}", room.as_str()),
        }
    }

    pub fn peers_prefix(&self) -> String {
        format!("{}/peers/", self.root)
    }

    pub fn peer(&self, peer: &PeerId) -> String {
        format!("{}/peers/{}", self.root, peer)
    }

    pub fn signal_prefix(&self, kind: SignalKind) -> String {
        format!("{}/{}/", self.root, kind.segment())
    }

    /// Everything `from` has written of one kind, across all recipients.
    pub fn signal_outbox(&self, kind: SignalKind, from: &PeerId) -> String {
        format!("{}/{}/{}", self.root, kind.segment(), from)
    }

    pub fn signal_pair(&self, kind: SignalKind, from: &PeerId, to: &PeerId) -> String {
        format!("{}/{}/{}/{}", self.root, kind.segment(), from, to)
    }

    pub fn candidate(&self, from: &PeerId, to: &PeerId, seq: u64) -> String {
        format!("{}/{:012}", self.signal_pair(SignalKind::Candidate, from, to), seq)
    }

    pub fn chat_prefix(&self) -> String {
        format!("{}/chat/", self.root)
    }

    pub fn chat_outbox(&self, from: &PeerId) -> String {
        format!("{}/chat/{}", self.root, from)
    }

    pub fn chat_message(&self, from: &PeerId, seq: u64) -> String {
        format!("{}/chat/{}/{:012}", self.root, from, seq)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
