// src/events.rs
//
// Event bus for a call session.
//
// Every meaningful state change seen by the local session (peers joining or
// leaving, per-peer negotiation state, remote streams, chat, notes) is
// represented as a `CallEvent`.  A single `EventBus` backed by a
// `tokio::sync::broadcast` channel fans each event out to every consumer:
// the UI layer, the headless binary's log printer, and tests.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.joined")]
    SessionJoined,
    #[serde(rename = "session.left")]
    SessionLeft,
    #[serde(rename = "peer.joined")]
    PeerJoined,
    #[serde(rename = "peer.left")]
    PeerLeft,
    #[serde(rename = "peer.state_changed")]
    PeerStateChanged,
    #[serde(rename = "negotiation.stalled")]
    NegotiationStalled,
    #[serde(rename = "renegotiation.started")]
    RenegotiationStarted,
    #[serde(rename = "stream.added")]
    StreamAdded,
    #[serde(rename = "stream.removed")]
    StreamRemoved,
    #[serde(rename = "chat.received")]
    ChatReceived,
    #[serde(rename = "notes.updated")]
    NotesUpdated,
    #[serde(rename = "notes.failed")]
    NotesFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionJoined => "session.joined",
            Self::SessionLeft => "session.left",
            Self::PeerJoined => "peer.joined",
            Self::PeerLeft => "peer.left",
            Self::PeerStateChanged => "peer.state_changed",
            Self::NegotiationStalled => "negotiation.stalled",
            Self::RenegotiationStarted => "renegotiation.started",
            Self::StreamAdded => "stream.added",
            Self::StreamRemoved => "stream.removed",
            Self::ChatReceived => "chat.received",
            Self::NotesUpdated => "notes.updated",
            Self::NotesFailed => "notes.failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    pub room_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPayload {
    pub room_id: String,
    pub peer_id: String,
    /// "initiator" | "responder"
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub room_id: String,
    pub peer_id: String,
    pub kind: String, // "audio" | "video"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub room_id: String,
    pub peer_id: String,
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesPayload {
    pub room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Type-safe union of all possible payloads.
///
/// Untagged, so decoding tries variants in order: most required fields
/// first, or a richer payload would decode as a `Session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Chat(ChatPayload),
    Peer(PeerPayload),
    Stream(StreamPayload),
    Session(SessionPayload),
    Notes(NotesPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event.
///
/// ```json
/// {
///   "id":         "evt_a1b2c3d4",
///   "type":       "peer.joined",
///   "created_at": "2025-06-15T14:22:33.123Z",
///   "data": { "room_id": "R1", "peer_id": "...", "role": "initiator" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    /// Unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub created_at: DateTime<Utc>,

    pub data: EventPayload,
}

impl CallEvent {
    // ── Constructors ────────────────────────────────────────────────────

    pub fn session_joined(room_id: &str, peer_id: &str) -> Self {
        Self::new(
            EventType::SessionJoined,
            EventPayload::Session(SessionPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
            }),
        )
    }

    pub fn session_left(room_id: &str, peer_id: &str) -> Self {
        Self::new(
            EventType::SessionLeft,
            EventPayload::Session(SessionPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
            }),
        )
    }

    pub fn peer_joined(room_id: &str, peer_id: &str, role: &str) -> Self {
        Self::peer(EventType::PeerJoined, room_id, peer_id, role, None, None)
    }

    pub fn peer_left(room_id: &str, peer_id: &str, role: &str, reason: &str) -> Self {
        Self::peer(
            EventType::PeerLeft,
            room_id,
            peer_id,
            role,
            None,
            Some(reason.to_string()),
        )
    }

    pub fn peer_state_changed(room_id: &str, peer_id: &str, role: &str, state: &str) -> Self {
        Self::peer(
            EventType::PeerStateChanged,
            room_id,
            peer_id,
            role,
            Some(state.to_string()),
            None,
        )
    }

    pub fn negotiation_stalled(room_id: &str, peer_id: &str, role: &str, state: &str) -> Self {
        Self::peer(
            EventType::NegotiationStalled,
            room_id,
            peer_id,
            role,
            Some(state.to_string()),
            None,
        )
    }

    pub fn renegotiation_started(room_id: &str, peer_id: &str, role: &str) -> Self {
        Self::peer(EventType::RenegotiationStarted, room_id, peer_id, role, None, None)
    }

    pub fn stream_added(room_id: &str, peer_id: &str, kind: &str) -> Self {
        Self::new(
            EventType::StreamAdded,
            EventPayload::Stream(StreamPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                kind: kind.to_string(),
            }),
        )
    }

    pub fn stream_removed(room_id: &str, peer_id: &str) -> Self {
        Self::new(
            EventType::StreamRemoved,
            EventPayload::Stream(StreamPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                kind: "audio+video".to_string(),
            }),
        )
    }

    pub fn chat_received(room_id: &str, peer_id: &str, label: &str, text: &str) -> Self {
        Self::new(
            EventType::ChatReceived,
            EventPayload::Chat(ChatPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                label: label.to_string(),
                text: text.to_string(),
            }),
        )
    }

    pub fn notes_updated(room_id: &str) -> Self {
        Self::new(
            EventType::NotesUpdated,
            EventPayload::Notes(NotesPayload {
                room_id: room_id.to_string(),
                error: None,
            }),
        )
    }

    pub fn notes_failed(room_id: &str, error: &str) -> Self {
        Self::new(
            EventType::NotesFailed,
            EventPayload::Notes(NotesPayload {
                room_id: room_id.to_string(),
                error: Some(error.to_string()),
            }),
        )
    }

    // ── Private ─────────────────────────────────────────────────────────

    fn peer(
        event_type: EventType,
        room_id: &str,
        peer_id: &str,
        role: &str,
        state: Option<String>,
        reason: Option<String>,
    ) -> Self {
        Self::new(
            event_type,
            EventPayload::Peer(PeerPayload {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                role: role.to_string(),
                state,
                reason,
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    pub fn room_id(&self) -> &str {
        match &self.data {
            EventPayload::Session(p) => &p.room_id,
            EventPayload::Peer(p) => &p.room_id,
            EventPayload::Stream(p) => &p.room_id,
            EventPayload::Chat(p) => &p.room_id,
            EventPayload::Notes(p) => &p.room_id,
        }
    }

    /// Remote peer the event is about, if any.
    pub fn peer_id(&self) -> Option<&str> {
        match &self.data {
            EventPayload::Peer(p) => Some(&p.peer_id),
            EventPayload::Stream(p) => Some(&p.peer_id),
            EventPayload::Chat(p) => Some(&p.peer_id),
            EventPayload::Session(_) | EventPayload::Notes(_) => None,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `CallEvent`.
///
/// Receivers that lag more than the capacity skip events
/// (`broadcast::RecvError::Lagged`).  Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event.  Returns the number of receivers that will get it;
    /// having none is normal.
    pub fn emit(&self, event: CallEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serialization() {
        let json = serde_json::to_string(&EventType::PeerJoined).unwrap();
        assert_eq!(json, "\"peer.joined\"");

        let parsed: EventType = serde_json::from_str("\"renegotiation.started\"").unwrap();
        assert_eq!(parsed, EventType::RenegotiationStarted);
    }

    #[test]
    fn event_envelope_json() {
        let evt = CallEvent::peer_joined("R1", "peer-7", "initiator");
        let json = serde_json::to_string_pretty(&evt).unwrap();
        assert!(json.contains("\"type\": \"peer.joined\""));
        assert!(json.contains("\"room_id\": \"R1\""));
        assert!(!json.contains("\"state\""));
        assert!(evt.id.starts_with("evt_"));
    }

    #[test]
    fn payloads_decode_as_their_own_variant() {
        let decode = |evt: CallEvent| -> EventPayload {
            let json = serde_json::to_string(&evt).unwrap();
            serde_json::from_str::<CallEvent>(&json).unwrap().data
        };

        match decode(CallEvent::chat_received("R1", "peer-1", "ana", "hi")) {
            EventPayload::Chat(p) => assert_eq!(p.text, "hi"),
            other => panic!("chat decoded as {other:?}"),
        }
        match decode(CallEvent::peer_left("R1", "peer-2", "responder", "departed")) {
            EventPayload::Peer(p) => assert_eq!(p.reason.as_deref(), Some("departed")),
            other => panic!("peer event decoded as {other:?}"),
        }
        match decode(CallEvent::stream_added("R1", "peer-2", "video")) {
            EventPayload::Stream(p) => assert_eq!(p.kind, "video"),
            other => panic!("stream event decoded as {other:?}"),
        }
        assert!(matches!(
            decode(CallEvent::session_left("R1", "me")),
            EventPayload::Session(_)
        ));
        match decode(CallEvent::notes_failed("R1", "timeout")) {
            EventPayload::Notes(p) => assert_eq!(p.error.as_deref(), Some("timeout")),
            other => panic!("notes event decoded as {other:?}"),
        }
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let n = bus.emit(CallEvent::session_joined("R1", "me"));
        assert_eq!(n, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
    }

    #[test]
    fn emit_without_receivers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(CallEvent::notes_updated("R1")), 0);
    }

    #[test]
    fn accessors() {
        let e = CallEvent::stream_added("R9", "peer-3", "video");
        assert_eq!(e.room_id(), "R9");
        assert_eq!(e.peer_id(), Some("peer-3"));

        let e = CallEvent::notes_failed("R9", "timeout");
        assert_eq!(e.peer_id(), None);
    }
}
