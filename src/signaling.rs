// src/signaling.rs
//
// Signaling channel.
//
// Negotiation messages travel through the rendezvous store, addressed by the
// ordered (sender, recipient) pair:
//
//   rooms/{room}/offers/{from}/{to}            latest offer, overwritten
//   rooms/{room}/answers/{from}/{to}           latest answer, overwritten
//   rooms/{room}/candidates/{from}/{to}/{seq}  one entry per candidate
//
// Every record is a JSON envelope
//
//   { "generation": 7, "sent_at": "...", "payload": { "type": "offer", "sdp": "..." } }
//
// and is validated here: a payload that does not decode, or whose tag does
// not match the path it was found under, is dropped with a warning and never
// reaches the peer state machine.
//
// Offers carry a generation from a per-session counter so a newer offer
// always supersedes an older one.  An answer echoes the generation of the
// offer it answers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CallError, CallResult, StoreError};
use crate::room::{PeerId, RoomId, RoomPaths, SignalKind};
use crate::store::{RendezvousStore, Snapshot};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A trickled network path candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NegotiationPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl NegotiationPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            NegotiationPayload::Offer { .. } => SignalKind::Offer,
            NegotiationPayload::Answer { .. } => SignalKind::Answer,
            NegotiationPayload::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// Stored envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub generation: u64,
    pub sent_at: DateTime<Utc>,
    pub payload: NegotiationPayload,
}

/// A validated message addressed to the local peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationMessage {
    pub room: RoomId,
    pub from: PeerId,
    pub to: PeerId,
    /// Offer generation for offers and answers, sequence for candidates.
    pub generation: u64,
    pub payload: NegotiationPayload,
}

/// Decode a record found at `path` under the `kind` prefix.
pub fn decode_record(path: &str, kind: SignalKind, raw: &str) -> CallResult<SignalRecord> {
    let record: SignalRecord =
        serde_json::from_str(raw).map_err(|e| CallError::MalformedSignal {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    if record.payload.kind() != kind {
        return Err(CallError::MalformedSignal {
            path: path.to_string(),
            reason: format!(
                "{} payload under {}",
                record.payload.kind().segment(),
                kind.segment()
            ),
        });
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// SignalingChannel
// ---------------------------------------------------------------------------

/// Signaling for one local identity in one room.  Cheap to clone; clones
/// share the generation and candidate counters.
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn RendezvousStore>,
    room: RoomId,
    paths: RoomPaths,
    self_id: PeerId,
    generation: Arc<AtomicU64>,
    candidate_seq: Arc<AtomicU64>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn RendezvousStore>, room: RoomId, self_id: PeerId) -> Self {
        let paths = RoomPaths::new(&room);
        Self {
            store,
            room,
            paths,
            self_id,
            generation: Arc::new(AtomicU64::new(0)),
            candidate_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish an offer to `to` and return its generation.
    pub async fn send_offer(&self, to: &PeerId, sdp: String) -> CallResult<u64> {
        let generation = self.next_generation();
        let path = self.paths.signal_pair(SignalKind::Offer, &self.self_id, to);
        self.write(path, generation, NegotiationPayload::Offer { sdp }).await?;
        Ok(generation)
    }

    /// Publish an answer to the offer of `generation` from `to`.
    pub async fn send_answer(&self, to: &PeerId, sdp: String, generation: u64) -> CallResult<()> {
        let path = self.paths.signal_pair(SignalKind::Answer, &self.self_id, to);
        self.write(path, generation, NegotiationPayload::Answer { sdp }).await
    }

    pub async fn send_candidate(&self, to: &PeerId, candidate: IceCandidate) -> CallResult<()> {
        let seq = self.candidate_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.paths.candidate(&self.self_id, to, seq);
        self.write(path, seq, NegotiationPayload::Candidate(candidate)).await
    }

    async fn write(&self, path: String, generation: u64, payload: NegotiationPayload) -> CallResult<()> {
        let kind = payload.kind();
        let record = SignalRecord {
            generation,
            sent_at: Utc::now(),
            payload,
        };
        let value = serde_json::to_string(&record).map_err(|e| CallError::SignalingWriteFailed {
            path: path.clone(),
            source: StoreError::Rejected(e.to_string()),
        })?;
        self.store
            .set(&path, value)
            .await
            .map_err(|source| CallError::SignalingWriteFailed {
                path: path.clone(),
                source,
            })?;
        debug!(room = %self.room, path = %path, generation, kind = kind.segment(), "signal sent");
        Ok(())
    }

    pub fn subscribe_offers(&self) -> BoxStream<'static, NegotiationMessage> {
        self.subscribe(SignalKind::Offer)
    }

    pub fn subscribe_answers(&self) -> BoxStream<'static, NegotiationMessage> {
        self.subscribe(SignalKind::Answer)
    }

    pub fn subscribe_candidates(&self) -> BoxStream<'static, NegotiationMessage> {
        self.subscribe(SignalKind::Candidate)
    }

    /// Messages of `kind` addressed to the local peer, each at most once.
    fn subscribe(&self, kind: SignalKind) -> BoxStream<'static, NegotiationMessage> {
        let prefix = self.paths.signal_prefix(kind);
        let mut snapshots = self.store.watch(&prefix);
        let mut inbox = Inbox::new(kind, self.room.clone(), self.self_id.clone(), prefix);

        Box::pin(async_stream::stream! {
            while let Some(snapshot) = snapshots.next().await {
                for message in inbox.accept(snapshot) {
                    yield message;
                }
            }
        })
    }

    /// Arm removal of everything this peer writes (signals and chat) for
    /// when the store connection drops.
    pub async fn register_disconnect_cleanup(&self) -> Result<(), StoreError> {
        for path in self.outboxes() {
            self.store.remove_on_disconnect(&path).await?;
        }
        Ok(())
    }

    /// Remove everything this peer wrote.  Failures are logged.
    pub async fn clear_outgoing(&self) {
        for path in self.outboxes() {
            if let Err(e) = self.store.cancel_on_disconnect(&path).await {
                warn!(room = %self.room, path = %path, "could not disarm disconnect cleanup: {e}");
            }
            if let Err(e) = self.store.remove(&path).await {
                warn!(room = %self.room, path = %path, "could not remove outgoing signals: {e}");
            }
        }
    }

    /// Remove what this peer wrote to `to`.  Failures are logged.
    pub async fn clear_pair(&self, to: &PeerId) {
        for kind in [SignalKind::Offer, SignalKind::Answer, SignalKind::Candidate] {
            let path = self.paths.signal_pair(kind, &self.self_id, to);
            if let Err(e) = self.store.remove(&path).await {
                warn!(room = %self.room, path = %path, "could not clear signals: {e}");
            }
        }
    }

    fn outboxes(&self) -> Vec<String> {
        vec![
            self.paths.signal_outbox(SignalKind::Offer, &self.self_id),
            self.paths.signal_outbox(SignalKind::Answer, &self.self_id),
            self.paths.signal_outbox(SignalKind::Candidate, &self.self_id),
            self.paths.chat_outbox(&self.self_id),
        ]
    }
}

// ---------------------------------------------------------------------------
// Inbox -- snapshot to message filtering
// ---------------------------------------------------------------------------

/// Turns full snapshots of one signal prefix into the messages that are new
/// for the local peer.
struct Inbox {
    kind: SignalKind,
    room: RoomId,
    self_id: PeerId,
    prefix: String,
    /// Offers and answers: highest generation delivered per sender.
    last_generation: HashMap<PeerId, u64>,
    /// Candidates: relative keys already delivered.
    seen: HashSet<String>,
    /// Malformed values already reported, by relative key.
    rejected: HashMap<String, String>,
}

impl Inbox {
    fn new(kind: SignalKind, room: RoomId, self_id: PeerId, prefix: String) -> Self {
        Self {
            kind,
            room,
            self_id,
            prefix,
            last_generation: HashMap::new(),
            seen: HashSet::new(),
            rejected: HashMap::new(),
        }
    }

    fn accept(&mut self, snapshot: Snapshot) -> Vec<NegotiationMessage> {
        let mut out = Vec::new();

        if self.kind == SignalKind::Candidate {
            // Forget keys that are gone so the set stays bounded.
            self.seen.retain(|k| snapshot.contains_key(k));
        }
        self.rejected.retain(|k, _| snapshot.contains_key(k));

        for (key, raw) in &snapshot {
            let mut parts = key.split('/');
            let (from, to) = match (parts.next().and_then(PeerId::parse), parts.next()) {
                (Some(from), Some(to)) => (from, to),
                _ => continue,
            };
            if to != self.self_id.as_str() || from == self.self_id {
                continue;
            }
            if self.kind == SignalKind::Candidate && self.seen.contains(key) {
                continue;
            }

            let path = format!("{}{}", self.prefix, key);
            let record = match decode_record(&path, self.kind, raw) {
                Ok(record) => record,
                Err(e) => {
                    if self.rejected.get(key) != Some(raw) {
                        warn!(room = %self.room, "{e}");
                        self.rejected.insert(key.clone(), raw.clone());
                    }
                    continue;
                }
            };

            match self.kind {
                SignalKind::Candidate => {
                    self.seen.insert(key.clone());
                }
                SignalKind::Offer | SignalKind::Answer => {
                    let last = self.last_generation.entry(from.clone()).or_insert(0);
                    if record.generation <= *last {
                        continue;
                    }
                    *last = record.generation;
                }
            }

            out.push(NegotiationMessage {
                room: self.room.clone(),
                from,
                to: self.self_id.clone(),
                generation: record.generation,
                payload: record.payload,
            });
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    struct Pair {
        backend: MemoryBackend,
        a: SignalingChannel,
        b: SignalingChannel,
    }

    fn pair() -> Pair {
        let backend = MemoryBackend::new();
        let room = RoomId::new("R1").unwrap();
        let a = SignalingChannel::new(Arc::new(backend.connect()), room.clone(), PeerId::parse("a").unwrap());
        let b = SignalingChannel::new(Arc::new(backend.connect()), room, PeerId::parse("b").unwrap());
        Pair { backend, a, b }
    }

    async fn next(stream: &mut BoxStream<'static, NegotiationMessage>) -> NegotiationMessage {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("message in time")
            .expect("stream open")
    }

    async fn quiet(stream: &mut BoxStream<'static, NegotiationMessage>) -> bool {
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .is_err()
    }

    #[test]
    fn payload_wire_format() {
        let json = serde_json::to_value(NegotiationPayload::Offer { sdp: "v=0".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));

        let candidate = NegotiationPayload::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["sdp_mid"], "0");
        assert!(json.get("username_fragment").is_none());
    }

    #[test]
    fn rejects_malformed_and_mismatched_records() {
        let err = decode_record("p", SignalKind::Offer, "{not json").unwrap_err();
        assert_eq!(err.code(), "malformed_signal");

        let answer = serde_json::json!({
            "generation": 1,
            "sent_at": Utc::now(),
            "payload": {"type": "answer", "sdp": "v=0"}
        })
        .to_string();
        assert!(decode_record("p", SignalKind::Offer, &answer).is_err());
        assert!(decode_record("p", SignalKind::Answer, &answer).is_ok());

        let unknown = r#"{"generation":1,"sent_at":"2024-01-01T00:00:00Z","payload":{"type":"bye"}}"#;
        assert!(decode_record("p", SignalKind::Offer, unknown).is_err());
    }

    #[tokio::test]
    async fn offers_reach_only_the_recipient() {
        let p = pair();
        let c = SignalingChannel::new(
            Arc::new(p.backend.connect()),
            p.a.room().clone(),
            PeerId::parse("c").unwrap(),
        );
        let mut b_offers = p.b.subscribe_offers();
        let mut c_offers = c.subscribe_offers();

        let generation = p.a.send_offer(p.b.self_id(), "sdp-1".into()).await.unwrap();
        let msg = next(&mut b_offers).await;
        assert_eq!(msg.from.as_str(), "a");
        assert_eq!(msg.generation, generation);
        assert_eq!(msg.payload, NegotiationPayload::Offer { sdp: "sdp-1".into() });

        assert!(quiet(&mut c_offers).await);
    }

    #[tokio::test]
    async fn newer_offer_supersedes_and_duplicates_are_suppressed() {
        let p = pair();
        let mut offers = p.b.subscribe_offers();

        p.a.send_offer(p.b.self_id(), "sdp-1".into()).await.unwrap();
        assert_eq!(next(&mut offers).await.generation, 1);

        let g2 = p.a.send_offer(p.b.self_id(), "sdp-2".into()).await.unwrap();
        let msg = next(&mut offers).await;
        assert_eq!(msg.generation, g2);
        assert_eq!(msg.payload, NegotiationPayload::Offer { sdp: "sdp-2".into() });

        // an unrelated write to the same prefix re-delivers nothing
        p.b.send_offer(p.a.self_id(), "sdp-b".into()).await.unwrap();
        assert!(quiet(&mut offers).await);
    }

    #[tokio::test]
    async fn answers_echo_the_offer_generation() {
        let p = pair();
        let mut answers = p.a.subscribe_answers();
        p.b.send_answer(p.a.self_id(), "ans".into(), 5).await.unwrap();
        let msg = next(&mut answers).await;
        assert_eq!(msg.generation, 5);
        assert_eq!(msg.payload.kind(), SignalKind::Answer);
    }

    #[tokio::test]
    async fn candidates_are_delivered_once_in_order() {
        let p = pair();
        let mut candidates = p.b.subscribe_candidates();
        for i in 0..3 {
            let c = IceCandidate {
                candidate: format!("cand-{i}"),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            };
            p.a.send_candidate(p.b.self_id(), c).await.unwrap();
        }

        let mut got = Vec::new();
        while got.len() < 3 {
            match next(&mut candidates).await.payload {
                NegotiationPayload::Candidate(c) => got.push(c.candidate),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, vec!["cand-0", "cand-1", "cand-2"]);
        assert!(quiet(&mut candidates).await);
    }

    #[tokio::test]
    async fn malformed_records_are_dropped() {
        let p = pair();
        let store = p.backend.connect();
        let mut offers = p.b.subscribe_offers();

        store.set("rooms/R1/offers/x/b", "garbage".into()).await.unwrap();
        assert!(quiet(&mut offers).await);

        p.a.send_offer(p.b.self_id(), "ok".into()).await.unwrap();
        assert_eq!(next(&mut offers).await.from.as_str(), "a");
    }

    #[tokio::test]
    async fn write_failures_surface_as_signaling_errors() {
        let backend = MemoryBackend::new();
        let conn = backend.connect();
        let channel = SignalingChannel::new(
            Arc::new(conn.clone()),
            RoomId::new("R1").unwrap(),
            PeerId::parse("a").unwrap(),
        );
        conn.set_fail_writes(true);
        let err = channel
            .send_offer(&PeerId::parse("b").unwrap(), "sdp".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::SignalingWriteFailed { .. }));
    }

    #[tokio::test]
    async fn outgoing_signals_are_cleaned_up() {
        let p = pair();
        p.a.register_disconnect_cleanup().await.unwrap();
        p.a.send_offer(p.b.self_id(), "sdp".into()).await.unwrap();
        p.a.send_candidate(
            p.b.self_id(),
            IceCandidate {
                candidate: "c".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            },
        )
        .await
        .unwrap();

        p.a.clear_pair(p.b.self_id()).await;
        assert_eq!(p.backend.count_under("rooms/R1/offers/a"), 0);
        assert_eq!(p.backend.count_under("rooms/R1/candidates/a"), 0);

        p.a.send_offer(p.b.self_id(), "sdp".into()).await.unwrap();
        p.a.clear_outgoing().await;
        assert_eq!(p.backend.count_under("rooms/R1/offers/a"), 0);
    }
}
