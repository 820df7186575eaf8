// src/chat.rs
//
// Text chat attached to a call.
//
// Messages are written to `rooms/{room}/chat/{peer}/{seq}` and read back by
// every other member through a watch on the chat prefix.  Delivery is
// best-effort with no acknowledgement; each member's log is in its own
// receipt order.  A member's messages are removed from the store when it
// leaves, but stay in the logs of those who already received them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CallError, CallResult};
use crate::room::{PeerId, RoomId, RoomPaths};
use crate::store::RendezvousStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: PeerId,
    pub sender_label: String,
    pub text: String,
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
}

/// Append-only local history.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    seen: HashSet<(PeerId, u64)>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless the same (sender, seq) is already present.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert((message.sender.clone(), message.seq)) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Clone)]
pub struct ChatChannel {
    store: Arc<dyn RendezvousStore>,
    room: RoomId,
    paths: RoomPaths,
    self_id: PeerId,
    label: String,
    seq: Arc<AtomicU64>,
}

impl ChatChannel {
    pub fn new(store: Arc<dyn RendezvousStore>, room: RoomId, self_id: PeerId, label: String) -> Self {
        let paths = RoomPaths::new(&room);
        Self {
            store,
            room,
            paths,
            self_id,
            label,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish `text`.  Blank text is ignored and yields `Ok(None)`.
    pub async fn send(&self, text: &str) -> CallResult<Option<ChatMessage>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let message = ChatMessage {
            sender: self.self_id.clone(),
            sender_label: self.label.clone(),
            text: text.to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            sent_at: Utc::now(),
        };
        let path = self.paths.chat_message(&self.self_id, message.seq);
        let value = serde_json::to_string(&message).map_err(CallError::link)?;
        self.store
            .set(&path, value)
            .await
            .map_err(|source| CallError::SignalingWriteFailed {
                path: path.clone(),
                source,
            })?;
        debug!(room = %self.room, seq = message.seq, "chat message sent");
        Ok(Some(message))
    }

    /// Messages from other members, each once, in receipt order.
    pub fn subscribe(&self) -> BoxStream<'static, ChatMessage> {
        let mut snapshots = self.store.watch(&self.paths.chat_prefix());
        let self_id = self.self_id.clone();
        let room = self.room.clone();

        Box::pin(async_stream::stream! {
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(snapshot) = snapshots.next().await {
                seen.retain(|k| snapshot.contains_key(k));
                for (key, raw) in snapshot {
                    if seen.contains(&key) {
                        continue;
                    }
                    seen.insert(key.clone());

                    let Some(sender) = key.split('/').next().and_then(PeerId::parse) else {
                        continue;
                    };
                    if sender == self_id {
                        continue;
                    }
                    match serde_json::from_str::<ChatMessage>(&raw) {
                        // The path is authoritative for the sender.
                        Ok(message) => {
                            yield ChatMessage { sender, ..message };
                        }
                        Err(e) => {
                            warn!(room = %room, key = %key, "malformed chat message: {e}");
                        }
                    }
                }
            }
        })
    }
}

/// Plain-text transcript, one `label: text` line per message.
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.sender_label, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    fn channel(backend: &MemoryBackend, id: &str, label: &str) -> ChatChannel {
        ChatChannel::new(
            Arc::new(backend.connect()),
            RoomId::new("R1").unwrap(),
            PeerId::parse(id).unwrap(),
            label.to_string(),
        )
    }

    #[tokio::test]
    async fn messages_reach_other_members_once() {
        let backend = MemoryBackend::new();
        let a = channel(&backend, "a", "alice");
        let b = channel(&backend, "b", "bob");
        let mut a_feed = a.subscribe();
        let mut b_feed = b.subscribe();

        let sent = a.send("  hello  ").await.unwrap().unwrap();
        assert_eq!(sent.text, "hello");

        let got = tokio::time::timeout(Duration::from_secs(1), b_feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.sender_label, "alice");
        assert_eq!(got.text, "hello");

        // the sender does not receive its own message
        let own = tokio::time::timeout(Duration::from_millis(100), a_feed.next()).await;
        assert!(own.is_err());

        // another write does not re-deliver the first message
        a.send("second").await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), b_feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.text, "second");
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let backend = MemoryBackend::new();
        let a = channel(&backend, "a", "alice");
        assert!(a.send("   ").await.unwrap().is_none());
        assert_eq!(backend.count_under("rooms/R1/chat"), 0);
    }

    #[test]
    fn log_dedupes_and_renders() {
        let mut log = ChatLog::new();
        let msg = ChatMessage {
            sender: PeerId::parse("a").unwrap(),
            sender_label: "alice".into(),
            text: "hi".into(),
            seq: 1,
            sent_at: Utc::now(),
        };
        assert!(log.append(msg.clone()));
        assert!(!log.append(msg));
        assert_eq!(log.len(), 1);
        assert_eq!(render_transcript(log.messages()), "alice: hi");
    }
}
