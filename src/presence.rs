// src/presence.rs
//
// Presence registry.
//
// Membership of a room lives at `rooms/{room}/peers/{peer}`.  The local entry
// is registered for removal-on-disconnect before it is written, so a process
// that dies without leaving disappears from everyone's snapshot through the
// store's own liveness mechanism.  There is no heartbeat here.
//
// Subscribers always receive the full membership; a snapshot replaces the
// previous view.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::room::{PeerId, RoomId, RoomPaths};
use crate::store::RendezvousStore;

/// Liveness marker stored for each member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMarker {
    pub label: String,
    pub joined_at: DateTime<Utc>,
}

/// Full membership of a room at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    members: BTreeMap<PeerId, PresenceMarker>,
}

impl PresenceSnapshot {
    pub fn from_members(members: impl IntoIterator<Item = (PeerId, PresenceMarker)>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PresenceMarker> {
        self.members.get(peer)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Everyone except `me`.
    pub fn others<'a>(&'a self, me: &'a PeerId) -> impl Iterator<Item = &'a PeerId> + 'a {
        self.members.keys().filter(move |p| *p != me)
    }
}

#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn RendezvousStore>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn RendezvousStore>) -> Self {
        Self { store }
    }

    /// Register `peer` as a member of `room`.
    pub async fn join(&self, room: &RoomId, peer: &PeerId, label: &str) -> Result<(), StoreError> {
        let path = RoomPaths::new(room).peer(peer);
        // Arm the disconnect hook first so there is no window where the
        // entry exists without it.
        self.store.remove_on_disconnect(&path).await?;

        let marker = PresenceMarker {
            label: label.to_string(),
            joined_at: Utc::now(),
        };
        let value = serde_json::to_string(&marker)
            .map_err(|e| StoreError::Rejected(format!("presence marker: {e}")))?;
        self.store.set(&path, value).await?;

        info!(room = %room, peer = %peer, "joined presence");
        Ok(())
    }

    /// Continuous membership snapshots for `room`.  Entries whose key is not
    /// a valid identity are skipped; an unreadable marker still counts as a
    /// member.
    pub fn subscribe(&self, room: &RoomId) -> BoxStream<'static, PresenceSnapshot> {
        let prefix = RoomPaths::new(room).peers_prefix();
        let room = room.clone();
        self.store
            .watch(&prefix)
            .map(move |raw| {
                let snapshot = decode_snapshot(raw);
                debug!(room = %room, members = snapshot.len(), "presence snapshot");
                snapshot
            })
            .boxed()
    }

    /// Remove the local entry.  Leaving twice, or leaving a room never
    /// joined, is fine.
    pub async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), StoreError> {
        let path = RoomPaths::new(room).peer(peer);
        if let Err(e) = self.store.cancel_on_disconnect(&path).await {
            warn!(room = %room, peer = %peer, "could not disarm presence disconnect hook: {e}");
        }
        self.store.remove(&path).await?;
        info!(room = %room, peer = %peer, "left presence");
        Ok(())
    }
}

fn decode_snapshot(raw: crate::store::Snapshot) -> PresenceSnapshot {
    let members = raw.into_iter().filter_map(|(key, value)| {
        // Only direct children are members.
        if key.contains('/') {
            return None;
        }
        let peer = PeerId::parse(&key)?;
        let marker = serde_json::from_str::<PresenceMarker>(&value).unwrap_or_else(|_| {
            PresenceMarker {
                label: peer.short().to_string(),
                joined_at: Utc::now(),
            }
        });
        Some((peer, marker))
    });
    PresenceSnapshot::from_members(members)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    async fn next(stream: &mut BoxStream<'static, PresenceSnapshot>) -> PresenceSnapshot {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("snapshot in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn join_and_leave_drive_snapshots() {
        let backend = MemoryBackend::new();
        let registry = PresenceRegistry::new(Arc::new(backend.connect()));
        let room = RoomId::new("R1").unwrap();
        let a = PeerId::generate();

        let mut snapshots = registry.subscribe(&room);
        assert!(next(&mut snapshots).await.is_empty());

        registry.join(&room, &a, "alice").await.unwrap();
        let snap = next(&mut snapshots).await;
        assert!(snap.contains(&a));
        assert_eq!(snap.get(&a).unwrap().label, "alice");

        registry.leave(&room, &a).await.unwrap();
        assert!(next(&mut snapshots).await.is_empty());

        // idempotent
        registry.leave(&room, &a).await.unwrap();
    }

    #[tokio::test]
    async fn abrupt_disconnect_removes_entry() {
        let backend = MemoryBackend::new();
        let conn_a = backend.connect();
        let registry_a = PresenceRegistry::new(Arc::new(conn_a.clone()));
        let registry_b = PresenceRegistry::new(Arc::new(backend.connect()));
        let room = RoomId::new("R1").unwrap();
        let a = PeerId::generate();
        let b = PeerId::generate();

        registry_a.join(&room, &a, "a").await.unwrap();
        registry_b.join(&room, &b, "b").await.unwrap();

        let mut snapshots = registry_b.subscribe(&room);
        assert_eq!(next(&mut snapshots).await.len(), 2);

        conn_a.disconnect();
        let snap = next(&mut snapshots).await;
        assert!(!snap.contains(&a));
        assert!(snap.contains(&b));
    }

    #[tokio::test]
    async fn graceful_leave_survives_later_disconnect() {
        let backend = MemoryBackend::new();
        let conn = backend.connect();
        let registry = PresenceRegistry::new(Arc::new(conn.clone()));
        let room = RoomId::new("R1").unwrap();
        let a = PeerId::generate();

        registry.join(&room, &a, "a").await.unwrap();
        registry.leave(&room, &a).await.unwrap();
        conn.disconnect();
        assert_eq!(backend.count_under("rooms/R1/peers"), 0);
    }

    #[test]
    fn snapshot_skips_foreign_keys_and_tolerates_bad_markers() {
        let mut raw = crate::store::Snapshot::new();
        raw.insert("p1".into(), "not json".into());
        raw.insert("p2/extra".into(), "{}".into());
        let snap = decode_snapshot(raw);
        assert_eq!(snap.len(), 1);
        let p1 = PeerId::parse("p1").unwrap();
        assert_eq!(snap.get(&p1).unwrap().label, "p1");
        assert_eq!(snap.others(&p1).count(), 0);
    }
}
