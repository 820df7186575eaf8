// src/store/mod.rs
//
// Rendezvous store seam.
//
// The call layer only needs a small path-addressed key-value store with
// change subscription and removal-on-disconnect.  Nothing media-related
// ever passes through it.
//
//   set / get / remove(subtree)     plain key-value access
//   remove_on_disconnect(subtree)   liveness: cleared if this connection dies
//   watch(prefix)                   full snapshots under a prefix
//
// ────────────────────────────────────────────────────────────────────────────

mod memory;
mod redis_store;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::Config;
use crate::error::StoreError;

pub use self::memory::{MemoryBackend, MemoryStore};
pub use self::redis_store::RedisStore;

/// Every entry under a watched prefix, keyed by the path relative to it.
pub type Snapshot = BTreeMap<String, String>;

#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Write or overwrite the value at `path`.
    async fn set(&self, path: &str, value: String) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// Remove `path` and everything below it.  Removing an absent path is
    /// not an error.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Remove `path` (and its subtree) automatically when this connection
    /// drops without a graceful leave.
    async fn remove_on_disconnect(&self, path: &str) -> Result<(), StoreError>;

    /// Undo a `remove_on_disconnect` registration.
    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError>;

    /// Continuous snapshots of everything under `prefix`.  The first item is
    /// the current state; identical consecutive snapshots are not repeated.
    /// Each call returns an independent stream.
    fn watch(&self, prefix: &str) -> BoxStream<'static, Snapshot>;
}

/// `true` when `key` equals `path` or lies below it.
pub(crate) fn in_subtree(key: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    key == path
        || (key.len() > path.len() && key.starts_with(path) && key.as_bytes()[path.len()] == b'/')
}

/// Open the store selected by `config.store_url`.
pub async fn connect(config: &Config) -> Result<Arc<dyn RendezvousStore>, StoreError> {
    if config.uses_redis() {
        let store = RedisStore::connect(
            &config.store_url,
            &config.store_namespace,
            config.presence_lease,
            config.store_resync,
        )
        .await?;
        Ok(Arc::new(store))
    } else {
        tracing::warn!("using an in-process store, only peers in this process can meet");
        Ok(Arc::new(MemoryBackend::new().connect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_matching() {
        assert!(in_subtree("rooms/r/peers/a", "rooms/r/peers/a"));
        assert!(in_subtree("rooms/r/peers/a", "rooms/r/peers"));
        assert!(in_subtree("rooms/r/peers/a", "rooms/r/peers/"));
        assert!(!in_subtree("rooms/r/peers/ab", "rooms/r/peers/a"));
        assert!(!in_subtree("rooms/r", "rooms/r/peers"));
    }
}
