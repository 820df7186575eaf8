use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{in_subtree, RendezvousStore, Snapshot};
use crate::error::StoreError;

// ---------------------------------------------------------------------------
// MemoryBackend -- the shared "server"
// ---------------------------------------------------------------------------

/// In-process rendezvous store shared by any number of logical connections.
///
/// Each `MemoryStore` handle obtained from `connect` behaves like one client
/// connection: its `remove_on_disconnect` registrations fire when
/// `MemoryStore::disconnect` is called, which is how tests simulate a peer
/// process dying without a graceful leave.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    data: Mutex<BTreeMap<String, String>>,
    /// Bumped on every mutation; watchers wake on change.
    version: watch::Sender<u64>,
    next_conn: AtomicU64,
    on_disconnect: Mutex<HashMap<u64, BTreeSet<String>>>,
}

impl Inner {
    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn snapshot(&self, prefix: &str) -> Snapshot {
        let base = format!("{}/", prefix.trim_end_matches('/'));
        let data = self.data.lock().unwrap();
        data.range(base.clone()..)
            .take_while(|(k, _)| k.starts_with(&base))
            .map(|(k, v)| (k[base.len()..].to_string(), v.clone()))
            .collect()
    }

    fn remove_subtree(&self, path: &str) -> usize {
        let mut data = self.data.lock().unwrap();
        let before = data.len();
        data.retain(|k, _| !in_subtree(k, path));
        before - data.len()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(BTreeMap::new()),
                version,
                next_conn: AtomicU64::new(1),
                on_disconnect: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open a new logical connection.
    pub fn connect(&self) -> MemoryStore {
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        MemoryStore {
            backend: self.clone(),
            conn_id,
            closed: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Entries under `prefix`, relative to it.
    pub fn snapshot(&self, prefix: &str) -> Snapshot {
        self.inner.snapshot(prefix)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.data.lock().unwrap().contains_key(path)
    }

    /// Number of entries in the subtree at `path`.
    pub fn count_under(&self, path: &str) -> usize {
        self.inner
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| in_subtree(k, path))
            .count()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MemoryStore -- one connection
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryStore {
    backend: MemoryBackend,
    conn_id: u64,
    closed: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Simulate the connection dropping abruptly: every registered
    /// on-disconnect removal runs and later writes fail with `Closed`.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let paths = self
            .backend
            .inner
            .on_disconnect
            .lock()
            .unwrap()
            .remove(&self.conn_id)
            .unwrap_or_default();
        let mut removed = 0;
        for path in &paths {
            removed += self.backend.inner.remove_subtree(path);
        }
        info!(conn = self.conn_id, removed, "memory store connection dropped");
        self.backend.inner.bump();
    }

    /// Make every write fail with `StoreError::Rejected` until turned off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn set(&self, path: &str, value: String) -> Result<(), StoreError> {
        self.check_writable()?;
        self.backend
            .inner
            .data
            .lock()
            .unwrap()
            .insert(path.to_string(), value);
        self.backend.inner.bump();
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(self.backend.inner.data.lock().unwrap().get(path).cloned())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let removed = self.backend.inner.remove_subtree(path);
        if removed > 0 {
            debug!(path, removed, "memory store subtree removed");
            self.backend.inner.bump();
        }
        Ok(())
    }

    async fn remove_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.backend
            .inner
            .on_disconnect
            .lock()
            .unwrap()
            .entry(self.conn_id)
            .or_default()
            .insert(path.to_string());
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        if let Some(paths) = self
            .backend
            .inner
            .on_disconnect
            .lock()
            .unwrap()
            .get_mut(&self.conn_id)
        {
            paths.remove(path);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> BoxStream<'static, Snapshot> {
        let inner = self.backend.inner.clone();
        let prefix = prefix.to_string();
        let mut rx = inner.version.subscribe();

        Box::pin(async_stream::stream! {
            let mut last: Option<Snapshot> = None;
            loop {
                let _ = *rx.borrow_and_update();
                let snapshot = inner.snapshot(&prefix);
                if last.as_ref() != Some(&snapshot) {
                    last = Some(snapshot.clone());
                    yield snapshot;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn set_get_remove_subtree() {
        let store = MemoryBackend::new().connect();
        store.set("rooms/r/peers/a", "1".into()).await.unwrap();
        store.set("rooms/r/peers/b", "2".into()).await.unwrap();
        store.set("rooms/r/offers/a/b", "x".into()).await.unwrap();

        assert_eq!(store.get("rooms/r/peers/a").await.unwrap().as_deref(), Some("1"));

        store.remove("rooms/r/peers").await.unwrap();
        assert!(store.get("rooms/r/peers/a").await.unwrap().is_none());
        assert!(store.get("rooms/r/offers/a/b").await.unwrap().is_some());

        // idempotent
        store.remove("rooms/r/peers").await.unwrap();
    }

    #[tokio::test]
    async fn watch_yields_full_snapshots() {
        let store = MemoryBackend::new().connect();
        store.set("rooms/r/peers/a", "1".into()).await.unwrap();

        let mut stream = store.watch("rooms/r/peers/");
        let first = stream.next().await.unwrap();
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["a"]);

        store.set("rooms/r/peers/b", "2".into()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn watch_ignores_unrelated_changes() {
        let store = MemoryBackend::new().connect();
        let mut stream = store.watch("rooms/r/peers/");
        assert!(stream.next().await.unwrap().is_empty());

        store.set("rooms/r/chat/a/1", "hi".into()).await.unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(quiet.is_err(), "no snapshot expected for another prefix");
    }

    #[tokio::test]
    async fn disconnect_runs_registered_removals() {
        let backend = MemoryBackend::new();
        let a = backend.connect();
        let b = backend.connect();

        a.remove_on_disconnect("rooms/r/peers/a").await.unwrap();
        a.set("rooms/r/peers/a", "1".into()).await.unwrap();
        b.remove_on_disconnect("rooms/r/peers/b").await.unwrap();
        b.set("rooms/r/peers/b", "1".into()).await.unwrap();

        a.disconnect();
        assert!(!backend.contains("rooms/r/peers/a"));
        assert!(backend.contains("rooms/r/peers/b"));
        assert!(matches!(
            a.set("rooms/r/peers/a", "1".into()).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn cancelled_registration_survives_disconnect() {
        let backend = MemoryBackend::new();
        let a = backend.connect();
        a.remove_on_disconnect("rooms/r/peers/a").await.unwrap();
        a.cancel_on_disconnect("rooms/r/peers/a").await.unwrap();
        a.set("rooms/r/peers/a", "1".into()).await.unwrap();
        a.disconnect();
        assert!(backend.contains("rooms/r/peers/a"));
    }

    #[tokio::test]
    async fn injected_write_failures() {
        let store = MemoryBackend::new().connect();
        store.set_fail_writes(true);
        assert!(matches!(
            store.set("k", "v".into()).await,
            Err(StoreError::Rejected(_))
        ));
        store.set_fail_writes(false);
        store.set("k", "v".into()).await.unwrap();
    }
}
