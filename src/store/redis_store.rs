// src/store/redis_store.rs
//
// Redis-backed rendezvous store.
//
// ─ Layout ───────────────────────────────────────────────────────────────────
//
//   key      {namespace}:{path}
//   channel  {namespace}:changes      (payload = the mutated path)
//
// ─ Liveness ─────────────────────────────────────────────────────────────────
//
//   Redis has no "delete when the writer disconnects" hook, so paths
//   registered with `remove_on_disconnect` are written with a lease TTL and
//   a background task refreshes the TTL every lease/3.  When the process
//   dies the refresh stops and the keys expire on their own.
//
//   Expiry does not publish on our channel, so every watcher also rescans
//   on a fixed interval.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{in_subtree, RendezvousStore, Snapshot};
use crate::error::StoreError;

const SCAN_BATCH: usize = 200;

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    namespace: String,
    lease: Duration,
    resync: Duration,
    /// Paths (subtrees) that must expire if this process dies.
    ephemeral: Arc<Mutex<BTreeSet<String>>>,
    keepalive: CancellationToken,
}

impl RedisStore {
    pub async fn connect(
        url: &str,
        namespace: &str,
        lease: Duration,
        resync: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!(namespace, lease_secs = lease.as_secs(), "connected to Redis rendezvous store");

        let store = Self {
            client,
            conn,
            namespace: namespace.to_string(),
            lease,
            resync,
            ephemeral: Arc::new(Mutex::new(BTreeSet::new())),
            keepalive: CancellationToken::new(),
        };
        store.spawn_keepalive();
        Ok(store)
    }

    fn key(&self, path: &str) -> String {
        format_key(&self.namespace, path)
    }

    fn channel(&self) -> String {
        format!("{}:changes", self.namespace)
    }

    fn lease_secs(&self) -> u64 {
        self.lease.as_secs().max(1)
    }

    fn is_ephemeral(&self, path: &str) -> bool {
        self.ephemeral
            .lock()
            .unwrap()
            .iter()
            .any(|root| in_subtree(path, root))
    }

    async fn publish(&self, path: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(self.channel(), path).await?;
        Ok(())
    }

    /// Refresh the TTL of every key under every ephemeral root.
    fn spawn_keepalive(&self) {
        let conn = self.conn.clone();
        let namespace = self.namespace.clone();
        let ephemeral = self.ephemeral.clone();
        let cancel = self.keepalive.clone();
        let lease = self.lease_secs();
        let period = Duration::from_secs((lease / 3).max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("redis keepalive stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let roots: Vec<String> = ephemeral.lock().unwrap().iter().cloned().collect();
                        for root in roots {
                            let mut conn = conn.clone();
                            match scan_subtree(&mut conn, &namespace, &root).await {
                                Ok(keys) => {
                                    for key in keys {
                                        if let Err(e) = conn.expire::<_, ()>(&key, lease as i64).await {
                                            warn!(key = %key, "lease refresh failed: {e}");
                                        }
                                    }
                                }
                                Err(e) => warn!(root = %root, "lease refresh scan failed: {e}"),
                            }
                        }
                    }
                }
            }
        });
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.keepalive.cancel();
    }
}

#[async_trait]
impl RendezvousStore for RedisStore {
    async fn set(&self, path: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(path);
        if self.is_ephemeral(path) {
            conn.set_ex::<_, _, ()>(&key, value, self.lease_secs()).await?;
        } else {
            conn.set::<_, _, ()>(&key, value).await?;
        }
        self.publish(path).await
    }

    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.key(path)).await?)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let keys = scan_subtree(&mut conn, &self.namespace, path).await?;
        if keys.is_empty() {
            return Ok(());
        }
        redis::cmd("DEL")
            .arg(&keys)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(path, removed = keys.len(), "redis subtree removed");
        self.publish(path).await
    }

    async fn remove_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        self.ephemeral.lock().unwrap().insert(path.to_string());
        // Anything already written under the root gets a lease now.
        let mut conn = self.conn.clone();
        for key in scan_subtree(&mut conn, &self.namespace, path).await? {
            conn.expire::<_, ()>(&key, self.lease_secs() as i64).await?;
        }
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        self.ephemeral.lock().unwrap().remove(path);
        let mut conn = self.conn.clone();
        for key in scan_subtree(&mut conn, &self.namespace, path).await? {
            conn.persist::<_, ()>(&key).await?;
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> BoxStream<'static, Snapshot> {
        let client = self.client.clone();
        let conn = self.conn.clone();
        let namespace = self.namespace.clone();
        let channel = self.channel();
        let resync = self.resync;
        let prefix = prefix.to_string();

        Box::pin(async_stream::stream! {
            // Change notifications are an optimisation; without them the
            // periodic rescan still delivers every change.
            let mut notifications = match subscribe_changes(&client, &channel).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(prefix = %prefix, "redis change subscription failed, polling only: {e}");
                    None
                }
            };
            let mut interval = tokio::time::interval(resync);
            let mut last: Option<Snapshot> = None;

            loop {
                let mut conn = conn.clone();
                match read_snapshot(&mut conn, &namespace, &prefix).await {
                    Ok(snapshot) => {
                        if last.as_ref() != Some(&snapshot) {
                            last = Some(snapshot.clone());
                            yield snapshot;
                        }
                    }
                    Err(e) => warn!(prefix = %prefix, "redis snapshot failed: {e}"),
                }

                // Wait for a relevant notification or the next resync tick.
                loop {
                    let message = match notifications.as_mut() {
                        Some(stream) => tokio::select! {
                            msg = stream.next() => Some(msg),
                            _ = interval.tick() => None,
                        },
                        None => {
                            interval.tick().await;
                            None
                        }
                    };
                    match message {
                        None => break,
                        Some(Some(path)) if touches(&path, &prefix) => break,
                        Some(Some(_)) => continue,
                        Some(None) => {
                            warn!(prefix = %prefix, "redis change subscription closed, polling only");
                            notifications = None;
                            break;
                        }
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_key(namespace: &str, path: &str) -> String {
    format!("{namespace}:{}", path.trim_end_matches('/'))
}

/// `true` when a mutation at `path` can change a snapshot of `prefix`.
fn touches(path: &str, prefix: &str) -> bool {
    in_subtree(path, prefix) || in_subtree(prefix.trim_end_matches('/'), path)
}

async fn subscribe_changes(
    client: &redis::Client,
    channel: &str,
) -> Result<BoxStream<'static, String>, StoreError> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(channel).await?;
    let stream = pubsub
        .into_on_message()
        .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
    Ok(Box::pin(stream))
}

/// Every key at or below `path`.
async fn scan_subtree(
    conn: &mut ConnectionManager,
    namespace: &str,
    path: &str,
) -> Result<Vec<String>, StoreError> {
    let exact = format_key(namespace, path);
    let pattern = format!("{exact}/*");
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    let exists: bool = conn.exists(&exact).await?;
    if exists {
        keys.push(exact);
    }
    Ok(keys)
}

async fn read_snapshot(
    conn: &mut ConnectionManager,
    namespace: &str,
    prefix: &str,
) -> Result<Snapshot, StoreError> {
    let base = format_key(namespace, prefix);
    let mut keys = scan_subtree(conn, namespace, prefix).await?;
    keys.retain(|k| k.len() > base.len() + 1);
    keys.sort();
    if keys.is_empty() {
        return Ok(Snapshot::new());
    }
    let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(conn).await?;
    Ok(keys
        .into_iter()
        .zip(values)
        .filter_map(|(key, value)| {
            // Keys can expire between SCAN and MGET.
            value.map(|v| (key[base.len() + 1..].to_string(), v))
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(format_key("meshcall", "rooms/r/peers/a"), "meshcall:rooms/r/peers/a");
        assert_eq!(format_key("meshcall", "rooms/r/peers/"), "meshcall:rooms/r/peers");
    }

    #[test]
    fn notification_relevance() {
        let prefix = "rooms/r/peers/";
        assert!(touches("rooms/r/peers/a", prefix));
        // removing a whole room touches its peers
        assert!(touches("rooms/r", prefix));
        assert!(!touches("rooms/r/chat/a/1", prefix));
        assert!(!touches("rooms/r2/peers/a", prefix));
    }
}
