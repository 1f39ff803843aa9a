//! Mesh storage backend.
//!
//! State is replicated through the chitchat gossip cluster. Every node
//! writes only its own contribution for a key and reads merge the
//! contributions of all live nodes:
//!
//! - scalars: last writer wins, ordered by write stamp then node id
//! - counters: per-node totals are summed
//! - lists: per-node pushes are merged by push stamp, newest first
//! - deletes: tombstone markers hide every contribution stamped at or before them
//!
//! Increments are atomic on a node but not across the cluster; two nodes can
//! both admit the last unit of a window before gossip converges.
//!
//! Sweeps drop this node's dead contributions and its tombstones once they
//! are older than the retention period. A tombstone must outlive every
//! contribution it hides, so the retention should exceed the longest window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{format_number, list_range_bounds, parse_number, Storage, StorageError, StorageResult};
use crate::clock::Clock;
use crate::mesh::{Cluster, ClusterView, NodeValue};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum ScalarValue {
    Text(String),
    Counter(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScalarEntry {
    since: u64,
    written_at: u64,
    expires_at: Option<u64>,
    value: ScalarValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListItem {
    at: u64,
    value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListEntry {
    since: u64,
    expires_at: Option<u64>,
    /// Oldest first.
    items: Vec<ListItem>,
}

trait Contribution {
    fn since(&self) -> u64;
    fn expires_at(&self) -> Option<u64>;

    fn is_live(&self, cutoff: u64, now: u64) -> bool {
        self.since() > cutoff && self.expires_at().map_or(true, |at| at > now)
    }
}

impl Contribution for ScalarEntry {
    fn since(&self) -> u64 {
        self.since
    }
    fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }
}

impl Contribution for ListEntry {
    fn since(&self) -> u64 {
        self.since
    }
    fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }
}

fn scalar_key(key: &str) -> String {
    format!("kv|{}", key)
}

fn list_key(key: &str) -> String {
    format!("list|{}", key)
}

fn delete_marker_key(key: &str) -> String {
    format!("del|{}", key)
}

fn reset_marker_key(prefix: &str) -> String {
    format!("reset|{}", prefix)
}

fn decode<T: DeserializeOwned>(values: Vec<NodeValue>) -> StorageResult<Vec<(String, T)>> {
    values
        .into_iter()
        .map(|v| -> StorageResult<(String, T)> {
            Ok((v.node_id, serde_json::from_str(&v.value)?))
        })
        .collect()
}

fn latest_marker(view: &ClusterView<'_>, marker_key: &str) -> u64 {
    view.collect(marker_key)
        .iter()
        .filter_map(|v| v.value.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

/// The newest tombstone covering `key`: its own delete marker or a reset of
/// any `:`-terminated prefix of it.
fn cutoff(view: &ClusterView<'_>, key: &str) -> u64 {
    key.match_indices(':')
        .map(|(i, _)| latest_marker(view, &reset_marker_key(&key[..=i])))
        .fold(latest_marker(view, &delete_marker_key(key)), u64::max)
}

fn live_scalars(
    view: &ClusterView<'_>,
    key: &str,
    cutoff: u64,
    now: u64,
) -> StorageResult<Vec<(String, ScalarEntry)>> {
    Ok(decode::<ScalarEntry>(view.collect(&scalar_key(key)))?
        .into_iter()
        .filter(|(_, entry)| entry.is_live(cutoff, now))
        .collect())
}

fn live_lists(
    view: &ClusterView<'_>,
    key: &str,
    cutoff: u64,
    now: u64,
) -> StorageResult<Vec<(String, ListEntry)>> {
    Ok(decode::<ListEntry>(view.collect(&list_key(key)))?
        .into_iter()
        .filter(|(_, entry)| entry.is_live(cutoff, now))
        .collect())
}

/// Counters take precedence over text; text is last-writer-wins.
fn merge_scalars(entries: &[(String, ScalarEntry)]) -> Option<String> {
    let counters: Vec<f64> = entries
        .iter()
        .filter_map(|(_, e)| match e.value {
            ScalarValue::Counter(total) => Some(total),
            ScalarValue::Text(_) => None,
        })
        .collect();
    if !counters.is_empty() {
        return Some(format_number(counters.iter().sum()));
    }
    entries
        .iter()
        .max_by(|(a_node, a), (b_node, b)| {
            a.written_at
                .cmp(&b.written_at)
                .then_with(|| a_node.cmp(b_node))
        })
        .and_then(|(_, e)| match &e.value {
            ScalarValue::Text(text) => Some(text.clone()),
            ScalarValue::Counter(_) => None,
        })
}

/// Merged list, newest first.
fn merge_lists(entries: Vec<(String, ListEntry)>) -> Vec<String> {
    let mut items: Vec<(u64, String, String)> = entries
        .into_iter()
        .flat_map(|(node, entry)| {
            entry
                .items
                .into_iter()
                .map(move |item| (item.at, node.clone(), item.value))
        })
        .collect();
    items.sort_by(|a, b| (b.0, &b.1).cmp(&(a.0, &a.1)));
    items.into_iter().map(|(_, _, value)| value).collect()
}

fn local_entry<T: DeserializeOwned>(view: &mut ClusterView<'_>, key: &str) -> StorageResult<Option<T>> {
    match view.local(key) {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Whether one of this node's own keys can be dropped: a contribution that is
/// expired, tombstoned or unreadable, or a tombstone past retention.
fn is_stale(view: &ClusterView<'_>, key: &str, raw: &str, now: u64, retention: u64) -> bool {
    if let Some(key) = key.strip_prefix("kv|") {
        return serde_json::from_str::<ScalarEntry>(raw)
            .map_or(true, |entry| !entry.is_live(cutoff(view, key), now));
    }
    if let Some(key) = key.strip_prefix("list|") {
        return serde_json::from_str::<ListEntry>(raw)
            .map_or(true, |entry| !entry.is_live(cutoff(view, key), now));
    }
    if key.starts_with("del|") || key.starts_with("reset|") {
        return raw
            .parse::<u64>()
            .map_or(true, |marker| marker.saturating_add(retention) <= now);
    }
    false
}

fn write_local<T: Serialize>(view: &mut ClusterView<'_>, key: &str, entry: &T) -> StorageResult<()> {
    view.set_local(key, serde_json::to_string(entry)?);
    Ok(())
}

/// Storage backed by the gossip mesh.
#[derive(Debug)]
pub struct MeshStorage {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    /// Last stamp handed out; stamps are strictly increasing on this node.
    last_stamp: AtomicU64,
    /// Milliseconds a tombstone is kept before sweeps drop it.
    tombstone_retention: u64,
}

impl MeshStorage {
    /// Create a backend on top of a running cluster node.
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            clock,
            last_stamp: AtomicU64::new(0),
            tombstone_retention: 3_600_000,
        }
    }

    /// Keep tombstones for `retention` before sweeps drop them.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention.as_millis() as u64;
        self
    }

    /// The cluster this backend gossips through.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// A write stamp later than the clock, every earlier stamp, and `floor`.
    fn stamp(&self, now: u64, floor: u64) -> u64 {
        let mut next = 0;
        let _ = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                next = now.max(last + 1).max(floor);
                Some(next)
            });
        next
    }
}

#[async_trait]
impl Storage for MeshStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                Ok(merge_scalars(&live_scalars(view, key, cutoff, now)?))
            })
            .await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StorageResult<()> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let stamp = self.stamp(now, cutoff + 1);
                let entry = ScalarEntry {
                    since: stamp,
                    written_at: stamp,
                    expires_at: ttl.map(|t| now + t.as_millis() as u64),
                    value: ScalarValue::Text(value),
                };
                write_local(view, &scalar_key(key), &entry)
            })
            .await
    }

    async fn increment(&self, key: &str, amount: f64) -> StorageResult<f64> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let stamp = self.stamp(now, cutoff + 1);
                let own: Option<ScalarEntry> = local_entry(view, &scalar_key(key))?;

                let entry = match own.filter(|e| e.is_live(cutoff, now)) {
                    Some(existing) => {
                        let base = match &existing.value {
                            ScalarValue::Counter(total) => *total,
                            ScalarValue::Text(text) => parse_number(key, text)?,
                        };
                        ScalarEntry {
                            since: existing.since,
                            written_at: stamp,
                            expires_at: existing.expires_at,
                            value: ScalarValue::Counter(base + amount),
                        }
                    }
                    None => ScalarEntry {
                        since: stamp,
                        written_at: stamp,
                        expires_at: None,
                        value: ScalarValue::Counter(amount),
                    },
                };
                write_local(view, &scalar_key(key), &entry)?;

                let total = merge_scalars(&live_scalars(view, key, cutoff, now)?)
                    .map(|raw| parse_number(key, &raw))
                    .transpose()?
                    .unwrap_or(0.0);
                trace!(key = %key, amount = amount, total = total, "mesh increment");
                Ok(total)
            })
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let existed = !live_scalars(view, key, cutoff, now)?.is_empty()
                    || !live_lists(view, key, cutoff, now)?.is_empty();
                let marker = self.stamp(now, cutoff);
                view.set_local(&delete_marker_key(key), marker.to_string());
                Ok(existed)
            })
            .await
    }

    async fn lpush(&self, key: &str, value: String) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let stamp = self.stamp(now, cutoff + 1);
                let own: Option<ListEntry> = local_entry(view, &list_key(key))?;
                let mut entry = own.filter(|e| e.is_live(cutoff, now)).unwrap_or(ListEntry {
                    since: stamp,
                    expires_at: None,
                    items: Vec::new(),
                });
                entry.items.push(ListItem { at: stamp, value });
                write_local(view, &list_key(key), &entry)?;

                Ok(live_lists(view, key, cutoff, now)?
                    .iter()
                    .map(|(_, e)| e.items.len())
                    .sum())
            })
            .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StorageResult<Vec<String>> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let merged = merge_lists(live_lists(view, key, cutoff, now)?);
                Ok(match list_range_bounds(merged.len(), start, stop) {
                    Some((from, to)) => merged[from..=to].to_vec(),
                    None => Vec::new(),
                })
            })
            .await
    }

    /// Only this node's own pushes can be removed; peers prune their own.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let own: Option<ListEntry> = local_entry(view, &list_key(key))?;
                let Some(mut entry) = own.filter(|e| e.is_live(cutoff, now)) else {
                    return Ok(0);
                };

                let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
                let mut removed = 0;
                // Items are stored oldest first, so the list head is the end of the vec.
                let mut keep = vec![true; entry.items.len()];
                let order: Box<dyn Iterator<Item = usize>> = if count >= 0 {
                    Box::new((0..entry.items.len()).rev())
                } else {
                    Box::new(0..entry.items.len())
                };
                for i in order {
                    if removed == limit {
                        break;
                    }
                    if entry.items[i].value == value {
                        keep[i] = false;
                        removed += 1;
                    }
                }
                let mut flags = keep.into_iter();
                entry.items.retain(|_| flags.next().unwrap_or(true));
                write_local(view, &list_key(key), &entry)?;
                Ok(removed)
            })
            .await
    }

    async fn llen(&self, key: &str) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                Ok(live_lists(view, key, cutoff, now)?
                    .iter()
                    .map(|(_, e)| e.items.len())
                    .sum())
            })
            .await
    }

    /// Sets the expiry of this node's own contributions.
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let now = self.clock.now_ms();
        let at = now + ttl.as_millis() as u64;
        self.cluster
            .with_view(|view| -> StorageResult<_> {
                let cutoff = cutoff(view, key);
                let mut found = false;

                let scalar: Option<ScalarEntry> = local_entry(view, &scalar_key(key))?;
                if let Some(mut entry) = scalar.filter(|e| e.is_live(cutoff, now)) {
                    entry.expires_at = Some(at);
                    write_local(view, &scalar_key(key), &entry)?;
                    found = true;
                }

                let list: Option<ListEntry> = local_entry(view, &list_key(key))?;
                if let Some(mut entry) = list.filter(|e| e.is_live(cutoff, now)) {
                    entry.expires_at = Some(at);
                    write_local(view, &list_key(key), &entry)?;
                    found = true;
                }

                Ok(found)
            })
            .await
    }

    /// Records a tombstone for the prefix. Readers honor prefix tombstones at
    /// `:` boundaries only, so the prefix must end with `:`. Always returns 0
    /// since peers' keys cannot be enumerated.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        if !prefix.ends_with(':') {
            return Err(StorageError::Backend(format!(
                "mesh prefix deletes must end with ':', got {:?}",
                prefix
            )));
        }
        let now = self.clock.now_ms();
        self.cluster
            .with_view(|view| {
                let marker_key = reset_marker_key(prefix);
                let marker = self.stamp(now, latest_marker(view, &marker_key));
                view.set_local(&marker_key, marker.to_string());
            })
            .await;
        debug!(prefix = %prefix, "Recorded mesh prefix tombstone");
        Ok(0)
    }

    /// Only this node's own keys are swept; peers sweep theirs.
    async fn sweep_expired(&self) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        let retention = self.tombstone_retention;
        let removed = self
            .cluster
            .with_view(|view| {
                let mut stale = Vec::new();
                for (key, raw) in view.local_entries() {
                    if is_stale(view, &key, &raw, now, retention) {
                        stale.push(key);
                    }
                }
                for key in &stale {
                    view.delete_local(key);
                }
                stale.len()
            })
            .await;
        if removed > 0 {
            debug!(removed = removed, "Swept mesh entries");
        }
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "mesh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mesh::ClusterConfig;
    use std::net::SocketAddr;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("mesh-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "mesh-storage-test".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    async fn start(config: ClusterConfig, clock: &ManualClock) -> (Arc<Cluster>, MeshStorage) {
        let cluster = Arc::new(Cluster::start(config).await.unwrap());
        let storage = MeshStorage::new(cluster.clone(), Arc::new(clock.clone()));
        (cluster, storage)
    }

    async fn stop(cluster: Arc<Cluster>, storage: MeshStorage) {
        drop(storage);
        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_scalar_and_counter() {
        let clock = ManualClock::new(1_000);
        let (cluster, storage) = start(test_config(27950), &clock).await;

        storage.set("a", "hello".to_string(), None).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().as_deref(), Some("hello"));

        assert_eq!(storage.increment("c", 2.0).await.unwrap(), 2.0);
        assert_eq!(storage.increment("c", 3.0).await.unwrap(), 5.0);
        assert_eq!(storage.get("c").await.unwrap().as_deref(), Some("5"));

        assert!(storage.expire("c", Duration::from_millis(100)).await.unwrap());
        clock.advance(Duration::from_millis(100));
        assert_eq!(storage.get("c").await.unwrap(), None);

        stop(cluster, storage).await;
    }

    #[tokio::test]
    async fn test_mesh_lists() {
        let clock = ManualClock::new(1_000);
        let (cluster, storage) = start(test_config(27951), &clock).await;

        storage.lpush("l", "1".to_string()).await.unwrap();
        storage.lpush("l", "2".to_string()).await.unwrap();
        assert_eq!(storage.lpush("l", "3".to_string()).await.unwrap(), 3);

        assert_eq!(storage.lrange("l", 0, -1).await.unwrap(), vec!["3", "2", "1"]);
        assert_eq!(storage.lrem("l", 0, "2").await.unwrap(), 1);
        assert_eq!(storage.lrange("l", 0, -1).await.unwrap(), vec!["3", "1"]);
        assert_eq!(storage.llen("l").await.unwrap(), 2);

        stop(cluster, storage).await;
    }

    #[tokio::test]
    async fn test_mesh_delete_and_prefix_tombstones() {
        let clock = ManualClock::new(1_000);
        let (cluster, storage) = start(test_config(27952), &clock).await;

        storage.increment("rl:user:a:fw:1", 1.0).await.unwrap();
        storage.lpush("rl:user:a:sw", "1".to_string()).await.unwrap();
        storage.increment("rl:user:b:fw:1", 1.0).await.unwrap();

        storage.delete_prefix("rl:user:a:").await.unwrap();
        assert_eq!(storage.get("rl:user:a:fw:1").await.unwrap(), None);
        assert_eq!(storage.llen("rl:user:a:sw").await.unwrap(), 0);
        assert_eq!(storage.get("rl:user:b:fw:1").await.unwrap().as_deref(), Some("1"));

        // Writes in the same millisecond as the tombstone survive it.
        assert_eq!(storage.increment("rl:user:a:fw:1", 1.0).await.unwrap(), 1.0);

        assert!(storage.delete("rl:user:b:fw:1").await.unwrap());
        assert_eq!(storage.get("rl:user:b:fw:1").await.unwrap(), None);

        assert!(storage.delete_prefix("no-colon").await.is_err());

        stop(cluster, storage).await;
    }

    async fn own_keys(cluster: &Cluster) -> Vec<String> {
        let mut keys: Vec<String> = cluster
            .with_view(|view| view.local_entries())
            .await
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.contains('|'))
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_mesh_sweep_drops_dead_entries_and_old_tombstones() {
        let clock = ManualClock::new(1_000);
        let (cluster, storage) = start(test_config(27955), &clock).await;
        let storage = storage.with_tombstone_retention(Duration::from_millis(500));

        storage
            .set("a", "short".to_string(), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        storage.increment("c", 1.0).await.unwrap();
        storage.increment("gone", 1.0).await.unwrap();
        assert!(storage.delete("gone").await.unwrap());

        // The deleted counter goes at once, its tombstone stays.
        assert_eq!(storage.sweep_expired().await.unwrap(), 1);
        assert_eq!(own_keys(&cluster).await, vec!["del|gone", "kv|a", "kv|c"]);

        clock.advance(Duration::from_millis(100));
        assert_eq!(storage.sweep_expired().await.unwrap(), 1);
        assert_eq!(own_keys(&cluster).await, vec!["del|gone", "kv|c"]);

        clock.advance(Duration::from_millis(500));
        assert_eq!(storage.sweep_expired().await.unwrap(), 1);
        assert_eq!(own_keys(&cluster).await, vec!["kv|c"]);

        assert_eq!(storage.sweep_expired().await.unwrap(), 0);
        assert_eq!(storage.get("c").await.unwrap().as_deref(), Some("1"));
        assert_eq!(storage.get("gone").await.unwrap(), None);

        stop(cluster, storage).await;
    }

    #[tokio::test]
    async fn test_mesh_counters_sum_across_nodes() {
        let clock = ManualClock::new(1_000);
        let (cluster1, storage1) = start(test_config(27953), &clock).await;

        let mut config2 = test_config(27954);
        config2.seed_nodes = vec!["127.0.0.1:27953".to_string()];
        let (cluster2, storage2) = start(config2, &clock).await;

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        storage1.increment("shared", 5.0).await.unwrap();
        storage2.increment("shared", 3.0).await.unwrap();

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(storage1.get("shared").await.unwrap().as_deref(), Some("8"));
        assert_eq!(storage2.get("shared").await.unwrap().as_deref(), Some("8"));

        stop(cluster1, storage1).await;
        stop(cluster2, storage2).await;
    }
}
