//! In-memory storage backend.
//!
//! Uses DashMap for thread-safe concurrent access. Every entry carries an
//! absolute expiry; reads treat expired entries as absent and the limiter's
//! background sweep evicts them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{format_number, list_range_bounds, parse_number, Storage, StorageResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> Slot<T> {
    fn new(value: T, expires_at: Option<u64>) -> Self {
        Self { value, expires_at }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn expiry(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl.as_millis() as u64)
}

/// In-process storage backend.
#[derive(Debug)]
pub struct MemoryStorage {
    values: DashMap<String, Slot<String>>,
    lists: DashMap<String, Slot<VecDeque<String>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    /// Create a store driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        debug!("Creating new in-memory storage");
        Self {
            values: DashMap::new(),
            lists: DashMap::new(),
            clock,
        }
    }

    /// Number of stored scalars and lists, including expired ones not yet swept.
    pub fn key_count(&self) -> usize {
        self.values.len() + self.lists.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let now = self.clock.now_ms();
        match self.values.get(key) {
            Some(slot) if !slot.is_expired(now) => return Ok(Some(slot.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.values.remove_if(key, |_, slot| slot.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StorageResult<()> {
        let now = self.clock.now_ms();
        trace!(key = %key, ttl = ?ttl, "set");
        self.values
            .insert(key.to_string(), Slot::new(value, ttl.map(|t| expiry(now, t))));
        Ok(())
    }

    async fn increment(&self, key: &str, amount: f64) -> StorageResult<f64> {
        let now = self.clock.now_ms();
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut slot = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(format_number(0.0), None));
        if slot.is_expired(now) {
            *slot = Slot::new(format_number(0.0), None);
        }
        let next = parse_number(key, &slot.value)? + amount;
        slot.value = format_number(next);
        trace!(key = %key, amount = amount, value = next, "increment");
        Ok(next)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = self.clock.now_ms();
        let value = self.values.remove(key).is_some_and(|(_, s)| !s.is_expired(now));
        let list = self.lists.remove(key).is_some_and(|(_, s)| !s.is_expired(now));
        Ok(value || list)
    }

    async fn lpush(&self, key: &str, value: String) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        let mut slot = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(VecDeque::new(), None));
        if slot.is_expired(now) {
            *slot = Slot::new(VecDeque::new(), None);
        }
        slot.value.push_front(value);
        Ok(slot.value.len())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StorageResult<Vec<String>> {
        let now = self.clock.now_ms();
        let Some(slot) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        if slot.is_expired(now) {
            return Ok(Vec::new());
        }
        Ok(match list_range_bounds(slot.value.len(), start, stop) {
            Some((from, to)) => slot.value.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        let removed = {
            let Some(mut slot) = self.lists.get_mut(key) else {
                return Ok(0);
            };
            if slot.is_expired(now) {
                return Ok(0);
            }
            let list = &mut slot.value;
            let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
            let mut removed = 0;
            if count >= 0 {
                let mut i = 0;
                while i < list.len() && removed < limit {
                    if list[i] == value {
                        list.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            } else {
                let mut i = list.len();
                while i > 0 && removed < limit {
                    i -= 1;
                    if list[i] == value {
                        list.remove(i);
                        removed += 1;
                    }
                }
            }
            removed
        };
        // Empty lists cease to exist.
        self.lists.remove_if(key, |_, slot| slot.value.is_empty());
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        Ok(self
            .lists
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map_or(0, |slot| slot.value.len()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let now = self.clock.now_ms();
        let at = expiry(now, ttl);
        let mut found = false;
        if let Some(mut slot) = self.values.get_mut(key) {
            if !slot.is_expired(now) {
                slot.expires_at = Some(at);
                found = true;
            }
        }
        if let Some(mut slot) = self.lists.get_mut(key) {
            if !slot.is_expired(now) {
                slot.expires_at = Some(at);
                found = true;
            }
        }
        Ok(found)
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let before = self.key_count();
        self.values.retain(|key, _| !key.starts_with(prefix));
        self.lists.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.key_count());
        debug!(prefix = %prefix, removed = removed, "Deleted keys by prefix");
        Ok(removed)
    }

    async fn sweep_expired(&self) -> StorageResult<usize> {
        let now = self.clock.now_ms();
        let before = self.key_count();
        self.values.retain(|_, slot| !slot.is_expired(now));
        self.lists.retain(|_, slot| !slot.is_expired(now));
        let evicted = before.saturating_sub(self.key_count());
        if evicted > 0 {
            debug!(evicted = evicted, "Swept expired entries");
        }
        Ok(evicted)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
