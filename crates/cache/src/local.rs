//! In-process counter store backed by DashMap.
//! Used for single-node deployments and tests; each operation holds the
//! shard lock for its key, which gives the same atomicity as the Redis scripts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use campaign_core::CampaignResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::store::CounterStore;

struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lock-free local counter store with per-key expiry.
#[derive(Clone, Default)]
pub struct LocalCounterStore {
    store: Arc<DashMap<String, CounterEntry>>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired(now));
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn incr_windowed(&self, key: &str, window: Duration) -> CampaignResult<u64> {
        let now = Instant::now();
        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                value: 0,
                expires_at: None,
            });
        if entry.is_expired(now) {
            entry.value = 0;
            entry.expires_at = None;
        }
        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + window);
        }
        entry.value += 1;
        Ok(entry.value.max(0) as u64)
    }

    async fn decr_floor(&self, key: &str) -> CampaignResult<u64> {
        let now = Instant::now();
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(0);
                }
                let entry = occupied.get_mut();
                entry.value = (entry.value - 1).max(0);
                Ok(entry.value as u64)
            }
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration) -> CampaignResult<bool> {
        let now = Instant::now();
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(false);
                }
                occupied.insert(CounterEntry {
                    value,
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CounterEntry {
                    value,
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> CampaignResult<Option<i64>> {
        let now = Instant::now();
        Ok(self
            .store
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value))
    }

    async fn ttl(&self, key: &str) -> CampaignResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .store
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> CampaignResult<bool> {
        let now = Instant::now();
        Ok(self
            .store
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }
}
