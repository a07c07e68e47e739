//! Shared counter store used for cross-process channel gate state.
//!
//! Workers run as independent processes, so every mutation here has to be a
//! single atomic operation on the backing store. Nothing in this trait reads a
//! value, computes on it locally, and writes it back.

use std::time::Duration;

use async_trait::async_trait;
use campaign_core::CampaignResult;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and returns the new value. The key expires `window`
    /// after its first increment; later increments do not extend it.
    async fn incr_windowed(&self, key: &str, window: Duration) -> CampaignResult<u64>;

    /// Decrements `key` without going below zero and returns the new value.
    /// A missing key reads as zero. The remaining TTL is preserved.
    async fn decr_floor(&self, key: &str) -> CampaignResult<u64>;

    /// Sets `key` to `value` with a TTL only when it does not exist yet.
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration) -> CampaignResult<bool>;

    async fn get(&self, key: &str) -> CampaignResult<Option<i64>>;

    /// Remaining lifetime of `key`. `None` when the key is missing or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> CampaignResult<Option<Duration>>;

    /// Removes `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> CampaignResult<bool>;
}
