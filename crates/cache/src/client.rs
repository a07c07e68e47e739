//! Redis-backed counter store for channel gate state shared across workers.
//! Every operation is a single command or a server-side script, so concurrent
//! workers never interleave a read and a write on the same key.

use std::time::Duration;

use async_trait::async_trait;
use campaign_core::config::RedisConfig;
use campaign_core::{CampaignError, CampaignResult};
use redis::aio::ConnectionManager;
use tracing::info;

use crate::store::CounterStore;

const INCR_WINDOWED: &str = r"
local v = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
";

const DECR_FLOOR: &str = r"
local v = tonumber(redis.call('GET', KEYS[1]) or '0')
if v <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
";

pub(crate) fn cache_err(err: redis::RedisError) -> CampaignError {
    CampaignError::Cache(err.to_string())
}

pub(crate) async fn connect(config: &RedisConfig) -> CampaignResult<ConnectionManager> {
    let url = config
        .urls
        .first()
        .cloned()
        .unwrap_or_else(|| "redis://localhost:6379".to_string());

    info!(url = %url, "Connecting to Redis");

    let client = redis::Client::open(url.as_str()).map_err(cache_err)?;
    let connect = ConnectionManager::new(client);
    let mut conn = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
        .await
        .map_err(|_| CampaignError::Cache(format!("timed out connecting to {url}")))?
        .map_err(cache_err)?;

    // Verify connectivity
    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(cache_err)?;
    info!(response = %pong, "Redis connection established");
    Ok(conn)
}

/// Key layout for gate counters. Every key carries the same hash tag so
/// scripts touching several of them stay on one cluster slot.
#[derive(Debug, Clone)]
struct CounterKeys {
    prefix: String,
}

impl CounterKeys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: format!("{{{prefix}}}:gate"),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

/// Redis expiries are whole milliseconds and must be positive.
fn expiry_ms(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

fn set_if_absent_cmd(key: String, value: i64, ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value).arg("NX").arg("PX").arg(expiry_ms(ttl));
    cmd
}

/// Counter store on Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    keys: CounterKeys,
    incr_windowed: redis::Script,
    decr_floor: redis::Script,
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection.
    pub async fn new(config: &RedisConfig) -> CampaignResult<Self> {
        let conn = connect(config).await?;
        Ok(Self::with_connection(conn, &config.key_prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            keys: CounterKeys::new(prefix),
            incr_windowed: redis::Script::new(INCR_WINDOWED),
            decr_floor: redis::Script::new(DECR_FLOOR),
        }
    }

    fn key(&self, key: &str) -> String {
        self.keys.key(key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_windowed(&self, key: &str, window: Duration) -> CampaignResult<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .incr_windowed
            .key(self.key(key))
            .arg(expiry_ms(window))
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        metrics::counter!("cache.gate.incr").increment(1);
        Ok(value.max(0) as u64)
    }

    async fn decr_floor(&self, key: &str) -> CampaignResult<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .decr_floor
            .key(self.key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(value.max(0) as u64)
    }

    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration) -> CampaignResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = set_if_absent_cmd(self.key(key), value, ttl)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> CampaignResult<Option<i64>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(cache_err)
    }

    async fn ttl(&self, key: &str) -> CampaignResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        // -2: missing, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn delete(&self, key: &str) -> CampaignResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(removed > 0)
    }
}
