//! Durable delayed task queue on Redis.
//!
//! Tasks live in a sorted set scored by their earliest-eligible time (epoch
//! millis). Claiming due tasks is one Lua script, so two workers never dequeue
//! the same task. Tasks can carry a group label; a per-group counter lets the
//! recovery sweeper ask how much work is still queued for one stage run.

use campaign_core::config::RedisConfig;
use campaign_core::CampaignResult;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::client::{cache_err, connect};

const PUSH: &str = r"
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[3], ARGV[1], ARGV[4])
  redis.call('HINCRBY', KEYS[4], ARGV[4], 1)
end
return 1
";

const POP_DUE: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local payload = redis.call('HGET', KEYS[2], id)
  redis.call('HDEL', KEYS[2], id)
  local group = redis.call('HGET', KEYS[3], id)
  if group then
    redis.call('HDEL', KEYS[3], id)
    if redis.call('HINCRBY', KEYS[4], group, -1) <= 0 then
      redis.call('HDEL', KEYS[4], group)
    end
  end
  if payload then
    table.insert(out, payload)
  end
end
return out
";

/// Key layout for one queue. All keys share the `{prefix}` hash tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub schedule: String,
    pub payloads: String,
    pub task_groups: String,
    pub group_counts: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        let base = format!("{{{prefix}}}:queue");
        Self {
            schedule: format!("{base}:schedule"),
            payloads: format!("{base}:payloads"),
            task_groups: format!("{base}:task_groups"),
            group_counts: format!("{base}:group_counts"),
        }
    }
}

/// Redis sorted-set queue with eligibility timestamps.
#[derive(Clone)]
pub struct RedisDelayedQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
    push: redis::Script,
    pop_due: redis::Script,
}

impl RedisDelayedQueue {
    pub async fn new(config: &RedisConfig) -> CampaignResult<Self> {
        let conn = connect(config).await?;
        Ok(Self::with_connection(conn, &config.key_prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            keys: QueueKeys::new(prefix),
            push: redis::Script::new(PUSH),
            pop_due: redis::Script::new(POP_DUE),
        }
    }

    /// Stores `payload` under `id`, eligible from `eligible_at_ms`.
    pub async fn push(
        &self,
        id: &str,
        payload: &str,
        group: Option<&str>,
        eligible_at_ms: i64,
    ) -> CampaignResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .push
            .key(&self.keys.schedule)
            .key(&self.keys.payloads)
            .key(&self.keys.task_groups)
            .key(&self.keys.group_counts)
            .arg(id)
            .arg(payload)
            .arg(eligible_at_ms)
            .arg(group.unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        metrics::counter!("queue.pushed").increment(1);
        Ok(())
    }

    /// Atomically claims up to `limit` payloads whose eligibility time is at
    /// or before `now_ms`.
    pub async fn pop_due(&self, now_ms: i64, limit: usize) -> CampaignResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = self
            .pop_due
            .key(&self.keys.schedule)
            .key(&self.keys.payloads)
            .key(&self.keys.task_groups)
            .key(&self.keys.group_counts)
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        if !payloads.is_empty() {
            debug!(count = payloads.len(), "Claimed due tasks");
            metrics::counter!("queue.claimed").increment(payloads.len() as u64);
        }
        Ok(payloads)
    }

    /// Number of queued tasks labelled with `group`.
    pub async fn group_len(&self, group: &str) -> CampaignResult<usize> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = redis::cmd("HGET")
            .arg(&self.keys.group_counts)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }

    pub async fn len(&self) -> CampaignResult<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(&self.keys.schedule)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}
