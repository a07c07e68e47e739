//! At-least-once work queue with delayed eligibility.
//!
//! Waiting is always a re-queue with a later eligibility time, never a sleep
//! inside a worker, so a worker that dies loses only the task it held.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use campaign_cache::RedisDelayedQueue;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::task::{QueuedTask, Task, TaskHandle};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues `task`, eligible after `delay` or immediately.
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> CampaignResult<TaskHandle>;

    /// Claims up to `limit` tasks that are eligible now, earliest first.
    async fn dequeue(&self, limit: usize) -> CampaignResult<Vec<QueuedTask>>;

    /// Tasks still queued for one stage run.
    async fn queued_for_stage(&self, stage_run_id: Uuid) -> CampaignResult<usize>;

    async fn len(&self) -> CampaignResult<usize>;
}

fn eligible_at(now: DateTime<Utc>, delay: Option<Duration>) -> CampaignResult<DateTime<Utc>> {
    match delay {
        None => Ok(now),
        Some(delay) => {
            let delay = chrono::Duration::from_std(delay)
                .map_err(|e| CampaignError::Internal(e.into()))?;
            Ok(now + delay)
        }
    }
}

#[derive(Default)]
struct MemoryQueueState {
    seq: u64,
    entries: BTreeMap<(DateTime<Utc>, u64), QueuedTask>,
    per_stage: HashMap<Uuid, usize>,
}

/// Single-process queue ordered by eligibility time.
pub struct MemoryWorkQueue {
    state: Mutex<MemoryQueueState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWorkQueue")
            .field("queued", &self.state.lock().entries.len())
            .finish()
    }
}

impl MemoryWorkQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            clock,
        }
    }

    /// Every queued task regardless of eligibility, earliest first.
    pub fn snapshot(&self) -> Vec<QueuedTask> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Drops every queued task, returning how many were lost. Used to
    /// simulate a worker fleet dying with work in hand.
    pub fn discard_all(&self) -> usize {
        let mut state = self.state.lock();
        let lost = state.entries.len();
        state.entries.clear();
        state.per_stage.clear();
        lost
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> CampaignResult<TaskHandle> {
        let handle = TaskHandle {
            id: Uuid::new_v4(),
            eligible_at: eligible_at(self.clock.now(), delay)?,
        };
        let mut state = self.state.lock();
        state.seq += 1;
        let key = (handle.eligible_at, state.seq);
        *state.per_stage.entry(task.stage_run_id()).or_default() += 1;
        state.entries.insert(key, QueuedTask { handle, task });
        Ok(handle)
    }

    async fn dequeue(&self, limit: usize) -> CampaignResult<Vec<QueuedTask>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(entry) = state.entries.first_entry() else {
                break;
            };
            if entry.key().0 > now {
                break;
            }
            let queued = entry.remove();
            let stage_run_id = queued.task.stage_run_id();
            if let Some(count) = state.per_stage.get_mut(&stage_run_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.per_stage.remove(&stage_run_id);
                }
            }
            claimed.push(queued);
        }
        Ok(claimed)
    }

    async fn queued_for_stage(&self, stage_run_id: Uuid) -> CampaignResult<usize> {
        Ok(self
            .state
            .lock()
            .per_stage
            .get(&stage_run_id)
            .copied()
            .unwrap_or(0))
    }

    async fn len(&self) -> CampaignResult<usize> {
        Ok(self.state.lock().entries.len())
    }
}

/// Durable queue on the Redis sorted-set store, grouped by stage run.
pub struct RedisWorkQueue {
    inner: RedisDelayedQueue,
    clock: Arc<dyn Clock>,
}

impl RedisWorkQueue {
    pub fn new(inner: RedisDelayedQueue, clock: Arc<dyn Clock>) -> Self {
        Self { inner, clock }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> CampaignResult<TaskHandle> {
        let handle = TaskHandle {
            id: Uuid::new_v4(),
            eligible_at: eligible_at(self.clock.now(), delay)?,
        };
        let group = task.stage_run_id().to_string();
        let payload = serde_json::to_string(&QueuedTask { handle, task })?;
        self.inner
            .push(
                &handle.id.to_string(),
                &payload,
                Some(&group),
                handle.eligible_at.timestamp_millis(),
            )
            .await?;
        Ok(handle)
    }

    async fn dequeue(&self, limit: usize) -> CampaignResult<Vec<QueuedTask>> {
        let now_ms = self.clock.now().timestamp_millis();
        let payloads = self.inner.pop_due(now_ms, limit).await?;
        let mut tasks = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<QueuedTask>(&payload) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(error = %e, "Dropping malformed queued task"),
            }
        }
        Ok(tasks)
    }

    async fn queued_for_stage(&self, stage_run_id: Uuid) -> CampaignResult<usize> {
        self.inner.group_len(&stage_run_id.to_string()).await
    }

    async fn len(&self) -> CampaignResult<usize> {
        self.inner.len().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn send(stage_run_id: Uuid, recipient: &str) -> Task {
        Task::Send {
            stage_run_id,
            recipient_id: recipient.into(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_delayed_tasks_wait_for_eligibility() {
        let clock = Arc::new(ManualClock::default());
        let queue = MemoryWorkQueue::new(clock.clone());
        let stage = Uuid::new_v4();

        queue
            .enqueue(send(stage, "later"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        queue.enqueue(send(stage, "now"), None).await.unwrap();
        assert_eq!(queue.queued_for_stage(stage).await.unwrap(), 2);

        let first = queue.dequeue(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].task, send(stage, "now"));
        assert!(queue.dequeue(10).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(60));
        let second = queue.dequeue(10).await.unwrap();
        assert_eq!(second[0].task, send(stage, "later"));
        assert_eq!(queue.queued_for_stage(stage).await.unwrap(), 0);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_respects_limit_and_fifo_within_instant() {
        let clock = Arc::new(ManualClock::default());
        let queue = MemoryWorkQueue::new(clock);
        let stage = Uuid::new_v4();
        for i in 0..5 {
            queue.enqueue(send(stage, &format!("r{i}")), None).await.unwrap();
        }
        let batch = queue.dequeue(3).await.unwrap();
        let ids: Vec<_> = batch
            .iter()
            .map(|q| match &q.task {
                Task::Send { recipient_id, .. } => recipient_id.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);
        assert_eq!(queue.queued_for_stage(stage).await.unwrap(), 2);
    }
}
