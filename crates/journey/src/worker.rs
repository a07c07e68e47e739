//! Task worker — consumes chunk-dispatch and per-recipient send tasks.
//!
//! Every send passes the channel gate first. Gate deferrals requeue the task
//! unchanged and never count as an attempt; transport failures and task
//! timeouts consume an attempt and retry with backoff until the policy gives
//! up.

use std::sync::Arc;
use std::time::Duration;

use campaign_channels::{ChannelGate, SendGateway, TransportError};
use campaign_core::channels::{Channel, Recipient};
use campaign_core::config::WorkerConfig;
use campaign_core::event_bus::{make_send_event, noop_sink, EventSink};
use campaign_core::types::EventType;
use campaign_core::{CampaignError, CampaignResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dispatcher::{BatchDispatcher, ChunkOutcome};
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::scheduler::ExecutionScheduler;
use crate::store::FlowStore;
use crate::task::{QueuedTask, Task};
use crate::types::{DeliveryState, SendRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    ChunkDispatched { enqueued: u64 },
    Sent,
    /// Gate said not yet; requeued after the delay.
    Deferred(Duration),
    Retrying { attempt: u32, delay: Duration },
    Failed,
    /// Nothing left to do (duplicate delivery, settled record, unknown stage).
    Skipped,
}

impl TaskOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::ChunkDispatched { .. } => "chunk_dispatched",
            TaskOutcome::Sent => "sent",
            TaskOutcome::Deferred(_) => "deferred",
            TaskOutcome::Retrying { .. } => "retrying",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Skipped => "skipped",
        }
    }
}

pub struct TaskWorker {
    store: Arc<dyn FlowStore>,
    queue: Arc<dyn WorkQueue>,
    scheduler: Arc<ExecutionScheduler>,
    dispatcher: Arc<BatchDispatcher>,
    gateway: Arc<SendGateway>,
    gate: Arc<ChannelGate>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish()
    }
}

/// Rebuilds the addressable recipient from the destination captured when the
/// send record was created.
fn recipient_from(record: &SendRecord) -> Recipient {
    let destination = Some(record.destination.clone());
    Recipient {
        id: record.recipient_id.clone(),
        email: destination.clone().filter(|_| record.channel == Channel::Email),
        phone: destination.filter(|_| record.channel == Channel::Sms),
    }
}

impl TaskWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn FlowStore>,
        queue: Arc<dyn WorkQueue>,
        scheduler: Arc<ExecutionScheduler>,
        dispatcher: Arc<BatchDispatcher>,
        gateway: Arc<SendGateway>,
        gate: Arc<ChannelGate>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            scheduler,
            dispatcher,
            gateway,
            gate,
            retry: RetryPolicy::from_config(&config),
            clock,
            config,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn process(&self, queued: QueuedTask) -> CampaignResult<TaskOutcome> {
        let outcome = match queued.task {
            Task::DispatchChunk {
                stage_run_id,
                chunk_index,
                ..
            } => self.dispatch_chunk(stage_run_id, chunk_index).await?,
            Task::Send {
                stage_run_id,
                ref recipient_id,
                attempt,
            } => self.send(stage_run_id, recipient_id, attempt).await?,
        };
        metrics::counter!("flow.tasks_processed", "kind" => queued.task.kind(), "outcome" => outcome.as_str())
            .increment(1);
        Ok(outcome)
    }

    async fn dispatch_chunk(
        &self,
        stage_run_id: Uuid,
        chunk_index: u32,
    ) -> CampaignResult<TaskOutcome> {
        let outcome = match self
            .dispatcher
            .dispatch_chunk(stage_run_id, chunk_index)
            .await?
        {
            ChunkOutcome::Dispatched(chunk) => TaskOutcome::ChunkDispatched {
                enqueued: chunk.enqueued,
            },
            ChunkOutcome::Skipped => TaskOutcome::Skipped,
        };
        // The last chunk may have produced no sends at all.
        self.scheduler.check_stage_completion(stage_run_id).await?;
        Ok(outcome)
    }

    async fn send(
        &self,
        stage_run_id: Uuid,
        recipient_id: &str,
        attempt: u32,
    ) -> CampaignResult<TaskOutcome> {
        let Some(record) = self
            .store
            .get_send_record(stage_run_id, recipient_id)
            .await?
        else {
            warn!(stage_run_id = %stage_run_id, recipient_id, "Send task without a record");
            return Ok(TaskOutcome::Skipped);
        };
        if record.state != DeliveryState::Pending {
            return Ok(TaskOutcome::Skipped);
        }
        let stage = self
            .store
            .get_stage_run(stage_run_id)
            .await?
            .ok_or_else(|| CampaignError::not_found(format!("stage run {stage_run_id}")))?;

        if stage.cancelled || stage.state.is_terminal() {
            let reason = if stage.cancelled {
                "cancelled"
            } else {
                "stage already settled"
            };
            self.fail_record(&record, reason.to_string(), record.attempts)
                .await?;
            self.scheduler.check_stage_completion(stage_run_id).await?;
            return Ok(TaskOutcome::Failed);
        }

        let decision = self.gate.acquire(record.channel).await?;
        if let Some(retry_after) = decision.retry_after() {
            self.queue
                .enqueue(
                    Task::Send {
                        stage_run_id,
                        recipient_id: recipient_id.to_string(),
                        attempt,
                    },
                    Some(retry_after),
                )
                .await?;
            self.event_sink.emit(make_send_event(
                EventType::MessageDeferred,
                stage_run_id,
                recipient_id,
                record.channel,
                Some(decision.reason().to_string()),
            ));
            return Ok(TaskOutcome::Deferred(retry_after));
        }

        let content = stage.content.clone().ok_or_else(|| {
            CampaignError::Store(format!("stage run {stage_run_id} has no content"))
        })?;
        let recipient = recipient_from(&record);
        let result = self
            .gateway
            .send(record.channel, stage_run_id, &recipient, &content)
            .await;

        let outcome = match result {
            Ok(receipt) => {
                self.gate.record_success(record.channel).await?;
                let now = self.clock.now();
                self.store
                    .update_send_record(
                        stage_run_id,
                        recipient_id,
                        Box::new(move |r| {
                            if r.state != DeliveryState::Pending {
                                return Ok(());
                            }
                            r.attempts += 1;
                            r.mark_sent(receipt.provider_message_id, now);
                            Ok(())
                        }),
                    )
                    .await?;
                self.event_sink.emit(make_send_event(
                    EventType::MessageSent,
                    stage_run_id,
                    recipient_id,
                    record.channel,
                    None,
                ));
                TaskOutcome::Sent
            }
            Err(err) => self.handle_failure(&record, err).await?,
        };

        self.scheduler.check_stage_completion(stage_run_id).await?;
        Ok(outcome)
    }

    async fn handle_failure(
        &self,
        record: &SendRecord,
        err: TransportError,
    ) -> CampaignResult<TaskOutcome> {
        if err.counts_against_channel() {
            self.gate.record_failure(record.channel).await?;
        }
        let attempts = record.attempts + 1;

        if err.is_retryable() && self.retry.should_retry(attempts) {
            let delay = self.retry.backoff_for_attempt(attempts - 1);
            let error = err.to_string();
            let now = self.clock.now();
            self.store
                .update_send_record(
                    record.stage_run_id,
                    &record.recipient_id,
                    Box::new(move |r| {
                        r.attempts = attempts;
                        r.error = Some(error);
                        r.updated_at = now;
                        Ok(())
                    }),
                )
                .await?;
            self.queue
                .enqueue(
                    Task::Send {
                        stage_run_id: record.stage_run_id,
                        recipient_id: record.recipient_id.clone(),
                        attempt: attempts,
                    },
                    Some(delay),
                )
                .await?;
            debug!(
                stage_run_id = %record.stage_run_id,
                recipient_id = %record.recipient_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Send will be retried"
            );
            return Ok(TaskOutcome::Retrying {
                attempt: attempts,
                delay,
            });
        }

        self.fail_record(record, err.to_string(), attempts).await?;
        Ok(TaskOutcome::Failed)
    }

    async fn fail_record(
        &self,
        record: &SendRecord,
        reason: String,
        attempts: u32,
    ) -> CampaignResult<()> {
        let now = self.clock.now();
        let detail = reason.clone();
        self.store
            .update_send_record(
                record.stage_run_id,
                &record.recipient_id,
                Box::new(move |r| {
                    if r.state != DeliveryState::Pending {
                        return Ok(());
                    }
                    r.attempts = attempts;
                    r.mark_failed(reason, now);
                    Ok(())
                }),
            )
            .await?;
        self.event_sink.emit(make_send_event(
            EventType::MessageFailed,
            record.stage_run_id,
            record.recipient_id.clone(),
            record.channel,
            Some(detail),
        ));
        Ok(())
    }

    /// Dequeues up to `limit` eligible tasks and processes them in order.
    /// Task errors are logged and do not stop the batch.
    pub async fn process_due(&self, limit: usize) -> CampaignResult<usize> {
        let batch = self.queue.dequeue(limit).await?;
        let processed = batch.len();
        let task_timeout = Duration::from_millis(self.config.task_timeout_ms);
        for queued in batch {
            let task = queued.task.clone();
            match tokio::time::timeout(task_timeout, self.process(queued)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(task = task.kind(), stage_run_id = %task.stage_run_id(), error = %e, "Task failed");
                    metrics::counter!("flow.task_errors", "kind" => task.kind()).increment(1);
                }
                Err(_) => {
                    warn!(
                        task = task.kind(),
                        stage_run_id = %task.stage_run_id(),
                        timeout_ms = self.config.task_timeout_ms,
                        "Task timed out"
                    );
                    metrics::counter!("flow.task_timeouts", "kind" => task.kind()).increment(1);
                    if let Err(e) = self.handle_timeout(task.clone()).await {
                        warn!(task = task.kind(), stage_run_id = %task.stage_run_id(), error = %e, "Timed-out task not settled");
                    }
                }
            }
        }
        Ok(processed)
    }

    /// A timed-out task counts as a failed attempt. Sends go through the
    /// normal transport-failure path; chunk dispatches retry with backoff and
    /// fail their stage once the attempts run out.
    async fn handle_timeout(&self, task: Task) -> CampaignResult<TaskOutcome> {
        match task {
            Task::Send {
                stage_run_id,
                recipient_id,
                ..
            } => {
                let Some(record) = self
                    .store
                    .get_send_record(stage_run_id, &recipient_id)
                    .await?
                else {
                    return Ok(TaskOutcome::Skipped);
                };
                if record.state != DeliveryState::Pending {
                    return Ok(TaskOutcome::Skipped);
                }
                let outcome = self
                    .handle_failure(&record, TransportError::Timeout(self.config.task_timeout_ms))
                    .await?;
                self.scheduler.check_stage_completion(stage_run_id).await?;
                Ok(outcome)
            }
            Task::DispatchChunk {
                stage_run_id,
                chunk_index,
                attempt,
            } => {
                let attempts = attempt + 1;
                if self.retry.should_retry(attempts) {
                    let delay = self.retry.backoff_for_attempt(attempt);
                    self.queue
                        .enqueue(
                            Task::DispatchChunk {
                                stage_run_id,
                                chunk_index,
                                attempt: attempts,
                            },
                            Some(delay),
                        )
                        .await?;
                    return Ok(TaskOutcome::Retrying {
                        attempt: attempts,
                        delay,
                    });
                }
                let Some(stage) = self.store.get_stage_run(stage_run_id).await? else {
                    return Ok(TaskOutcome::Skipped);
                };
                self.scheduler
                    .fail_stage(
                        &stage,
                        format!("chunk {chunk_index} timed out after {attempts} attempts"),
                    )
                    .await?;
                Ok(TaskOutcome::Failed)
            }
        }
    }

    /// Processes tasks until the queue has nothing eligible. Returns the
    /// number of tasks handled.
    pub async fn drain(&self) -> CampaignResult<usize> {
        let mut total = 0;
        loop {
            let n = self.process_due(self.config.dequeue_batch.max(1)).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Polls the queue until `shutdown` flips to true.
    pub async fn run(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(worker_id, "Task worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            loop {
                match self.process_due(self.config.dequeue_batch.max(1)).await {
                    Ok(0) => break,
                    Ok(_) if *shutdown.borrow() => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(worker_id, error = %e, "Dequeue failed");
                        break;
                    }
                }
            }
        }
        info!(worker_id, "Task worker stopped");
    }
}
