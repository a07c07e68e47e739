//! Recovery sweeper — judges stale stage runs from durable evidence.
//!
//! A stage run stuck in `executing`/`batching` past its staleness threshold
//! is assessed from its send records and the work queue, never from worker
//! memory. The sweeper either resumes work it can prove was lost, or hands a
//! verdict back to the scheduler, which owns settling stages and advancing
//! executions.

use std::sync::Arc;

use campaign_core::config::RecoveryConfig;
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::EventType;
use campaign_core::CampaignResult;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::completion::{CompletionVerdict, StageCompletionPolicy};
use crate::dispatcher::BatchDispatcher;
use crate::queue::WorkQueue;
use crate::state_machine::check_stage;
use crate::store::FlowStore;
use crate::task::Task;
use crate::types::{NodeKind, StageRun, StageRunState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Evidence shows the stage finished; settle it as completed.
    ForceComplete,
    /// Evidence shows the stage cannot finish.
    Fail(String),
    /// Lost work was re-enqueued.
    Resumed { chunks: u32, sends: usize },
    /// A condition stage was put back to `pending` for re-evaluation.
    Reset,
    /// Work is still in flight; look again later.
    StillRunning,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::ForceComplete => "force_complete",
            RecoveryAction::Fail(_) => "fail",
            RecoveryAction::Resumed { .. } => "resumed",
            RecoveryAction::Reset => "reset",
            RecoveryAction::StillRunning => "still_running",
        }
    }
}

pub struct RecoverySweeper {
    store: Arc<dyn FlowStore>,
    queue: Arc<dyn WorkQueue>,
    dispatcher: Arc<BatchDispatcher>,
    policy: StageCompletionPolicy,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RecoverySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverySweeper")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish()
    }
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn FlowStore>,
        queue: Arc<dyn WorkQueue>,
        dispatcher: Arc<BatchDispatcher>,
        policy: StageCompletionPolicy,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            policy,
            clock,
            config,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Staleness threshold for the stage's dispatch mode.
    pub fn stale_after(&self, stage: &StageRun) -> Duration {
        let secs = if stage.is_chunked() {
            self.config.stale_chunked_secs
        } else {
            self.config.stale_executing_secs
        };
        crate::scheduler::secs(secs)
    }

    /// Last sign of life: start, or the latest recorded dispatch progress.
    pub fn last_activity(stage: &StageRun) -> DateTime<Utc> {
        let started = stage.started_at.unwrap_or(stage.scheduled_at);
        stage
            .progress
            .as_ref()
            .map_or(started, |p| p.last_progress_at.max(started))
    }

    pub fn is_stale(&self, stage: &StageRun, now: DateTime<Utc>) -> bool {
        stage.state.is_active() && now - Self::last_activity(stage) >= self.stale_after(stage)
    }

    /// Assesses a stale stage run and resumes what was lost.
    pub async fn recover(&self, stage: &StageRun) -> CampaignResult<RecoveryAction> {
        let action = match stage.node_kind {
            _ if stage.cancelled => RecoveryAction::Fail("execution cancelled".into()),
            NodeKind::Condition => self.reset_condition(stage).await?,
            NodeKind::Send => self.assess_send(stage).await?,
            NodeKind::End => RecoveryAction::Fail(format!(
                "end node {} has no work to recover",
                stage.node_id
            )),
        };

        metrics::counter!("flow.recovery", "action" => action.as_str()).increment(1);
        if action != RecoveryAction::StillRunning {
            self.event_sink.emit(make_event(
                EventType::StageRecovered,
                Some(stage.execution_id),
                Some(stage.id),
                Some(action.as_str().to_string()),
            ));
        }
        info!(
            execution_id = %stage.execution_id,
            stage_run_id = %stage.id,
            node_id = %stage.node_id,
            action = action.as_str(),
            "Stale stage run assessed"
        );
        Ok(action)
    }

    async fn reset_condition(&self, stage: &StageRun) -> CampaignResult<RecoveryAction> {
        let reset = self
            .store
            .update_stage_run(
                stage.id,
                Box::new(|run| {
                    check_stage(run.state, StageRunState::Pending)?;
                    run.state = StageRunState::Pending;
                    run.started_at = None;
                    run.recovered = true;
                    Ok(())
                }),
            )
            .await;
        match reset {
            Ok(_) => Ok(RecoveryAction::Reset),
            // Settled in the meantime.
            Err(e) if e.is_fatal_to_execution() => Ok(RecoveryAction::StillRunning),
            Err(e) => Err(e),
        }
    }

    async fn assess_send(&self, stage: &StageRun) -> CampaignResult<RecoveryAction> {
        let Some(progress) = stage.progress.as_ref() else {
            return Ok(RecoveryAction::Fail(format!(
                "stage run {} was started without dispatch progress",
                stage.id
            )));
        };
        let queued = self.queue.queued_for_stage(stage.id).await?;

        let undispatched = progress.undispatched_chunks();
        if !undispatched.is_empty() {
            if queued > 0 {
                return Ok(RecoveryAction::StillRunning);
            }
            let chunks = self.dispatcher.enqueue_chunks(stage.id, undispatched).await?;
            self.touch(stage).await?;
            warn!(stage_run_id = %stage.id, chunks, "Re-enqueued lost chunks");
            return Ok(RecoveryAction::Resumed { chunks, sends: 0 });
        }

        let counts = self.store.send_counts(stage.id).await?;
        if counts.pending > 0 {
            if queued > 0 {
                return Ok(RecoveryAction::StillRunning);
            }
            let sends = self.requeue_orphans(stage).await?;
            self.touch(stage).await?;
            return Ok(RecoveryAction::Resumed { chunks: 0, sends });
        }
        if queued > self.config.negligible_queued_tasks {
            return Ok(RecoveryAction::StillRunning);
        }

        Ok(match self.policy.judge(progress, &counts) {
            CompletionVerdict::Complete => RecoveryAction::ForceComplete,
            CompletionVerdict::StillRunning => RecoveryAction::StillRunning,
            CompletionVerdict::Failed if counts.total() == 0 => {
                RecoveryAction::Fail("no send evidence for stale stage".into())
            }
            CompletionVerdict::Failed => RecoveryAction::Fail(format!(
                "{} of {} recipients reached a terminal send state",
                counts.terminal(),
                progress.expected
            )),
        })
    }

    /// Pending records with no queued task lost their send; queue it again.
    async fn requeue_orphans(&self, stage: &StageRun) -> CampaignResult<usize> {
        let orphans = self
            .store
            .pending_send_records(stage.id, self.config.orphan_requeue_limit)
            .await?;
        for record in &orphans {
            self.queue
                .enqueue(
                    Task::Send {
                        stage_run_id: stage.id,
                        recipient_id: record.recipient_id.clone(),
                        attempt: record.attempts,
                    },
                    None,
                )
                .await?;
        }
        warn!(stage_run_id = %stage.id, sends = orphans.len(), "Re-enqueued orphaned sends");
        Ok(orphans.len())
    }

    /// Restarts the staleness clock after resuming work.
    async fn touch(&self, stage: &StageRun) -> CampaignResult<()> {
        let now = self.clock.now();
        self.store
            .update_stage_run(
                stage.id,
                Box::new(move |run| {
                    run.recovered = true;
                    if let Some(progress) = run.progress.as_mut() {
                        progress.last_progress_at = now;
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::tests::send;
    use crate::ports::{MemoryRecipientStore, StaticContentResolver};
    use crate::queue::MemoryWorkQueue;
    use crate::store::MemoryFlowStore;
    use crate::types::{SendRecord, StageAudience, StageProgress};
    use campaign_core::channels::Channel;
    use campaign_core::config::DispatchConfig;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryFlowStore>,
        queue: Arc<MemoryWorkQueue>,
        clock: Arc<ManualClock>,
        sweeper: RecoverySweeper,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryFlowStore::new());
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(MemoryWorkQueue::new(clock.clone()));
        let dispatcher = Arc::new(BatchDispatcher::new(
            store.clone(),
            queue.clone(),
            Arc::new(MemoryRecipientStore::new()),
            Arc::new(StaticContentResolver::new()),
            clock.clone(),
            DispatchConfig::default(),
        ));
        let sweeper = RecoverySweeper::new(
            store.clone(),
            queue.clone(),
            dispatcher,
            StageCompletionPolicy::default(),
            clock.clone(),
            RecoveryConfig::default(),
        );
        Fixture {
            store,
            queue,
            clock,
            sweeper,
        }
    }

    async fn started_stage(f: &Fixture, progress: StageProgress) -> StageRun {
        let mut run = StageRun::pending(
            Uuid::new_v4(),
            &send("a", 0),
            StageAudience::Execution,
            f.clock.now(),
        );
        run.state = if progress.mode == crate::types::DispatchMode::Chunked {
            StageRunState::Batching
        } else {
            StageRunState::Executing
        };
        run.started_at = Some(f.clock.now());
        run.channel = Some(Channel::Email);
        run.progress = Some(progress);
        f.store.insert_stage_run(run.clone()).await.unwrap();
        run
    }

    async fn seed_records(f: &Fixture, stage: &StageRun, n: usize, sent: usize) {
        for i in 0..n {
            let id = format!("r{i}");
            f.store
                .claim_send_record(SendRecord::pending(
                    stage.id,
                    stage.execution_id,
                    id.clone(),
                    Channel::Email,
                    format!("{id}@example.com"),
                    f.clock.now(),
                ))
                .await
                .unwrap();
            if i < sent {
                let now = f.clock.now();
                f.store
                    .update_send_record(
                        stage.id,
                        &id,
                        Box::new(move |r| {
                            r.mark_sent(format!("m-{i}"), now);
                            Ok(())
                        }),
                    )
                    .await
                    .unwrap();
            }
        }
    }

    fn dispatched(mut progress: StageProgress) -> StageProgress {
        for index in progress.undispatched_chunks() {
            progress.chunks.insert(
                index,
                crate::types::ChunkProgress {
                    batch_id: Uuid::new_v4(),
                    enqueued: 0,
                    skipped_no_destination: 0,
                    already_claimed: 0,
                    dispatched_at: progress.last_progress_at,
                },
            );
        }
        progress
    }

    #[tokio::test]
    async fn test_staleness_depends_on_dispatch_mode() {
        let f = fixture();
        let direct = started_stage(&f, StageProgress::direct(10, f.clock.now())).await;
        let chunked = started_stage(&f, StageProgress::chunked(8_000, 1_000, f.clock.now())).await;

        f.clock.advance(Duration::minutes(11));
        let now = f.clock.now();
        assert!(f.sweeper.is_stale(&chunked, now));
        assert!(!f.sweeper.is_stale(&direct, now));

        f.clock.advance(Duration::minutes(20));
        assert!(f.sweeper.is_stale(&direct, f.clock.now()));
    }

    #[tokio::test]
    async fn test_settled_records_force_complete() {
        let f = fixture();
        let stage = started_stage(&f, dispatched(StageProgress::direct(10, f.clock.now()))).await;
        seed_records(&f, &stage, 10, 10).await;
        assert_eq!(
            f.sweeper.recover(&stage).await.unwrap(),
            RecoveryAction::ForceComplete
        );
    }

    #[tokio::test]
    async fn test_no_evidence_fails() {
        let f = fixture();
        let stage = started_stage(&f, dispatched(StageProgress::direct(10, f.clock.now()))).await;
        assert!(matches!(
            f.sweeper.recover(&stage).await.unwrap(),
            RecoveryAction::Fail(_)
        ));
    }

    #[tokio::test]
    async fn test_orphaned_sends_are_requeued() {
        let f = fixture();
        let stage = started_stage(&f, dispatched(StageProgress::direct(10, f.clock.now()))).await;
        seed_records(&f, &stage, 10, 6).await;

        let action = f.sweeper.recover(&stage).await.unwrap();
        assert_eq!(action, RecoveryAction::Resumed { chunks: 0, sends: 4 });
        assert_eq!(f.queue.queued_for_stage(stage.id).await.unwrap(), 4);

        // With the sends queued again the stage is simply in flight.
        assert_eq!(
            f.sweeper.recover(&stage).await.unwrap(),
            RecoveryAction::StillRunning
        );
    }

    #[tokio::test]
    async fn test_lost_chunks_are_requeued() {
        let f = fixture();
        let mut progress = StageProgress::chunked(3_000, 1_000, f.clock.now());
        progress.chunks.insert(
            0,
            crate::types::ChunkProgress {
                batch_id: Uuid::new_v4(),
                enqueued: 1_000,
                skipped_no_destination: 0,
                already_claimed: 0,
                dispatched_at: f.clock.now(),
            },
        );
        let stage = started_stage(&f, progress).await;

        let action = f.sweeper.recover(&stage).await.unwrap();
        assert_eq!(action, RecoveryAction::Resumed { chunks: 2, sends: 0 });
        let queued: Vec<Task> = f.queue.snapshot().into_iter().map(|q| q.task).collect();
        assert!(queued.contains(&Task::DispatchChunk {
            stage_run_id: stage.id,
            chunk_index: 2,
            attempt: 0
        }));
        let stored = f.store.get_stage_run(stage.id).await.unwrap().unwrap();
        assert!(stored.recovered);
    }

    #[tokio::test]
    async fn test_cancelled_stage_is_failed_not_resumed() {
        let f = fixture();
        let mut stage = started_stage(&f, StageProgress::chunked(3_000, 1_000, f.clock.now())).await;
        stage.cancelled = true;

        assert_eq!(
            f.sweeper.recover(&stage).await.unwrap(),
            RecoveryAction::Fail("execution cancelled".into())
        );
        assert!(f.queue.snapshot().is_empty());
    }
}
