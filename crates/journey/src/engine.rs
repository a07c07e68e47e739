//! Flow engine facade. Wires the store, queue, scheduler, and workers into
//! one handle that registers flows, launches and cancels executions, and
//! ingests provider engagement.
//!
//! Cancellation is cooperative: the execution moves to `cancelled` first,
//! then every unfinished stage run is flagged and failed so queued sends
//! settle as failed when a worker picks them up.

use std::collections::HashSet;
use std::sync::Arc;

use campaign_channels::{ChannelGate, ChannelGateState, SendGateway};
use campaign_core::channels::{Channel, Engagement, RecipientId};
use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EventType;
use campaign_core::{AppConfig, CampaignError, CampaignResult};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::completion::StageCompletionPolicy;
use crate::dispatcher::BatchDispatcher;
use crate::graph::FlowGraph;
use crate::ports::{ContentResolver, RecipientStore};
use crate::queue::WorkQueue;
use crate::recovery::RecoverySweeper;
use crate::scheduler::{ExecutionScheduler, SweepReport, TickReport, CANCELLED_REASON};
use crate::state_machine::{check_execution, check_stage};
use crate::store::FlowStore;
use crate::types::{
    Audience, ConditionResult, Execution, ExecutionState, Flow, FlowNode, SendCounts, SendRecord,
    StageAudience, StageRun, StageRunState,
};
use crate::worker::TaskWorker;

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn FlowStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub recipients: Arc<dyn RecipientStore>,
    pub content: Arc<dyn ContentResolver>,
    pub gateway: Arc<SendGateway>,
    pub gate: Arc<ChannelGate>,
    pub clock: Arc<dyn Clock>,
    pub event_sink: Arc<dyn EventSink>,
}

/// Entry point for registering flows, launching and cancelling executions,
/// ingesting engagement, and driving the scheduler and workers.
#[derive(Clone)]
pub struct FlowEngine {
    store: Arc<dyn FlowStore>,
    recipients: Arc<dyn RecipientStore>,
    gate: Arc<ChannelGate>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<ExecutionScheduler>,
    worker: Arc<TaskWorker>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("scheduler", &self.scheduler)
            .field("worker", &self.worker)
            .finish()
    }
}

impl FlowEngine {
    pub fn new(parts: EngineParts, config: &AppConfig) -> Self {
        let policy = StageCompletionPolicy::new(config.dispatch.completion_ratio);
        let dispatcher = Arc::new(
            BatchDispatcher::new(
                parts.store.clone(),
                parts.queue.clone(),
                parts.recipients.clone(),
                parts.content.clone(),
                parts.clock.clone(),
                config.dispatch.clone(),
            )
            .with_event_sink(parts.event_sink.clone()),
        );
        let sweeper = RecoverySweeper::new(
            parts.store.clone(),
            parts.queue.clone(),
            dispatcher.clone(),
            policy,
            parts.clock.clone(),
            config.recovery.clone(),
        )
        .with_event_sink(parts.event_sink.clone());
        let scheduler = Arc::new(
            ExecutionScheduler::new(
                parts.store.clone(),
                dispatcher.clone(),
                sweeper,
                policy,
                parts.clock.clone(),
                config.scheduler.clone(),
            )
            .with_event_sink(parts.event_sink.clone()),
        );
        let worker = Arc::new(
            TaskWorker::new(
                parts.store.clone(),
                parts.queue.clone(),
                scheduler.clone(),
                dispatcher,
                parts.gateway,
                parts.gate.clone(),
                parts.clock.clone(),
                config.worker.clone(),
            )
            .with_event_sink(parts.event_sink.clone()),
        );

        Self {
            store: parts.store,
            recipients: parts.recipients,
            gate: parts.gate,
            clock: parts.clock,
            scheduler,
            worker,
            event_sink: parts.event_sink,
        }
    }

    pub fn scheduler(&self) -> Arc<ExecutionScheduler> {
        self.scheduler.clone()
    }

    pub fn worker(&self) -> Arc<TaskWorker> {
        self.worker.clone()
    }

    /// Validates and stores a flow. Flows are immutable once registered.
    pub async fn register_flow(&self, flow: Flow) -> CampaignResult<Uuid> {
        let graph = FlowGraph::build(&flow)?;
        let id = flow.id;
        info!(flow_id = %id, name = %flow.name, nodes = graph.len(), "Registering flow");
        self.store.insert_flow(flow).await?;
        metrics::counter!("flow.flows_registered").increment(1);
        Ok(id)
    }

    pub async fn get_flow(&self, id: Uuid) -> CampaignResult<Option<Flow>> {
        self.store.get_flow(id).await
    }

    /// Starts a flow for an explicit recipient list. Duplicate ids are
    /// dropped, keeping first occurrence order.
    pub async fn launch_flow(
        &self,
        flow_id: Uuid,
        recipients: Vec<RecipientId>,
    ) -> CampaignResult<Execution> {
        let mut seen = HashSet::with_capacity(recipients.len());
        let ids: Vec<RecipientId> = recipients
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        self.launch(flow_id, Audience::Explicit { ids }).await
    }

    /// Starts a flow for everyone the recipient store lists for it. Ids are
    /// paged on demand and never held in full.
    pub async fn launch_flow_audience(&self, flow_id: Uuid) -> CampaignResult<Execution> {
        let total = self.recipients.count(flow_id).await?;
        self.launch(flow_id, Audience::Store { flow_id, total })
            .await
    }

    async fn launch(&self, flow_id: Uuid, audience: Audience) -> CampaignResult<Execution> {
        if self.store.get_flow(flow_id).await?.is_none() {
            return Err(CampaignError::not_found(format!("flow {flow_id}")));
        }
        let graph = self.scheduler.graph(flow_id).await?;
        let now = self.clock.now();
        let recipients = audience.len();
        let execution = Execution::new(flow_id, audience, now);
        let execution_id = execution.id;
        self.store.insert_execution(execution).await?;

        let entry = graph.entry()?;
        if !matches!(entry, FlowNode::End(_)) {
            let run = StageRun::pending(execution_id, entry, StageAudience::Execution, now);
            self.store.insert_stage_run(run).await?;
        }
        self.store
            .update_execution(
                execution_id,
                Box::new(move |e| {
                    check_execution(e.state, ExecutionState::InProgress)?;
                    e.state = ExecutionState::InProgress;
                    e.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        self.scheduler.reschedule(execution_id).await?;

        metrics::counter!("flow.executions_launched").increment(1);
        self.event_sink.emit(make_event(
            EventType::ExecutionLaunched,
            Some(execution_id),
            None,
            Some(format!("{recipients} recipients")),
        ));
        info!(
            execution_id = %execution_id,
            flow_id = %flow_id,
            recipients,
            entry_node = %entry.id(),
            "Execution launched"
        );
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CampaignError::not_found(format!("execution {execution_id}")))
    }

    /// Cancels a running execution. Every unfinished stage run is flagged and
    /// failed, so queued sends settle as failed instead of going out.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> CampaignResult<Execution> {
        let now = self.clock.now();
        let execution = self
            .store
            .update_execution(
                execution_id,
                Box::new(move |e| {
                    check_execution(e.state, ExecutionState::Cancelled)?;
                    e.state = ExecutionState::Cancelled;
                    e.clear_next_due();
                    e.finished_at = Some(now);
                    e.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        let mut flagged = 0usize;
        for run in self.store.stage_runs_for_execution(execution_id).await? {
            if run.state.is_terminal() {
                continue;
            }
            let run = self
                .store
                .update_stage_run(
                    run.id,
                    Box::new(move |r| {
                        r.cancelled = true;
                        if r.state == StageRunState::Pending {
                            check_stage(r.state, StageRunState::Failed)?;
                            r.state = StageRunState::Failed;
                            r.completed_at = Some(now);
                            r.error = Some(CANCELLED_REASON.to_string());
                        }
                        Ok(())
                    }),
                )
                .await?;
            // Queued sends find the flag and settle as failed.
            if run.state.is_active() {
                self.scheduler
                    .fail_stage(&run, CANCELLED_REASON.to_string())
                    .await?;
            }
            flagged += 1;
        }

        metrics::counter!("flow.executions_cancelled").increment(1);
        self.event_sink.emit(make_event(
            EventType::ExecutionCancelled,
            Some(execution_id),
            None,
            None,
        ));
        info!(execution_id = %execution_id, stage_runs = flagged, "Execution cancelled");
        Ok(execution)
    }

    /// Applies a provider open/click/bounce to the recipient's send record.
    /// Fails with `InvalidTransition` unless the message actually went out.
    pub async fn record_engagement(
        &self,
        stage_run_id: Uuid,
        recipient_id: &str,
        engagement: Engagement,
    ) -> CampaignResult<SendRecord> {
        let now = self.clock.now();
        let record = self
            .store
            .update_send_record(
                stage_run_id,
                recipient_id,
                Box::new(move |r| {
                    if !r.state.was_delivered() {
                        return Err(CampaignError::InvalidTransition(format!(
                            "{engagement:?} for a send record in state {:?}",
                            r.state
                        )));
                    }
                    r.apply_engagement(engagement, now);
                    Ok(())
                }),
            )
            .await?;
        let kind = match engagement {
            Engagement::Opened => "opened",
            Engagement::Clicked => "clicked",
            Engagement::Bounced => "bounced",
        };
        metrics::counter!("flow.engagements", "kind" => kind, "channel" => record.channel.key())
            .increment(1);
        Ok(record)
    }

    pub async fn tick(&self) -> CampaignResult<TickReport> {
        self.scheduler.tick().await
    }

    pub async fn sweep(&self) -> CampaignResult<SweepReport> {
        self.scheduler.sweep_stale().await
    }

    pub async fn process_due_tasks(&self, limit: usize) -> CampaignResult<usize> {
        self.worker.process_due(limit).await
    }

    /// Works the queue until nothing is eligible at the current time.
    pub async fn drain_tasks(&self) -> CampaignResult<usize> {
        self.worker.drain().await
    }

    // ─── Inspection ─────────────────────────────────────────────────────────

    pub async fn get_execution(&self, id: Uuid) -> CampaignResult<Option<Execution>> {
        self.store.get_execution(id).await
    }

    pub async fn stage_runs(&self, execution_id: Uuid) -> CampaignResult<Vec<StageRun>> {
        self.store.stage_runs_for_execution(execution_id).await
    }

    pub async fn condition_result(
        &self,
        stage_run_id: Uuid,
    ) -> CampaignResult<Option<ConditionResult>> {
        self.store.get_condition_result(stage_run_id).await
    }

    pub async fn send_counts(&self, stage_run_id: Uuid) -> CampaignResult<SendCounts> {
        self.store.send_counts(stage_run_id).await
    }

    pub async fn gate_state(&self, channel: Channel) -> CampaignResult<ChannelGateState> {
        self.gate.state(channel).await
    }
}
