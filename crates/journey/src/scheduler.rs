//! Execution scheduler — advances executions through their flow graph.
//!
//! Each tick loads the executions whose next-due time has passed and routes
//! the due stage run to the batch dispatcher or the condition evaluator. One
//! execution failing never aborts the tick. Re-entry is idempotent: a stage
//! that already started is never run twice, and children are created at most
//! once per (parent, node, branch).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use campaign_core::config::SchedulerConfig;
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::EventType;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::completion::{CompletionVerdict, StageCompletionPolicy};
use crate::dispatcher::{BatchDispatcher, DispatchOutcome};
use crate::evaluator::ConditionEvaluator;
use crate::graph::FlowGraph;
use crate::recovery::{RecoveryAction, RecoverySweeper};
use crate::state_machine::{check_execution, check_stage};
use crate::store::FlowStore;
use crate::types::{
    Branch, ConditionNode, Execution, ExecutionState, FlowNode, NodeKind, StageAudience, StageRun,
    StageRunState,
};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub advanced: usize,
    pub skipped: usize,
    pub recovered: usize,
    pub failed: usize,
    /// Transient errors; those executions are retried on the next tick.
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Advanced,
    Skipped,
    Recovered,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub stale: usize,
    pub resumed: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct ExecutionScheduler {
    store: Arc<dyn FlowStore>,
    dispatcher: Arc<BatchDispatcher>,
    evaluator: ConditionEvaluator,
    sweeper: RecoverySweeper,
    policy: StageCompletionPolicy,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    graphs: DashMap<Uuid, Arc<FlowGraph>>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ExecutionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("config", &self.config)
            .field("cached_graphs", &self.graphs.len())
            .finish()
    }
}

impl ExecutionScheduler {
    pub fn new(
        store: Arc<dyn FlowStore>,
        dispatcher: Arc<BatchDispatcher>,
        sweeper: RecoverySweeper,
        policy: StageCompletionPolicy,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(store.clone()),
            store,
            dispatcher,
            sweeper,
            policy,
            clock,
            config,
            graphs: DashMap::new(),
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn policy(&self) -> StageCompletionPolicy {
        self.policy
    }

    /// Validated graph for a flow, cached after the first load.
    pub async fn graph(&self, flow_id: Uuid) -> CampaignResult<Arc<FlowGraph>> {
        if let Some(graph) = self.graphs.get(&flow_id) {
            return Ok(graph.clone());
        }
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| CampaignError::graph(format!("flow {flow_id} is not registered")))?;
        let graph = Arc::new(FlowGraph::build(&flow)?);
        self.graphs.insert(flow_id, graph.clone());
        Ok(graph)
    }

    /// Processes every execution whose next stage is due.
    pub async fn tick(&self) -> CampaignResult<TickReport> {
        let now = self.clock.now();
        let due = self
            .store
            .due_executions(now, self.config.due_batch_size)
            .await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for execution in due {
            match self.process_execution(execution.id).await {
                Ok(Step::Advanced) => report.advanced += 1,
                Ok(Step::Skipped) => report.skipped += 1,
                Ok(Step::Recovered) => report.recovered += 1,
                Ok(Step::Failed) => report.failed += 1,
                Err(e) if e.is_fatal_to_execution() => {
                    error!(execution_id = %execution.id, error = %e, "Execution hit an unrecoverable error");
                    if let Err(fail_err) = self.fail_execution(execution.id, e.to_string()).await {
                        warn!(execution_id = %execution.id, error = %fail_err, "Could not record execution failure");
                        report.errors += 1;
                        continue;
                    }
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "Execution step errored; retrying next tick");
                    metrics::counter!("flow.tick_errors").increment(1);
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("flow.ticks").increment(1);
        metrics::histogram!("flow.tick_due_executions").record(report.due as f64);
        if report.due > 0 {
            info!(
                due = report.due,
                advanced = report.advanced,
                skipped = report.skipped,
                recovered = report.recovered,
                failed = report.failed,
                errors = report.errors,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    async fn process_execution(&self, execution_id: Uuid) -> CampaignResult<Step> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(Step::Skipped);
        };
        if execution.state != ExecutionState::InProgress {
            return Ok(Step::Skipped);
        }
        let now = self.clock.now();
        let graph = self.graph(execution.flow_id).await?;
        let runs = self.store.stage_runs_for_execution(execution_id).await?;

        // One stage run in flight per execution.
        if let Some(other) = runs
            .iter()
            .find(|r| r.state.is_active() && Some(r.id) != execution.next_due_stage)
        {
            if self.sweeper.is_stale(other, now) {
                self.recover_stage(other).await?;
                return Ok(Step::Recovered);
            }
            debug!(
                execution_id = %execution_id,
                active_stage = %other.id,
                "Another stage run is active; skipping"
            );
            self.reschedule(execution_id).await?;
            return Ok(Step::Skipped);
        }

        let Some(due_id) = execution.next_due_stage else {
            self.reschedule(execution_id).await?;
            return Ok(Step::Advanced);
        };
        let stage = runs
            .into_iter()
            .find(|r| r.id == due_id)
            .ok_or_else(|| CampaignError::graph(format!("due stage run {due_id} is missing")))?;

        match stage.state {
            StageRunState::Completed => {
                self.advance(&stage).await?;
                self.reschedule(execution_id).await?;
                Ok(Step::Advanced)
            }
            StageRunState::Executing | StageRunState::Batching => {
                if self.sweeper.is_stale(&stage, now) {
                    self.recover_stage(&stage).await?;
                    return Ok(Step::Recovered);
                }
                if stage.node_kind == NodeKind::Send {
                    self.check_stage_completion(stage.id).await?;
                }
                self.reschedule(execution_id).await?;
                Ok(Step::Skipped)
            }
            StageRunState::Failed => {
                let reason = stage
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("stage run {} failed", stage.id));
                self.fail_execution(execution_id, reason).await?;
                Ok(Step::Failed)
            }
            StageRunState::Pending => {
                match graph.node(&stage.node_id)? {
                    FlowNode::Send(node) => {
                        self.mark_current(execution_id, &node.id).await?;
                        let outcome = self.dispatcher.dispatch(&execution, &stage, node).await?;
                        if matches!(outcome, DispatchOutcome::Direct { .. }) {
                            self.check_stage_completion(stage.id).await?;
                        }
                    }
                    FlowNode::Condition(node) => {
                        self.mark_current(execution_id, &node.id).await?;
                        self.evaluate_condition(&execution, &stage, node).await?;
                    }
                    FlowNode::End(node) => {
                        return Err(CampaignError::graph(format!(
                            "end node '{}' cannot run as a stage",
                            node.id
                        )))
                    }
                }
                self.reschedule(execution_id).await?;
                Ok(Step::Advanced)
            }
        }
    }

    async fn mark_current(&self, execution_id: Uuid, node_id: &str) -> CampaignResult<()> {
        let now = self.clock.now();
        let node_id = node_id.to_string();
        self.store
            .update_execution(
                execution_id,
                Box::new(move |e| {
                    e.current_node = Some(node_id);
                    e.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn evaluate_condition(
        &self,
        execution: &Execution,
        stage: &StageRun,
        node: &ConditionNode,
    ) -> CampaignResult<()> {
        let now = self.clock.now();
        let started = self
            .store
            .update_stage_run(
                stage.id,
                Box::new(move |run| {
                    check_stage(run.state, StageRunState::Executing)?;
                    run.state = StageRunState::Executing;
                    run.started_at = Some(now);
                    Ok(())
                }),
            )
            .await;
        let stage = match started {
            Ok(stage) => stage,
            Err(CampaignError::InvalidTransition(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let recipients = self.dispatcher.all_recipients(execution, &stage).await?;
        let classification = self
            .evaluator
            .classify(node, stage.source_send_stage, &recipients)
            .await?;
        let result = self
            .store
            .put_condition_result_if_absent(classification.into_result(&stage, node, now))
            .await?;

        metrics::counter!("flow.conditions_evaluated").increment(1);
        self.event_sink.emit(make_event(
            EventType::ConditionEvaluated,
            Some(stage.execution_id),
            Some(stage.id),
            Some(format!(
                "{}: yes={} no={}",
                node.id, result.yes_count, result.no_count
            )),
        ));
        info!(
            execution_id = %stage.execution_id,
            stage_run_id = %stage.id,
            node_id = %node.id,
            yes = result.yes_count,
            no = result.no_count,
            "Condition evaluated"
        );

        self.settle(&stage, CompletionVerdict::Complete, None, false)
            .await?;
        Ok(())
    }

    /// Settles an active send stage once all its chunks are dispatched and
    /// the completion policy gives a verdict. Safe to call from any worker;
    /// only one caller wins the transition.
    pub async fn check_stage_completion(
        &self,
        stage_run_id: Uuid,
    ) -> CampaignResult<Option<CompletionVerdict>> {
        let Some(stage) = self.store.get_stage_run(stage_run_id).await? else {
            return Ok(None);
        };
        if !stage.state.is_active() || stage.node_kind != NodeKind::Send {
            return Ok(None);
        }
        // Chunks of a cancelled stage are never dispatched; settle it now.
        if stage.cancelled {
            self.fail_stage(&stage, CANCELLED_REASON.to_string()).await?;
            return Ok(Some(CompletionVerdict::Failed));
        }
        let Some(progress) = stage.progress.as_ref() else {
            return Ok(None);
        };
        if !progress.all_chunks_dispatched() {
            return Ok(Some(CompletionVerdict::StillRunning));
        }
        let counts = self.store.send_counts(stage_run_id).await?;
        let verdict = self.policy.judge(progress, &counts);
        if verdict != CompletionVerdict::StillRunning {
            let reason = (verdict == CompletionVerdict::Failed).then(|| {
                format!(
                    "{} of {} recipients reached a terminal send state; {} required",
                    counts.terminal(),
                    progress.expected,
                    self.policy.required(progress.expected)
                )
            });
            self.settle(&stage, verdict, reason, false).await?;
        }
        Ok(Some(verdict))
    }

    /// Fails an active stage run and, unless the execution already ended,
    /// the execution with it. Returns false if the stage was already settled.
    pub async fn fail_stage(&self, stage: &StageRun, reason: String) -> CampaignResult<bool> {
        self.settle(stage, CompletionVerdict::Failed, Some(reason), false)
            .await
    }

    /// Moves an active stage to `completed` or `failed` and follows through
    /// on the execution. Returns false if another caller settled it first.
    async fn settle(
        &self,
        stage: &StageRun,
        verdict: CompletionVerdict,
        reason: Option<String>,
        recovered: bool,
    ) -> CampaignResult<bool> {
        let target = match verdict {
            CompletionVerdict::Complete => StageRunState::Completed,
            CompletionVerdict::Failed => StageRunState::Failed,
            CompletionVerdict::StillRunning => return Ok(false),
        };
        let now = self.clock.now();
        let error = reason.clone();
        let settled = self
            .store
            .update_stage_run(
                stage.id,
                Box::new(move |run| {
                    check_stage(run.state, target)?;
                    run.state = target;
                    run.completed_at = Some(now);
                    run.recovered |= recovered;
                    run.error = error;
                    Ok(())
                }),
            )
            .await;
        let stage = match settled {
            Ok(stage) => stage,
            Err(CampaignError::InvalidTransition(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        if target == StageRunState::Completed {
            metrics::counter!("flow.stages_completed", "recovered" => recovered.to_string())
                .increment(1);
            self.event_sink.emit(make_event(
                EventType::StageCompleted,
                Some(stage.execution_id),
                Some(stage.id),
                Some(stage.node_id.clone()),
            ));
            info!(
                execution_id = %stage.execution_id,
                stage_run_id = %stage.id,
                node_id = %stage.node_id,
                recovered,
                "Stage run completed"
            );
            self.advance(&stage).await?;
            self.reschedule(stage.execution_id).await?;
        } else {
            let reason = reason.unwrap_or_else(|| format!("stage run {} failed", stage.id));
            metrics::counter!("flow.stages_failed").increment(1);
            self.event_sink.emit(make_event(
                EventType::StageFailed,
                Some(stage.execution_id),
                Some(stage.id),
                Some(reason.clone()),
            ));
            warn!(
                execution_id = %stage.execution_id,
                stage_run_id = %stage.id,
                node_id = %stage.node_id,
                %reason,
                "Stage run failed"
            );
            self.fail_execution(
                stage.execution_id,
                format!("stage '{}' failed: {reason}", stage.node_id),
            )
            .await?;
        }
        Ok(true)
    }

    /// Schedules the stage runs reachable from a completed stage. Idempotent.
    pub async fn advance(&self, stage: &StageRun) -> CampaignResult<()> {
        let execution = self
            .store
            .get_execution(stage.execution_id)
            .await?
            .ok_or_else(|| CampaignError::not_found(format!("execution {}", stage.execution_id)))?;
        if execution.state != ExecutionState::InProgress {
            return Ok(());
        }
        let graph = self.graph(execution.flow_id).await?;
        let base = stage.completed_at.unwrap_or_else(|| self.clock.now());

        match stage.node_kind {
            NodeKind::Send => {
                let wait = graph.send_node(&stage.node_id)?.wait_secs;
                let Some(next) = graph.next_after_send(&stage.node_id)? else {
                    return Ok(());
                };
                let due_at = base + secs(wait) + window_of(next);
                if !matches!(next, FlowNode::End(_)) {
                    self.schedule_child(stage, next, None, stage.audience.clone(), due_at)
                        .await?;
                }
            }
            NodeKind::Condition => {
                let result = self
                    .store
                    .get_condition_result(stage.id)
                    .await?
                    .ok_or_else(|| {
                        CampaignError::Store(format!(
                            "completed condition stage {} has no result",
                            stage.id
                        ))
                    })?;
                for (branch, ids) in [(Branch::Yes, result.yes), (Branch::No, result.no)] {
                    if ids.is_empty() {
                        continue;
                    }
                    match graph.branch_target(&stage.node_id, branch)? {
                        None | Some(FlowNode::End(_)) => {}
                        Some(target) => {
                            let due_at = base + window_of(target);
                            self.schedule_child(
                                stage,
                                target,
                                Some(branch),
                                StageAudience::Subset { ids },
                                due_at,
                            )
                            .await?;
                        }
                    }
                }
            }
            NodeKind::End => {}
        }
        Ok(())
    }

    async fn schedule_child(
        &self,
        parent: &StageRun,
        node: &FlowNode,
        branch: Option<Branch>,
        audience: StageAudience,
        due_at: DateTime<Utc>,
    ) -> CampaignResult<StageRun> {
        let mut run = StageRun::pending(parent.execution_id, node, audience, due_at);
        run.parent_id = Some(parent.id);
        run.branch = branch;
        run.source_send_stage = match parent.node_kind {
            NodeKind::Send => Some(parent.id),
            _ => parent.source_send_stage,
        };
        let (run, created) = self.store.insert_child_stage_run(run).await?;
        if created {
            self.event_sink.emit(make_event(
                EventType::StageScheduled,
                Some(run.execution_id),
                Some(run.id),
                Some(format!("{} at {}", run.node_id, run.scheduled_at)),
            ));
            debug!(
                execution_id = %run.execution_id,
                stage_run_id = %run.id,
                node_id = %run.node_id,
                ?branch,
                due_at = %run.scheduled_at,
                "Stage run scheduled"
            );
        }
        Ok(run)
    }

    /// Recomputes the execution's next due stage from its stage runs.
    ///
    /// An active stage keeps the execution pointed at itself with a watchdog
    /// due time at its staleness deadline. Otherwise the earliest pending
    /// stage is next. With neither, the execution is complete.
    pub async fn reschedule(&self, execution_id: Uuid) -> CampaignResult<()> {
        let now = self.clock.now();
        let runs = self.store.stage_runs_for_execution(execution_id).await?;
        let tick = secs(self.config.tick_interval_secs);

        let next = if let Some(active) = runs.iter().find(|r| r.state.is_active()) {
            let deadline = RecoverySweeper::last_activity(active) + self.sweeper.stale_after(active);
            Some((active.id, active.node_id.clone(), deadline.max(now + tick)))
        } else {
            runs.iter()
                .filter(|r| r.state == StageRunState::Pending)
                .min_by_key(|r| (r.scheduled_at, r.branch != Some(Branch::Yes)))
                .map(|r| (r.id, r.node_id.clone(), r.scheduled_at))
        };

        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        self.store
            .update_execution(
                execution_id,
                Box::new(move |e| {
                    if e.state.is_terminal() {
                        return Ok(());
                    }
                    match next {
                        Some((stage, node, at)) => {
                            e.next_due_stage = Some(stage);
                            e.next_due_node = Some(node);
                            e.next_due_at = Some(at);
                        }
                        None => {
                            check_execution(e.state, ExecutionState::Completed)?;
                            e.state = ExecutionState::Completed;
                            e.clear_next_due();
                            e.finished_at = Some(now);
                            flag.store(true, Ordering::Release);
                        }
                    }
                    e.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        if completed.load(Ordering::Acquire) {
            metrics::counter!("flow.executions_completed").increment(1);
            self.event_sink.emit(make_event(
                EventType::ExecutionCompleted,
                Some(execution_id),
                None,
                None,
            ));
            info!(execution_id = %execution_id, "Execution completed");
        }
        Ok(())
    }

    /// Marks an execution failed with a human-readable reason. No-op once
    /// terminal.
    pub async fn fail_execution(&self, execution_id: Uuid, reason: String) -> CampaignResult<()> {
        let now = self.clock.now();
        let detail = reason.clone();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let updated = self
            .store
            .update_execution(
                execution_id,
                Box::new(move |e| {
                    if e.state.is_terminal() {
                        return Ok(());
                    }
                    check_execution(e.state, ExecutionState::Failed)?;
                    e.state = ExecutionState::Failed;
                    e.error = Some(reason);
                    e.clear_next_due();
                    e.finished_at = Some(now);
                    e.updated_at = now;
                    flag.store(true, Ordering::Release);
                    Ok(())
                }),
            )
            .await;
        match updated {
            Ok(_) if failed.load(Ordering::Acquire) => {
                metrics::counter!("flow.executions_failed").increment(1);
                self.event_sink.emit(make_event(
                    EventType::ExecutionFailed,
                    Some(execution_id),
                    None,
                    Some(detail.clone()),
                ));
                warn!(execution_id = %execution_id, reason = %detail, "Execution failed");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(CampaignError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Assesses one stale stage and applies the verdict.
    pub async fn recover_stage(&self, stage: &StageRun) -> CampaignResult<RecoveryAction> {
        let action = self.sweeper.recover(stage).await?;
        match &action {
            RecoveryAction::ForceComplete => {
                self.settle(stage, CompletionVerdict::Complete, None, true)
                    .await?;
            }
            RecoveryAction::Fail(reason) => {
                self.settle(stage, CompletionVerdict::Failed, Some(reason.clone()), true)
                    .await?;
            }
            RecoveryAction::Resumed { .. } | RecoveryAction::Reset => {
                self.reschedule(stage.execution_id).await?;
            }
            RecoveryAction::StillRunning => {}
        }
        Ok(action)
    }

    /// Scans every active stage run and recovers the stale ones.
    pub async fn sweep_stale(&self) -> CampaignResult<SweepReport> {
        let now = self.clock.now();
        let active = self.store.active_stage_runs().await?;
        let mut report = SweepReport {
            examined: active.len(),
            ..SweepReport::default()
        };
        for stage in active.iter().filter(|s| self.sweeper.is_stale(s, now)) {
            report.stale += 1;
            match self.recover_stage(stage).await {
                Ok(RecoveryAction::ForceComplete) => report.completed += 1,
                Ok(RecoveryAction::Fail(_)) => report.failed += 1,
                Ok(RecoveryAction::Resumed { .. } | RecoveryAction::Reset) => report.resumed += 1,
                Ok(RecoveryAction::StillRunning) => {}
                Err(e) => {
                    warn!(stage_run_id = %stage.id, error = %e, "Recovery failed; retrying next sweep");
                }
            }
        }
        if report.stale > 0 {
            info!(
                examined = report.examined,
                stale = report.stale,
                resumed = report.resumed,
                completed = report.completed,
                failed = report.failed,
                "Recovery sweep"
            );
        }
        Ok(report)
    }
}

/// Failure reason recorded on stage runs stopped by cancellation.
pub const CANCELLED_REASON: &str = "execution cancelled";

/// Longest wait a flow may configure; keeps timestamp arithmetic in range.
const MAX_WAIT_SECS: u64 = 100 * 365 * 86_400;

pub(crate) fn secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_WAIT_SECS) as i64)
}

/// Conditions wait out their observation window before evaluating.
fn window_of(node: &FlowNode) -> Duration {
    match node {
        FlowNode::Condition(c) => secs(c.window_secs),
        _ => Duration::zero(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_targets_wait_for_window() {
        let condition = crate::graph::tests::opened_condition("c", 3_600);
        let send = crate::graph::tests::send("b", 0);
        assert_eq!(window_of(&condition), Duration::hours(1));
        assert_eq!(window_of(&send), Duration::zero());
    }

    #[test]
    fn test_seconds_saturate() {
        assert_eq!(secs(90), Duration::seconds(90));
        assert!(secs(u64::MAX) > Duration::days(365));
    }
}
