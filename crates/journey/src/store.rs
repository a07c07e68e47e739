//! Persistence for flows, executions, stage runs, condition results and send
//! records.
//!
//! Updates go through [`Mutation`] closures applied under the row lock, so a
//! state check and the write that depends on it cannot interleave with
//! another worker's update of the same row.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{
    Branch, ConditionResult, DeliveryState, Execution, ExecutionState, Flow, SendCounts,
    SendRecord, StageRun,
};

/// In-place update of one stored row. Returning an error leaves the row
/// untouched.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> CampaignResult<()> + Send>;

/// Result of trying to create the send record for (stage run, recipient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No record existed; the caller owns the send.
    Created,
    /// A failed record was reset to pending; the caller owns the retry.
    Retrying,
    /// A non-failed record already exists; nothing to do.
    AlreadyActive(DeliveryState),
}

impl ClaimOutcome {
    pub fn should_send(&self) -> bool {
        matches!(self, ClaimOutcome::Created | ClaimOutcome::Retrying)
    }
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Fails if a flow with the same id is already registered.
    async fn insert_flow(&self, flow: Flow) -> CampaignResult<()>;
    async fn get_flow(&self, id: Uuid) -> CampaignResult<Option<Flow>>;

    async fn insert_execution(&self, execution: Execution) -> CampaignResult<()>;
    async fn get_execution(&self, id: Uuid) -> CampaignResult<Option<Execution>>;
    async fn update_execution(
        &self,
        id: Uuid,
        mutation: Mutation<Execution>,
    ) -> CampaignResult<Execution>;
    /// In-progress executions whose next due time is at or before `now`.
    async fn due_executions(&self, now: DateTime<Utc>, limit: usize)
        -> CampaignResult<Vec<Execution>>;

    async fn insert_stage_run(&self, run: StageRun) -> CampaignResult<()>;
    async fn get_stage_run(&self, id: Uuid) -> CampaignResult<Option<StageRun>>;
    async fn update_stage_run(&self, id: Uuid, mutation: Mutation<StageRun>)
        -> CampaignResult<StageRun>;
    async fn stage_runs_for_execution(&self, execution_id: Uuid) -> CampaignResult<Vec<StageRun>>;
    /// Inserts a stage run scheduled by `run.parent_id` unless that parent
    /// already scheduled one on the same node and branch. Returns the stored
    /// run and whether it was created by this call.
    async fn insert_child_stage_run(&self, run: StageRun) -> CampaignResult<(StageRun, bool)>;
    /// The stage run `parent` scheduled on `node_id` for `branch`, if any.
    async fn find_child_stage_run(
        &self,
        parent: Uuid,
        node_id: &str,
        branch: Option<Branch>,
    ) -> CampaignResult<Option<StageRun>>;
    /// Every stage run in `executing` or `batching`.
    async fn active_stage_runs(&self) -> CampaignResult<Vec<StageRun>>;

    /// Persists `result` unless one exists for the stage run; returns the
    /// stored result either way.
    async fn put_condition_result_if_absent(
        &self,
        result: ConditionResult,
    ) -> CampaignResult<ConditionResult>;
    async fn get_condition_result(&self, stage_run_id: Uuid)
        -> CampaignResult<Option<ConditionResult>>;

    async fn claim_send_record(&self, record: SendRecord) -> CampaignResult<ClaimOutcome>;
    async fn get_send_record(
        &self,
        stage_run_id: Uuid,
        recipient_id: &str,
    ) -> CampaignResult<Option<SendRecord>>;
    async fn update_send_record(
        &self,
        stage_run_id: Uuid,
        recipient_id: &str,
        mutation: Mutation<SendRecord>,
    ) -> CampaignResult<SendRecord>;
    async fn pending_send_records(
        &self,
        stage_run_id: Uuid,
        limit: usize,
    ) -> CampaignResult<Vec<SendRecord>>;
    async fn send_counts(&self, stage_run_id: Uuid) -> CampaignResult<SendCounts>;
}

type ChildKey = (Uuid, String, Option<Branch>);

#[derive(Default)]
struct StageRecords {
    records: HashMap<String, SendRecord>,
    counts: SendCounts,
}

/// In-memory store on DashMap. Send records are grouped per stage run with
/// running counts, so completion checks do not rescan the records.
#[derive(Clone, Default)]
pub struct MemoryFlowStore {
    flows: Arc<DashMap<Uuid, Flow>>,
    executions: Arc<DashMap<Uuid, Execution>>,
    stage_runs: Arc<DashMap<Uuid, StageRun>>,
    children: Arc<DashMap<ChildKey, Uuid>>,
    condition_results: Arc<DashMap<Uuid, ConditionResult>>,
    send_records: Arc<DashMap<Uuid, StageRecords>>,
}

impl std::fmt::Debug for MemoryFlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFlowStore")
            .field("flows", &self.flows.len())
            .field("executions", &self.executions.len())
            .field("stage_runs", &self.stage_runs.len())
            .finish()
    }
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply<T: Clone>(row: &mut T, mutation: Mutation<T>) -> CampaignResult<T> {
    let mut next = row.clone();
    mutation(&mut next)?;
    *row = next.clone();
    Ok(next)
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn insert_flow(&self, flow: Flow) -> CampaignResult<()> {
        match self.flows.entry(flow.id) {
            Entry::Occupied(_) => Err(CampaignError::Store(format!(
                "flow {} is already registered",
                flow.id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(flow);
                Ok(())
            }
        }
    }

    async fn get_flow(&self, id: Uuid) -> CampaignResult<Option<Flow>> {
        Ok(self.flows.get(&id).map(|f| f.clone()))
    }

    async fn insert_execution(&self, execution: Execution) -> CampaignResult<()> {
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> CampaignResult<Option<Execution>> {
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn update_execution(
        &self,
        id: Uuid,
        mutation: Mutation<Execution>,
    ) -> CampaignResult<Execution> {
        let mut row = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found(format!("execution {id}")))?;
        apply(row.value_mut(), mutation)
    }

    async fn due_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CampaignResult<Vec<Execution>> {
        let mut due: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| {
                e.state == ExecutionState::InProgress && e.next_due_at.is_some_and(|at| at <= now)
            })
            .map(|e| e.clone())
            .collect();
        due.sort_by_key(|e| e.next_due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn insert_stage_run(&self, run: StageRun) -> CampaignResult<()> {
        self.stage_runs.insert(run.id, run);
        Ok(())
    }

    async fn get_stage_run(&self, id: Uuid) -> CampaignResult<Option<StageRun>> {
        Ok(self.stage_runs.get(&id).map(|r| r.clone()))
    }

    async fn update_stage_run(
        &self,
        id: Uuid,
        mutation: Mutation<StageRun>,
    ) -> CampaignResult<StageRun> {
        let mut row = self
            .stage_runs
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found(format!("stage run {id}")))?;
        apply(row.value_mut(), mutation)
    }

    async fn stage_runs_for_execution(&self, execution_id: Uuid) -> CampaignResult<Vec<StageRun>> {
        let mut runs: Vec<StageRun> = self
            .stage_runs
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.scheduled_at);
        Ok(runs)
    }

    async fn insert_child_stage_run(&self, run: StageRun) -> CampaignResult<(StageRun, bool)> {
        let Some(parent) = run.parent_id else {
            self.stage_runs.insert(run.id, run.clone());
            return Ok((run, true));
        };
        match self.children.entry((parent, run.node_id.clone(), run.branch)) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let stored = self
                    .stage_runs
                    .get(&id)
                    .map(|r| r.clone())
                    .ok_or_else(|| CampaignError::not_found(format!("stage run {id}")))?;
                Ok((stored, false))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(run.id);
                self.stage_runs.insert(run.id, run.clone());
                Ok((run, true))
            }
        }
    }

    async fn find_child_stage_run(
        &self,
        parent: Uuid,
        node_id: &str,
        branch: Option<Branch>,
    ) -> CampaignResult<Option<StageRun>> {
        let Some(id) = self
            .children
            .get(&(parent, node_id.to_string(), branch))
            .map(|id| *id)
        else {
            return Ok(None);
        };
        Ok(self.stage_runs.get(&id).map(|r| r.clone()))
    }

    async fn active_stage_runs(&self) -> CampaignResult<Vec<StageRun>> {
        Ok(self
            .stage_runs
            .iter()
            .filter(|r| r.state.is_active())
            .map(|r| r.clone())
            .collect())
    }

    async fn put_condition_result_if_absent(
        &self,
        result: ConditionResult,
    ) -> CampaignResult<ConditionResult> {
        let stored = self
            .condition_results
            .entry(result.stage_run_id)
            .or_insert(result);
        Ok(stored.clone())
    }

    async fn get_condition_result(
        &self,
        stage_run_id: Uuid,
    ) -> CampaignResult<Option<ConditionResult>> {
        Ok(self.condition_results.get(&stage_run_id).map(|r| r.clone()))
    }

    async fn claim_send_record(&self, record: SendRecord) -> CampaignResult<ClaimOutcome> {
        let mut stage = self.send_records.entry(record.stage_run_id).or_default();
        let stage = &mut *stage;
        match stage.records.get_mut(&record.recipient_id) {
            Some(existing) if existing.state == DeliveryState::Failed => {
                stage.counts.remove(DeliveryState::Failed);
                stage.counts.add(DeliveryState::Pending);
                existing.state = DeliveryState::Pending;
                existing.error = None;
                existing.destination = record.destination;
                existing.updated_at = record.updated_at;
                Ok(ClaimOutcome::Retrying)
            }
            Some(existing) => Ok(ClaimOutcome::AlreadyActive(existing.state)),
            None => {
                stage.counts.add(record.state);
                stage.records.insert(record.recipient_id.clone(), record);
                Ok(ClaimOutcome::Created)
            }
        }
    }

    async fn get_send_record(
        &self,
        stage_run_id: Uuid,
        recipient_id: &str,
    ) -> CampaignResult<Option<SendRecord>> {
        Ok(self
            .send_records
            .get(&stage_run_id)
            .and_then(|stage| stage.records.get(recipient_id).cloned()))
    }

    async fn update_send_record(
        &self,
        stage_run_id: Uuid,
        recipient_id: &str,
        mutation: Mutation<SendRecord>,
    ) -> CampaignResult<SendRecord> {
        let missing =
            || CampaignError::not_found(format!("send record {stage_run_id}/{recipient_id}"));
        let mut stage = self.send_records.get_mut(&stage_run_id).ok_or_else(missing)?;
        let stage = &mut *stage;
        let record = stage.records.get_mut(recipient_id).ok_or_else(missing)?;
        let before = record.state;
        let updated = apply(record, mutation)?;
        if updated.state != before {
            stage.counts.remove(before);
            stage.counts.add(updated.state);
        }
        Ok(updated)
    }

    async fn pending_send_records(
        &self,
        stage_run_id: Uuid,
        limit: usize,
    ) -> CampaignResult<Vec<SendRecord>> {
        Ok(self
            .send_records
            .get(&stage_run_id)
            .map(|stage| {
                stage
                    .records
                    .values()
                    .filter(|r| r.state == DeliveryState::Pending)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn send_counts(&self, stage_run_id: Uuid) -> CampaignResult<SendCounts> {
        Ok(self
            .send_records
            .get(&stage_run_id)
            .map(|stage| stage.counts)
            .unwrap_or_default())
    }
}
