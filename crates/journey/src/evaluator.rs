//! Condition evaluator — classifies recipients into `yes`/`no` by their own
//! send record from the upstream send stage. Recipients without a record are
//! placed in `no`.

use std::sync::Arc;

use campaign_core::channels::RecipientId;
use campaign_core::CampaignResult;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::store::FlowStore;
use crate::types::{ConditionNode, ConditionResult, ConditionSnapshot, StageRun};

/// Branch assignment for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub yes: Vec<RecipientId>,
    pub no: Vec<RecipientId>,
    pub records_found: usize,
}

impl Classification {
    pub fn len(&self) -> usize {
        self.yes.len() + self.no.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_result(
        self,
        stage: &StageRun,
        node: &ConditionNode,
        now: DateTime<Utc>,
    ) -> ConditionResult {
        ConditionResult {
            stage_run_id: stage.id,
            execution_id: stage.execution_id,
            node_id: node.id.clone(),
            yes_count: self.yes.len(),
            no_count: self.no.len(),
            yes: self.yes,
            no: self.no,
            snapshot: ConditionSnapshot {
                metric: node.metric,
                operator: node.operator,
                threshold: node.threshold,
                source_send_stage: stage.source_send_stage,
                records_found: self.records_found,
            },
            evaluated_at: now,
        }
    }
}

pub struct ConditionEvaluator {
    store: Arc<dyn FlowStore>,
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator").finish()
    }
}

impl ConditionEvaluator {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    /// Every input recipient lands in exactly one of the two lists, in input
    /// order.
    pub async fn classify(
        &self,
        node: &ConditionNode,
        source_send_stage: Option<Uuid>,
        recipients: &[RecipientId],
    ) -> CampaignResult<Classification> {
        let mut out = Classification::default();
        for recipient_id in recipients {
            let record = match source_send_stage {
                Some(stage) => self.store.get_send_record(stage, recipient_id).await?,
                None => None,
            };
            match record {
                Some(record) => {
                    out.records_found += 1;
                    if node.matches(&record) {
                        out.yes.push(recipient_id.clone());
                    } else {
                        out.no.push(recipient_id.clone());
                    }
                }
                None => out.no.push(recipient_id.clone()),
            }
        }
        debug!(
            node_id = %node.id,
            yes = out.yes.len(),
            no = out.no.len(),
            records_found = out.records_found,
            "Condition classified"
        );
        Ok(out)
    }
}
