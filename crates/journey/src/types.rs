use std::collections::BTreeMap;

use campaign_core::channels::{Channel, Engagement, MessageContent, RecipientId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Flow graph ─────────────────────────────────────────────────────────────

/// A flow definition: send and condition nodes joined by edges. Immutable once
/// registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub entry_node: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FlowNode {
    Send(SendNode),
    Condition(ConditionNode),
    End(EndNode),
}

impl FlowNode {
    pub fn id(&self) -> &str {
        match self {
            FlowNode::Send(n) => &n.id,
            FlowNode::Condition(n) => &n.id,
            FlowNode::End(n) => &n.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            FlowNode::Send(_) => NodeKind::Send,
            FlowNode::Condition(_) => NodeKind::Condition,
            FlowNode::End(_) => NodeKind::End,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Send,
    Condition,
    End,
}

/// Delivers one message per recipient. The node id doubles as the content
/// reference handed to the content resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendNode {
    pub id: String,
    pub name: String,
    pub channel: Channel,
    /// Delay between this stage completing and the next node becoming due.
    #[serde(default)]
    pub wait_secs: u64,
}

/// Splits recipients into `yes`/`no` by their own upstream send record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub id: String,
    pub name: String,
    pub metric: ConditionMetric,
    pub operator: ComparisonOperator,
    pub threshold: i64,
    /// Observation window between the upstream send completing and evaluation.
    pub window_secs: u64,
}

impl ConditionNode {
    pub fn matches(&self, record: &SendRecord) -> bool {
        self.operator
            .compare(self.metric.value_of(record), self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndNode {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionMetric {
    Opened,
    Clicked,
    Bounced,
    OpenCount,
    ClickCount,
}

impl ConditionMetric {
    /// Booleans coerce to 0/1.
    pub fn value_of(&self, record: &SendRecord) -> i64 {
        match self {
            ConditionMetric::Opened => i64::from(record.open_count > 0),
            ConditionMetric::Clicked => i64::from(record.click_count > 0),
            ConditionMetric::Bounced => i64::from(record.bounced),
            ConditionMetric::OpenCount => i64::from(record.open_count),
            ConditionMetric::ClickCount => i64::from(record.click_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl ComparisonOperator {
    pub fn compare(&self, value: i64, threshold: i64) -> bool {
        match self {
            ComparisonOperator::Gt => value > threshold,
            ComparisonOperator::Ge => value >= threshold,
            ComparisonOperator::Eq => value == threshold,
            ComparisonOperator::Ne => value != threshold,
            ComparisonOperator::Lt => value < threshold,
            ComparisonOperator::Le => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Yes,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
    /// Required on condition outputs, absent otherwise.
    #[serde(default)]
    pub branch: Option<Branch>,
}

// ─── Executions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

/// The recipient set an execution runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Audience {
    /// Ids supplied at launch.
    Explicit { ids: Vec<RecipientId> },
    /// Everyone the recipient store lists for the flow, paged on demand.
    Store { flow_id: Uuid, total: usize },
}

impl Audience {
    pub fn len(&self) -> usize {
        match self {
            Audience::Explicit { ids } => ids.len(),
            Audience::Store { total, .. } => *total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One run of a flow against a recipient set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub state: ExecutionState,
    pub recipients: Audience,
    /// Node of the most recently dispatched stage.
    pub current_node: Option<String>,
    pub next_due_stage: Option<Uuid>,
    pub next_due_node: Option<String>,
    pub next_due_at: Option<DateTime<Utc>>,
    /// Human-readable reason for `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(flow_id: Uuid, recipients: Audience, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            state: ExecutionState::Pending,
            recipients,
            current_node: None,
            next_due_stage: None,
            next_due_node: None,
            next_due_at: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn clear_next_due(&mut self) {
        self.next_due_stage = None;
        self.next_due_node = None;
        self.next_due_at = None;
    }
}

// ─── Stage runs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunState {
    Pending,
    Executing,
    Batching,
    Completed,
    Failed,
}

impl StageRunState {
    /// Work has started and not yet settled.
    pub fn is_active(&self) -> bool {
        matches!(self, StageRunState::Executing | StageRunState::Batching)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageRunState::Completed | StageRunState::Failed)
    }
}

/// Which recipients a stage run applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StageAudience {
    /// The execution's full recipient set.
    Execution,
    /// The output of an upstream condition branch.
    Subset { ids: Vec<RecipientId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Direct,
    Chunked,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Direct => "direct",
            DispatchMode::Chunked => "chunked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub batch_id: Uuid,
    pub enqueued: u64,
    pub skipped_no_destination: u64,
    pub already_claimed: u64,
    pub dispatched_at: DateTime<Utc>,
}

/// Dispatch bookkeeping the recovery sweeper reads to judge liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub mode: DispatchMode,
    /// Recipients the stage was expected to reach.
    pub expected: u64,
    /// Recipients per chunk, fixed when the stage is dispatched.
    pub chunk_size: u64,
    pub chunks_total: u32,
    pub chunks: BTreeMap<u32, ChunkProgress>,
    pub last_progress_at: DateTime<Utc>,
}

impl StageProgress {
    /// Direct dispatch is a single chunk covering the whole audience.
    pub fn direct(expected: u64, now: DateTime<Utc>) -> Self {
        Self {
            mode: DispatchMode::Direct,
            expected,
            chunk_size: expected.max(1),
            chunks_total: 1,
            chunks: BTreeMap::new(),
            last_progress_at: now,
        }
    }

    pub fn chunked(expected: u64, chunk_size: u64, now: DateTime<Utc>) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            mode: DispatchMode::Chunked,
            expected,
            chunk_size,
            chunks_total: expected.div_ceil(chunk_size) as u32,
            chunks: BTreeMap::new(),
            last_progress_at: now,
        }
    }

    /// Offset and limit of chunk `index` within the audience.
    pub fn chunk_bounds(&self, index: u32) -> (usize, usize) {
        let offset = u64::from(index) * self.chunk_size;
        let limit = self.chunk_size.min(self.expected.saturating_sub(offset));
        (offset as usize, limit as usize)
    }

    pub fn all_chunks_dispatched(&self) -> bool {
        self.chunks.len() as u32 >= self.chunks_total
    }

    pub fn undispatched_chunks(&self) -> Vec<u32> {
        (0..self.chunks_total)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    pub fn enqueued(&self) -> u64 {
        self.chunks.values().map(|c| c.enqueued).sum()
    }

    pub fn skipped_no_destination(&self) -> u64 {
        self.chunks.values().map(|c| c.skipped_no_destination).sum()
    }
}

/// One node's run within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_kind: NodeKind,
    /// Stage run that scheduled this one.
    pub parent_id: Option<Uuid>,
    /// Set when scheduled from a condition output.
    pub branch: Option<Branch>,
    /// Send stage whose records a condition reads.
    pub source_send_stage: Option<Uuid>,
    pub audience: StageAudience,
    pub state: StageRunState,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Externally visible send-batch identifier.
    pub batch_id: Option<Uuid>,
    /// Channel and content snapshot, fixed when the stage is dispatched.
    pub channel: Option<Channel>,
    pub content: Option<MessageContent>,
    pub progress: Option<StageProgress>,
    pub cancelled: bool,
    pub recovered: bool,
    pub error: Option<String>,
}

impl StageRun {
    pub fn pending(
        execution_id: Uuid,
        node: &FlowNode,
        audience: StageAudience,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node.id().to_string(),
            node_kind: node.kind(),
            parent_id: None,
            branch: None,
            source_send_stage: None,
            audience,
            state: StageRunState::Pending,
            scheduled_at,
            started_at: None,
            completed_at: None,
            batch_id: None,
            channel: None,
            content: None,
            progress: None,
            cancelled: false,
            recovered: false,
            error: None,
        }
    }

    /// Chunked runs go stale sooner than everything else.
    pub fn is_chunked(&self) -> bool {
        self.state == StageRunState::Batching
            || self
                .progress
                .as_ref()
                .is_some_and(|p| p.mode == DispatchMode::Chunked)
    }
}

// ─── Condition results ──────────────────────────────────────────────────────

/// Inputs a condition was evaluated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSnapshot {
    pub metric: ConditionMetric,
    pub operator: ComparisonOperator,
    pub threshold: i64,
    pub source_send_stage: Option<Uuid>,
    /// Recipients that had a send record to evaluate.
    pub records_found: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionResult {
    pub stage_run_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub yes: Vec<RecipientId>,
    pub no: Vec<RecipientId>,
    pub yes_count: usize,
    pub no_count: usize,
    pub snapshot: ConditionSnapshot,
    pub evaluated_at: DateTime<Utc>,
}

// ─── Send records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
    Opened,
    Clicked,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }

    /// The provider accepted the message; only these records can engage.
    pub fn was_delivered(&self) -> bool {
        matches!(
            self,
            DeliveryState::Sent | DeliveryState::Opened | DeliveryState::Clicked
        )
    }
}

/// One message to one recipient within one stage run. Keyed by
/// (stage run, recipient); never created twice for the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecord {
    pub stage_run_id: Uuid,
    pub execution_id: Uuid,
    pub recipient_id: RecipientId,
    pub channel: Channel,
    pub destination: String,
    pub state: DeliveryState,
    pub attempts: u32,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub open_count: u32,
    pub click_count: u32,
    pub bounced: bool,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub first_opened_at: Option<DateTime<Utc>>,
    pub first_clicked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SendRecord {
    pub fn pending(
        stage_run_id: Uuid,
        execution_id: Uuid,
        recipient_id: RecipientId,
        channel: Channel,
        destination: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stage_run_id,
            execution_id,
            recipient_id,
            channel,
            destination,
            state: DeliveryState::Pending,
            attempts: 0,
            provider_message_id: None,
            error: None,
            open_count: 0,
            click_count: 0,
            bounced: false,
            created_at: now,
            sent_at: None,
            first_opened_at: None,
            first_clicked_at: None,
            updated_at: now,
        }
    }

    pub fn mark_sent(&mut self, provider_message_id: String, now: DateTime<Utc>) {
        self.state = DeliveryState::Sent;
        self.provider_message_id = Some(provider_message_id);
        self.error = None;
        self.sent_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.state = DeliveryState::Failed;
        self.error = Some(error.into());
        self.updated_at = now;
    }

    /// Applies a provider engagement signal. A click implies an open; state
    /// never moves backwards from `clicked`. Records that were never sent
    /// are left untouched.
    pub fn apply_engagement(&mut self, engagement: Engagement, now: DateTime<Utc>) {
        if !self.state.was_delivered() {
            return;
        }
        match engagement {
            Engagement::Opened => {
                self.record_open(now);
                if self.state != DeliveryState::Clicked {
                    self.state = DeliveryState::Opened;
                }
            }
            Engagement::Clicked => {
                if self.open_count == 0 {
                    self.record_open(now);
                }
                self.click_count += 1;
                self.first_clicked_at.get_or_insert(now);
                self.state = DeliveryState::Clicked;
            }
            Engagement::Bounced => {
                self.bounced = true;
                if self.state == DeliveryState::Sent {
                    self.state = DeliveryState::Failed;
                    self.error = Some("bounced".into());
                }
            }
        }
        self.updated_at = now;
    }

    fn record_open(&mut self, now: DateTime<Utc>) {
        self.open_count += 1;
        self.first_opened_at.get_or_insert(now);
    }
}

/// Per-stage tally of send records by delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub opened: u64,
    pub clicked: u64,
}

impl SendCounts {
    pub fn terminal(&self) -> u64 {
        self.sent + self.failed + self.opened + self.clicked
    }

    pub fn total(&self) -> u64 {
        self.terminal() + self.pending
    }

    pub fn add(&mut self, state: DeliveryState) {
        *self.slot(state) += 1;
    }

    pub fn remove(&mut self, state: DeliveryState) {
        let slot = self.slot(state);
        *slot = slot.saturating_sub(1);
    }

    fn slot(&mut self, state: DeliveryState) -> &mut u64 {
        match state {
            DeliveryState::Pending => &mut self.pending,
            DeliveryState::Sent => &mut self.sent,
            DeliveryState::Failed => &mut self.failed,
            DeliveryState::Opened => &mut self.opened,
            DeliveryState::Clicked => &mut self.clicked,
        }
    }
}
