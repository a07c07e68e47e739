use crate::channels::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain event emitted by the flow engine for analytics and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub execution_id: Option<Uuid>,
    pub stage_run_id: Option<Uuid>,
    pub recipient_id: Option<String>,
    pub channel: Option<Channel>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Execution lifecycle
    ExecutionLaunched,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    // Stage lifecycle
    StageScheduled,
    StageDispatched,
    StageCompleted,
    StageFailed,
    StageRecovered,
    ConditionEvaluated,
    // Message delivery
    MessageSent,
    MessageFailed,
    MessageDeferred,
    // Channel gate
    CircuitOpened,
    CircuitClosed,
}

impl EventType {
    /// Events that should page someone rather than just land in analytics.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            EventType::CircuitOpened | EventType::ExecutionFailed | EventType::StageFailed
        )
    }
}
