//! Unified event bus — trait for emitting flow events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` so the engine stays agnostic of
//! where events end up (analytics pipeline, alerting, test capture).

use crate::channels::Channel;
use crate::types::{EventType, FlowEvent};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting flow events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FlowEvent) {}
}

/// Writes every event to the tracing log. Alert-worthy events are logged at
/// warn level.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, event: FlowEvent) {
        let execution_id = event.execution_id.map(|id| id.to_string());
        let stage_run_id = event.stage_run_id.map(|id| id.to_string());
        if event.event_type.is_alert() {
            tracing::warn!(
                event_type = ?event.event_type,
                execution_id = execution_id.as_deref(),
                stage_run_id = stage_run_id.as_deref(),
                detail = event.detail.as_deref(),
                "Flow event"
            );
        } else {
            tracing::info!(
                event_type = ?event.event_type,
                execution_id = execution_id.as_deref(),
                stage_run_id = stage_run_id.as_deref(),
                recipient_id = event.recipient_id.as_deref(),
                detail = event.detail.as_deref(),
                "Flow event"
            );
        }
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_type == event_type)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FlowEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Convenience builder for creating a `FlowEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    execution_id: Option<Uuid>,
    stage_run_id: Option<Uuid>,
    detail: Option<String>,
) -> FlowEvent {
    FlowEvent {
        event_id: Uuid::new_v4(),
        event_type,
        execution_id,
        stage_run_id,
        recipient_id: None,
        channel: None,
        detail,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

/// Builder for per-recipient delivery events.
pub fn make_send_event(
    event_type: EventType,
    stage_run_id: Uuid,
    recipient_id: impl Into<String>,
    channel: Channel,
    detail: Option<String>,
) -> FlowEvent {
    FlowEvent {
        recipient_id: Some(recipient_id.into()),
        channel: Some(channel),
        ..make_event(event_type, None, Some(stage_run_id), detail)
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
