use campaign_core::channels::RecipientId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work consumed by task workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Task {
    /// Materialize one chunk of a large-volume stage run and enqueue its sends.
    /// `attempt` counts prior timed-out runs of this chunk.
    DispatchChunk {
        stage_run_id: Uuid,
        chunk_index: u32,
        #[serde(default)]
        attempt: u32,
    },
    /// Deliver one message. `attempt` counts prior transport attempts.
    Send {
        stage_run_id: Uuid,
        recipient_id: RecipientId,
        attempt: u32,
    },
}

impl Task {
    pub fn stage_run_id(&self) -> Uuid {
        match self {
            Task::DispatchChunk { stage_run_id, .. } | Task::Send { stage_run_id, .. } => {
                *stage_run_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::DispatchChunk { .. } => "dispatch_chunk",
            Task::Send { .. } => "send",
        }
    }
}

/// Receipt for an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: Uuid,
    pub eligible_at: DateTime<Utc>,
}

/// A task together with its queue metadata, as stored and dequeued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub handle: TaskHandle,
    pub task: Task,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_wire_format() {
        let stage_run_id = Uuid::new_v4();
        let task = Task::Send {
            stage_run_id,
            recipient_id: "r-1".into(),
            attempt: 2,
        };
        let json: serde_json::Value = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "send");
        assert_eq!(json["recipient_id"], "r-1");
        assert_eq!(task.stage_run_id(), stage_run_id);
    }

    #[test]
    fn test_chunk_task_without_attempt_decodes_as_first_try() {
        let stage_run_id = Uuid::new_v4();
        let json = serde_json::json!({
            "type": "dispatch_chunk",
            "stage_run_id": stage_run_id,
            "chunk_index": 4,
        });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(
            task,
            Task::DispatchChunk {
                stage_run_id,
                chunk_index: 4,
                attempt: 0
            }
        );
    }
}
