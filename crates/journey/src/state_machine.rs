//! Allowed state transitions for executions and stage runs. Every status
//! write goes through `check_execution` or `check_stage` inside the store's
//! atomic update, so a losing writer sees `InvalidTransition` instead of
//! clobbering a settled state.

use campaign_core::{CampaignError, CampaignResult};

use crate::types::{ExecutionState, StageRunState};

/// Describes a single valid state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub trigger: &'static str,
}

/// Execution lifecycle:
/// `pending → in_progress → completed | failed`, cancellable until terminal.
pub const EXECUTION_TRANSITIONS: &[StateTransition<ExecutionState>] = &[
    StateTransition {
        from: ExecutionState::Pending,
        to: ExecutionState::InProgress,
        trigger: "first_stage_scheduled",
    },
    StateTransition {
        from: ExecutionState::Pending,
        to: ExecutionState::Failed,
        trigger: "launch_error",
    },
    StateTransition {
        from: ExecutionState::Pending,
        to: ExecutionState::Cancelled,
        trigger: "cancel",
    },
    StateTransition {
        from: ExecutionState::InProgress,
        to: ExecutionState::Completed,
        trigger: "no_remaining_stages",
    },
    StateTransition {
        from: ExecutionState::InProgress,
        to: ExecutionState::Failed,
        trigger: "unrecoverable_error",
    },
    StateTransition {
        from: ExecutionState::InProgress,
        to: ExecutionState::Cancelled,
        trigger: "cancel",
    },
];

/// Stage run lifecycle:
/// `pending → executing | batching → completed | failed`. The recovery
/// sweeper may also put a stale `executing` run back to `pending`.
pub const STAGE_RUN_TRANSITIONS: &[StateTransition<StageRunState>] = &[
    StateTransition {
        from: StageRunState::Pending,
        to: StageRunState::Executing,
        trigger: "dispatch_direct",
    },
    StateTransition {
        from: StageRunState::Pending,
        to: StageRunState::Batching,
        trigger: "dispatch_chunked",
    },
    StateTransition {
        from: StageRunState::Pending,
        to: StageRunState::Failed,
        trigger: "dispatch_error",
    },
    StateTransition {
        from: StageRunState::Executing,
        to: StageRunState::Completed,
        trigger: "batch_complete",
    },
    StateTransition {
        from: StageRunState::Batching,
        to: StageRunState::Completed,
        trigger: "batch_complete",
    },
    StateTransition {
        from: StageRunState::Executing,
        to: StageRunState::Failed,
        trigger: "batch_failed",
    },
    StateTransition {
        from: StageRunState::Batching,
        to: StageRunState::Failed,
        trigger: "batch_failed",
    },
    StateTransition {
        from: StageRunState::Executing,
        to: StageRunState::Pending,
        trigger: "recovery_reset",
    },
];

fn check<S>(table: &[StateTransition<S>], what: &str, from: S, to: S) -> CampaignResult<()>
where
    S: Copy + PartialEq + std::fmt::Debug,
{
    if table.iter().any(|t| t.from == from && t.to == to) {
        Ok(())
    } else {
        Err(CampaignError::InvalidTransition(format!(
            "{what} cannot move from {from:?} to {to:?}"
        )))
    }
}

pub fn can_transition_execution(from: ExecutionState, to: ExecutionState) -> bool {
    check(EXECUTION_TRANSITIONS, "execution", from, to).is_ok()
}

pub fn can_transition_stage(from: StageRunState, to: StageRunState) -> bool {
    check(STAGE_RUN_TRANSITIONS, "stage run", from, to).is_ok()
}

/// Returns `InvalidTransition` when the move is not in the table.
pub fn check_execution(from: ExecutionState, to: ExecutionState) -> CampaignResult<()> {
    check(EXECUTION_TRANSITIONS, "execution", from, to)
}

pub fn check_stage(from: StageRunState, to: StageRunState) -> CampaignResult<()> {
    check(STAGE_RUN_TRANSITIONS, "stage run", from, to)
}
