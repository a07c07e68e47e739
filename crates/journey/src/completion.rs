//! Stage completion policy.
//!
//! Large stages never reach 100%: recipients without a destination for the
//! channel produce no send record. A stage is complete once nothing is
//! pending and the settled records cover the configured share of the
//! expected audience.

use serde::{Deserialize, Serialize};

use crate::types::{DispatchMode, SendCounts, StageProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionVerdict {
    Complete,
    StillRunning,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageCompletionPolicy {
    ratio: f64,
}

impl StageCompletionPolicy {
    /// `ratio` is clamped to `[0, 1]`.
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: if ratio.is_finite() {
                ratio.clamp(0.0, 1.0)
            } else {
                1.0
            },
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Settled records needed for `expected` recipients.
    pub fn required(&self, expected: u64) -> u64 {
        // Absorb float error so 0.8 * 12_000 is 9_600, not 9_601.
        ((self.ratio * expected as f64) - 1e-9).ceil().max(0.0) as u64
    }

    pub fn evaluate(&self, expected: u64, terminal: u64, pending: u64) -> CompletionVerdict {
        if pending > 0 {
            return CompletionVerdict::StillRunning;
        }
        if expected == 0 {
            return CompletionVerdict::Complete;
        }
        if terminal >= self.required(expected) {
            CompletionVerdict::Complete
        } else {
            CompletionVerdict::Failed
        }
    }

    /// Verdict for a fully dispatched send stage from its durable send
    /// records. A direct stage is measured against the records it created; a
    /// chunked stage against its whole audience. A stage that reached
    /// recipients but has no record at all fails.
    pub fn judge(&self, progress: &StageProgress, counts: &SendCounts) -> CompletionVerdict {
        if counts.pending > 0 {
            return CompletionVerdict::StillRunning;
        }
        if counts.total() == 0 && progress.expected > 0 {
            return CompletionVerdict::Failed;
        }
        let expected = match progress.mode {
            DispatchMode::Direct => counts.total(),
            DispatchMode::Chunked => progress.expected,
        };
        self.evaluate(expected, counts.terminal(), counts.pending)
    }
}

impl Default for StageCompletionPolicy {
    fn default() -> Self {
        Self::new(0.8)
    }
}
