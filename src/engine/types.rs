// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync engine.

use serde::{Deserialize, Serialize};

use crate::index::RunStatus;

/// Where a cycle currently is.
///
/// Failure jumps straight to `Failed` from any mid-cycle phase. Use
/// [`super::SyncEngine::phase_receiver`] to watch transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No cycle running.
    Idle,
    /// Disablement preflight.
    CheckDisabled,
    /// Both sides' `get_updates` in flight.
    Pull,
    /// Mapping, dedup, conflict resolution.
    Transform,
    /// Batched `apply_changes` plus link installation.
    Push,
    /// Cursors, fail-count resets, run summary.
    Persist,
    /// Cycle finished and recorded.
    Done,
    /// Cycle aborted and recorded.
    Failed,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::CheckDisabled => write!(f, "CheckDisabled"),
            Self::Pull => write!(f, "Pull"),
            Self::Transform => write!(f, "Transform"),
            Self::Push => write!(f, "Push"),
            Self::Persist => write!(f, "Persist"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Counters for one cycle; serialized into the run summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(default)]
    pub upserts_a_to_b: usize,
    #[serde(default)]
    pub deletes_a_to_b: usize,
    #[serde(default)]
    pub upserts_b_to_a: usize,
    #[serde(default)]
    pub deletes_b_to_a: usize,
    /// Push attempts that failed and were retried.
    #[serde(default)]
    pub retries: u32,
    /// Conflicts parked under the `manual` policy.
    #[serde(default)]
    pub conflicts: u32,
    /// Non-fatal per-record errors plus, on a failed cycle, the abort cause.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Set when the cycle was refused outright (e.g. `job_disabled`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunStats {
    /// Changes actually pushed, both directions.
    #[must_use]
    pub fn progress(&self) -> usize {
        self.upserts_a_to_b + self.deletes_a_to_b + self.upserts_b_to_a + self.deletes_b_to_a
    }

    /// Classification for a cycle that ran to completion.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.errors.is_empty() {
            RunStatus::Success
        } else if self.progress() > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }
}
