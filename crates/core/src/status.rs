//! Item and task status enums and their state machines.
//!
//! This module lives in `core` (zero internal deps) so it can be used by
//! both the batch scheduler and the execution pool without either crate
//! depending on the other.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Batch item status
// ---------------------------------------------------------------------------

/// Lifecycle status of a single batch item.
///
/// Serialized lowercase so views match the wire/status strings used by
/// front-end consumers (`"pending"`, `"processing"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting to run. Newly submitted, cancelled, or reset-for-retry items.
    Pending,
    /// A work function currently owns this item.
    Processing,
    /// The work function returned successfully. Eligible for retry.
    Done,
    /// The work function failed. Eligible for retry.
    Error,
}

impl ItemStatus {
    /// Human-readable name (for log fields and error messages).
    pub fn label(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
        }
    }
}

/// Valid transitions for [`ItemStatus`].
///
/// Cancellation moves a `Processing` item back to `Pending` (it keeps its
/// retry eligibility); settled items (`Done` or `Error`) can only re-enter
/// the machine through an explicit retry reset to `Pending`.
pub mod item_state_machine {
    use super::ItemStatus;
    use ItemStatus::*;

    /// Returns the set of valid target statuses reachable from `from`.
    pub fn valid_transitions(from: ItemStatus) -> &'static [ItemStatus] {
        match from {
            // Pending -> Processing (picked up by a wave)
            Pending => &[Processing],
            // Processing -> Done, Error, Pending (cancelled mid-flight)
            Processing => &[Done, Error, Pending],
            // Error -> Pending (retry reset)
            Error => &[Pending],
            // Done -> Pending (retry reset, overwriting the prior result)
            Done => &[Pending],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: ItemStatus, to: ItemStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: ItemStatus, to: ItemStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!(
                "Invalid item transition: {} -> {}",
                from.label(),
                to.label()
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Pool task status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task submitted to the execution pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the FIFO queue for a free execution context.
    Queued,
    /// Dispatched to an execution context.
    Processing,
    /// The context returned a result. Terminal.
    Complete,
    /// The context reported an error or crashed. Terminal.
    Error,
}

impl TaskStatus {
    /// Human-readable name (for log fields and error messages).
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
        }
    }
}

/// Valid transitions for [`TaskStatus`].
///
/// A queued task can fail directly (pool terminated before dispatch).
/// Unlike batch items, pool tasks are never retried in place.
pub mod task_state_machine {
    use super::TaskStatus;
    use TaskStatus::*;

    /// Returns the set of valid target statuses reachable from `from`.
    pub fn valid_transitions(from: TaskStatus) -> &'static [TaskStatus] {
        match from {
            // Queued -> Processing (dispatched), Error (terminated while queued)
            Queued => &[Processing, Error],
            // Processing -> Complete, Error
            Processing => &[Complete, Error],
            // Terminal
            Complete | Error => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!(
                "Invalid task transition: {} -> {}",
                from.label(),
                to.label()
            ))
        }
    }
}
