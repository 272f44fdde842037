//! Observer events emitted by the batch scheduler.
//!
//! Broadcast on the scheduler's event bus; subscribe via
//! [`scheduler::BatchScheduler::subscribe`](crate::scheduler::BatchScheduler::subscribe).
//! Events are advisory — item state is authoritative and always available
//! through view snapshots.

use pixelmill_core::types::ItemId;
use serde::Serialize;

/// A scheduler-level event.
#[derive(Debug, Clone, Serialize)]
pub enum SchedulerEvent {
    /// An item was registered in `pending` status.
    ItemSubmitted { item_id: ItemId },

    /// An item entered `processing`.
    ItemStarted { item_id: ItemId },

    /// A processing item reported progress (0-100).
    ItemProgress { item_id: ItemId, percent: i16 },

    /// A processing item moved to a new sub-step.
    ItemStage { item_id: ItemId, stage: String },

    /// An item settled as `done`.
    ItemCompleted { item_id: ItemId },

    /// An item settled as `error`.
    ItemFailed { item_id: ItemId, error: String },

    /// An item's run was cancelled; the item is back in `pending`.
    ItemCancelled { item_id: ItemId },

    /// An item was removed (its cleanup hook has already run).
    ItemRemoved { item_id: ItemId },

    /// A scheduling run began (`run_all`, `run_one`, or a retry).
    RunStarted { selected: usize },

    /// The current scheduling run settled every selected item.
    RunSettled,
}
