//! Batch items and their read-only observer views.

use chrono::Utc;
use pixelmill_core::status::ItemStatus;
use pixelmill_core::types::{ItemId, Timestamp};
use serde::Serialize;

/// Domain payload carried by a batch item.
///
/// The scheduler never inspects the payload; it only clones it out for the
/// work function and merges the returned [`ItemData::Update`] back in when
/// the item completes. Keep large buffers behind `Arc` so the per-run clone
/// stays cheap.
pub trait ItemData: Clone + Send + Sync + 'static {
    /// Partial update produced by a successful run.
    type Update: Send + 'static;

    /// Merge a successful run's output into this payload.
    fn apply_update(&mut self, update: Self::Update);
}

/// One unit of submitted work, owned exclusively by the scheduler.
///
/// Callers observe items through [`ItemView`] snapshots; the only mutable
/// access handed out is the `&BatchItem` passed to the cleanup hook when an
/// item is removed.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub id: ItemId,
    pub data: T,
    pub status: ItemStatus,
    /// Completion percentage (0-100); meaningful only while processing.
    pub progress: i16,
    /// Free-text label of the current sub-step; cleared outside processing.
    pub stage: String,
    /// Failure description; present exactly when `status` is `Error`.
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<T> BatchItem<T> {
    pub(crate) fn new(data: T) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            data,
            status: ItemStatus::Pending,
            progress: 0,
            stage: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Snapshot for observers.
    pub fn view(&self) -> ItemView {
        ItemView {
            id: self.id,
            status: self.status,
            progress: self.progress,
            stage: self.stage.clone(),
            error: self.error.clone(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Enter `processing` with fresh progress/stage fields.
    pub(crate) fn mark_processing(&mut self) {
        self.status = ItemStatus::Processing;
        self.progress = 0;
        self.stage.clear();
        self.error = None;
        self.touch();
    }

    /// Settle as `done`.
    pub(crate) fn mark_done(&mut self) {
        self.status = ItemStatus::Done;
        self.progress = 100;
        self.stage.clear();
        self.touch();
    }

    /// Settle as `error` with a failure description.
    pub(crate) fn mark_error(&mut self, error: String) {
        self.status = ItemStatus::Error;
        self.error = Some(error);
        self.stage.clear();
        self.touch();
    }

    /// Return to `pending` (cancellation or retry reset), clearing every
    /// run-scoped field so the item is indistinguishable from a fresh one.
    pub(crate) fn mark_pending(&mut self) {
        self.status = ItemStatus::Pending;
        self.progress = 0;
        self.stage.clear();
        self.error = None;
        self.touch();
    }
}

/// Read-only snapshot of one item, safe to hand to any observer.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub id: ItemId,
    pub status: ItemStatus,
    pub progress: i16,
    pub stage: String,
    pub error: Option<String>,
}

/// Per-status totals across the whole batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
}

impl BatchCounts {
    /// Items a retry-all pass would pick up.
    pub fn retryable(self) -> usize {
        self.done + self.error
    }
}
