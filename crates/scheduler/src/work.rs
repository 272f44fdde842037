//! Work function contract between the scheduler and caller-supplied logic.
//!
//! Defines [`ItemWorker`], the trait every work function implements, along
//! with [`WorkContext`] (cancellation + progress reporting handle) and
//! [`WorkError`].

use std::sync::Arc;

use pixelmill_core::types::ItemId;
use tokio_util::sync::CancellationToken;

/// Outcome taxonomy for one work function run.
///
/// Cancellation is deliberately not a failure: a cancelled item returns to
/// `pending` with no error recorded, so it stays retry-eligible.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    /// The item's cancellation token was signalled and the work unwound.
    #[error("Work cancelled")]
    Cancelled,

    /// The work function hit a domain error; recorded on the item.
    #[error("{0}")]
    Failed(String),
}

/// Trait implemented by all work functions the scheduler can drive.
///
/// The worker receives a clone of the item's payload and must not touch
/// scheduler-owned state; on success it returns a partial update that the
/// scheduler merges back into the item. Implementations must observe
/// `ctx` at their suspension points and bail out with
/// [`WorkError::Cancelled`] promptly once cancellation is signalled.
pub trait ItemWorker<T: crate::item::ItemData>: Send + Sync {
    /// Process one item to settlement.
    fn process(
        &self,
        id: ItemId,
        data: T,
        ctx: &WorkContext,
    ) -> impl std::future::Future<Output = Result<T::Update, WorkError>> + Send;
}

/// Per-run handle handed to a work function.
///
/// Carries the item's cancellation token and sinks for progress/stage
/// reports. Cloning is cheap, so the context can be moved into progress
/// callbacks of downstream collaborators (e.g. an execution pool).
#[derive(Clone)]
pub struct WorkContext {
    cancel: CancellationToken,
    on_progress: Arc<dyn Fn(i16) + Send + Sync>,
    on_stage: Arc<dyn Fn(String) + Send + Sync>,
}

impl WorkContext {
    pub(crate) fn new(
        cancel: CancellationToken,
        on_progress: Arc<dyn Fn(i16) + Send + Sync>,
        on_stage: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Self {
        Self {
            cancel,
            on_progress,
            on_stage,
        }
    }

    /// A free-standing context with a fresh token and no report sinks.
    ///
    /// Intended for unit-testing worker implementations without a scheduler.
    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            on_progress: Arc::new(|_| {}),
            on_stage: Arc::new(|_| {}),
        }
    }

    /// The cancellation token for this run.
    ///
    /// Await `cancel_token().cancelled()` to react to cancellation at a
    /// suspension point.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail-out helper for cooperative cancellation checks.
    pub fn check_cancelled(&self) -> Result<(), WorkError> {
        if self.cancel.is_cancelled() {
            Err(WorkError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report completion percentage (clamped to 0-100 by the scheduler).
    pub fn report_progress(&self, percent: i16) {
        (self.on_progress)(percent);
    }

    /// Report the current sub-step label.
    pub fn report_stage(&self, stage: impl Into<String>) {
        (self.on_stage)(stage.into());
    }
}
