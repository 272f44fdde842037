//! Observer events emitted by the execution pool.
//!
//! Broadcast on the pool's event bus; subscribe via
//! [`pool::ContextPool::subscribe`](crate::pool::ContextPool::subscribe).
//! Dropping every receiver simply stops delivery — the pool never waits
//! for observers.

use pixelmill_core::types::TaskId;
use serde::Serialize;

use crate::context::ContextId;

/// A pool-level event.
#[derive(Debug, Clone, Serialize)]
pub enum PoolEvent {
    /// A new execution context was spawned (lazy creation).
    ContextSpawned { context_id: ContextId },

    /// A context's init hook failed; it was discarded unused.
    ContextInitFailed { context_id: ContextId, error: String },

    /// A context thread died mid-task. It is evicted permanently.
    ContextCrashed { context_id: ContextId },

    /// A task entered the FIFO queue.
    TaskQueued { task_id: TaskId },

    /// A task was dispatched to a context.
    TaskStarted {
        task_id: TaskId,
        context_id: ContextId,
    },

    /// An in-flight task reported progress (0-100).
    TaskProgress { task_id: TaskId, percent: i16 },

    /// A task completed successfully.
    TaskCompleted {
        task_id: TaskId,
        context_id: ContextId,
    },

    /// A task failed (handler error, crash, or spawn failure).
    TaskFailed { task_id: TaskId, error: String },

    /// The pool was terminated; queued tasks were rejected.
    PoolTerminated,
}
