//! Isolated execution pool for crash-prone workloads.
//!
//! Provides a pool of execution contexts (dedicated OS threads running a
//! [`handler::TaskHandler`]), a per-context correlation bridge that
//! matches replies back to awaiting callers, typed context protocol
//! messages, and pool-level observer events.
//!
//! A panic inside handler code kills only that context's thread; the pool
//! fails the affected task, evicts the context permanently, and keeps
//! serving the queue with the remaining contexts.

pub mod bridge;
pub mod context;
pub mod events;
pub mod handler;
pub mod messages;
pub mod pool;

pub use bridge::{CallError, ContextBridge, ProgressFn};
pub use events::PoolEvent;
pub use handler::TaskHandler;
pub use pool::{ContextPool, PoolError, TaskInfo};
