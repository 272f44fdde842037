//! Batch scheduler for concurrency-limited, cancellable item processing.
//!
//! [`BatchScheduler`] owns a collection of items, each tracked through the
//! pending → processing → done/error state machine, and drives a
//! caller-supplied [`ItemWorker`] over them in sequential waves of at most
//! `max_concurrency` concurrent items. Cancellation is cooperative: every
//! running item holds a token linked to a batch-wide token, so one item can
//! be cancelled alone or the whole batch at once.
//!
//! Item failures stay on the item; nothing in this crate escalates a work
//! error past the item that produced it.

pub mod events;
pub mod item;
pub mod scheduler;
pub mod work;

pub use events::SchedulerEvent;
pub use item::{BatchCounts, BatchItem, ItemData, ItemView};
pub use scheduler::{BatchScheduler, SchedulerConfig};
pub use work::{ItemWorker, WorkContext, WorkError};
