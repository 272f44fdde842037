//! pixelmill event bus infrastructure.
//!
//! Provides [`EventBus`], the in-process publish/subscribe hub backed by
//! `tokio::sync::broadcast`. The scheduler and the execution pool each
//! define their own event enums and share this bus implementation.

pub mod bus;

pub use bus::EventBus;
