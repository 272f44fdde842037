//! Shared domain types and pure logic for the pixelmill batch engine.
//!
//! This crate has zero internal dependencies so it can be used by the
//! scheduler, the execution pool, the cache, and any future CLI tooling
//! without pulling in runtime machinery.

pub mod backoff;
pub mod concurrency;
pub mod error;
pub mod hashing;
pub mod progress;
pub mod status;
pub mod types;
