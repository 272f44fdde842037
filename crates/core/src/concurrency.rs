//! Concurrency defaults and wave partitioning.
//!
//! Pure functions and constants used by both the batch scheduler and the
//! execution pool. Lives in `core` to maintain the zero internal
//! dependency constraint.

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on the scheduler's default wave width. Batches are I/O- and
/// memory-heavy, so the default stays conservative even on wide machines.
pub const SCHEDULER_CONCURRENCY_CAP: usize = 4;

/// Upper bound on the pool's default context count.
pub const POOL_SIZE_CAP: usize = 8;

/// Hard ceiling accepted from configuration. Requests above this are
/// rejected rather than silently clamped.
pub const MAX_CONFIGURABLE_CONCURRENCY: usize = 64;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Number of hardware threads, falling back to 1 when detection fails.
pub fn detected_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default wave width for the scheduler: `min(hardware, 4)`, at least 1.
pub fn default_scheduler_concurrency() -> usize {
    detected_parallelism().min(SCHEDULER_CONCURRENCY_CAP).max(1)
}

/// Default context count for the pool: `min(hardware, 8)`, at least 1.
pub fn default_pool_size() -> usize {
    detected_parallelism().min(POOL_SIZE_CAP).max(1)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a configured concurrency limit.
///
/// Rules:
/// - Must be at least 1.
/// - Must not exceed `MAX_CONFIGURABLE_CONCURRENCY`.
pub fn validate_concurrency(limit: usize) -> Result<(), CoreError> {
    if limit == 0 {
        return Err(CoreError::Validation(
            "Concurrency limit must be at least 1".to_string(),
        ));
    }
    if limit > MAX_CONFIGURABLE_CONCURRENCY {
        return Err(CoreError::Validation(format!(
            "Concurrency limit must not exceed {MAX_CONFIGURABLE_CONCURRENCY}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wave partitioning
// ---------------------------------------------------------------------------

/// Split `items` into consecutive waves of at most `wave_size` elements.
///
/// The scheduler runs one wave to completion before starting the next,
/// which keeps the number of in-flight work functions at or below
/// `wave_size` at all times. A `wave_size` of 0 is treated as 1.
pub fn partition_waves<T: Clone>(items: &[T], wave_size: usize) -> Vec<Vec<T>> {
    let size = wave_size.max(1);
    items.chunks(size).map(|chunk| chunk.to_vec()).collect()
}
