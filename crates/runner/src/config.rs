use std::path::PathBuf;

use pixelmill_core::concurrency::{default_pool_size, default_scheduler_concurrency};

/// Runner configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local smoke run. Override via
/// environment variables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Peak concurrently processing items (default: `min(hardware, 4)`).
    pub max_concurrency: usize,
    /// Execution context cap (default: `min(hardware, 8)`).
    pub max_contexts: usize,
    /// Number of synthetic photos to submit (default: `8`).
    pub item_count: usize,
    /// Directory backing the byte store (default: `.pixelmill-cache`).
    pub cache_dir: PathBuf,
}

impl RunnerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var           | Default             |
    /// |-------------------|---------------------|
    /// | `MAX_CONCURRENCY` | `min(hardware, 4)`  |
    /// | `MAX_CONTEXTS`    | `min(hardware, 8)`  |
    /// | `ITEM_COUNT`      | `8`                 |
    /// | `CACHE_DIR`       | `.pixelmill-cache`  |
    pub fn from_env() -> Self {
        let max_concurrency: usize = std::env::var("MAX_CONCURRENCY")
            .ok()
            .map(|raw| raw.parse().expect("MAX_CONCURRENCY must be a valid usize"))
            .unwrap_or_else(default_scheduler_concurrency);

        let max_contexts: usize = std::env::var("MAX_CONTEXTS")
            .ok()
            .map(|raw| raw.parse().expect("MAX_CONTEXTS must be a valid usize"))
            .unwrap_or_else(default_pool_size);

        let item_count: usize = std::env::var("ITEM_COUNT")
            .unwrap_or_else(|_| "8".into())
            .parse()
            .expect("ITEM_COUNT must be a valid usize");

        let cache_dir = PathBuf::from(
            std::env::var("CACHE_DIR").unwrap_or_else(|_| ".pixelmill-cache".into()),
        );

        Self {
            max_concurrency,
            max_contexts,
            item_count,
            cache_dir,
        }
    }
}
