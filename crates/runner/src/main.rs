//! End-to-end smoke runner: scheduler → pool → cache on synthetic photos.
//!
//! Builds the whole stack the way an embedding application would — a
//! [`ContextPool`] of edit handlers, a [`CachedFetcher`] supplying input
//! bytes, and a [`BatchScheduler`] driving items through both — then runs
//! one batch, retries the failures, and prints the final item views.

use std::sync::Arc;

use pixelmill_cache::{ByteStore, CachedFetcher, FetchError, Fetcher, FsStore};
use pixelmill_core::concurrency::validate_concurrency;
use pixelmill_core::hashing::sha256_hex;
use pixelmill_core::progress::percent_from_ratio;
use pixelmill_core::types::ItemId;
use pixelmill_pool::{ContextPool, ProgressFn, TaskHandler};
use pixelmill_scheduler::{
    BatchScheduler, ItemData, ItemWorker, SchedulerConfig, SchedulerEvent, WorkContext, WorkError,
};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RunnerConfig;

mod config;

/// One edit job shipped into an execution context.
struct PixelJob {
    name: String,
    bytes: Vec<u8>,
}

/// Outcome of one edit.
#[derive(Debug, Clone)]
struct EditOutcome {
    checksum: String,
    output_len: usize,
}

/// Stands in for the real edit kernels: checksums the input and reports
/// progress along the way. Jobs named `corrupt-*` fail like undecodable
/// images would.
struct EditHandler;

impl TaskHandler for EditHandler {
    type Payload = PixelJob;
    type Output = EditOutcome;

    fn handle(
        &mut self,
        job: PixelJob,
        progress: &mut dyn FnMut(i16),
    ) -> Result<EditOutcome, String> {
        if job.name.contains("corrupt") {
            return Err(format!("Unreadable pixel data in {}", job.name));
        }
        // Three stand-in edit passes, reported as fractions of the whole.
        const PASSES: u64 = 3;
        progress(percent_from_ratio(1, PASSES));
        let checksum = sha256_hex(&job.bytes);
        progress(percent_from_ratio(2, PASSES));
        let output_len = job.bytes.len() / 2;
        progress(percent_from_ratio(3, PASSES));
        Ok(EditOutcome {
            checksum,
            output_len,
        })
    }
}

/// Deterministic stand-in for fetching original image bytes.
struct SyntheticFetcher;

impl Fetcher for SyntheticFetcher {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, String> {
        let seed = key.as_bytes();
        if seed.is_empty() {
            return Err("Empty fetch key".into());
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let bytes = (0..4096)
            .map(|i| seed[i % seed.len()].wrapping_add(i as u8))
            .collect();
        Ok(bytes)
    }
}

/// A photo moving through the batch, with the edit outcome merged in.
#[derive(Debug, Clone)]
struct Photo {
    name: String,
    edited: Option<EditOutcome>,
}

impl ItemData for Photo {
    type Update = EditOutcome;

    fn apply_update(&mut self, update: EditOutcome) {
        self.edited = Some(update);
    }
}

/// Work function wiring the scheduler to the pool through the byte cache.
struct EditWorker {
    pool: Arc<ContextPool<EditHandler>>,
    cache: CachedFetcher<FsStore, SyntheticFetcher>,
}

impl ItemWorker<Photo> for EditWorker {
    async fn process(
        &self,
        _id: ItemId,
        photo: Photo,
        ctx: &WorkContext,
    ) -> Result<EditOutcome, WorkError> {
        ctx.check_cancelled()?;

        ctx.report_stage("fetching");
        let bytes = self
            .cache
            .get_or_fetch(&photo.name, ctx.cancel_token())
            .await
            .map_err(|error| match error {
                FetchError::Cancelled => WorkError::Cancelled,
                other => WorkError::Failed(other.to_string()),
            })?;

        ctx.report_stage("editing");
        let reporter = ctx.clone();
        let on_progress: ProgressFn = Arc::new(move |percent| reporter.report_progress(percent));
        self.pool
            .execute_with_progress(
                PixelJob {
                    name: photo.name,
                    bytes,
                },
                Some(on_progress),
            )
            .await
            .map_err(|error| WorkError::Failed(error.to_string()))
    }
}

/// Drain scheduler events into the log until the bus closes.
fn spawn_event_logger(
    mut events: broadcast::Receiver<SchedulerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::ItemCompleted { item_id }) => {
                    tracing::info!(item_id = %item_id, "Item completed");
                }
                Ok(SchedulerEvent::ItemFailed { item_id, error }) => {
                    tracing::warn!(item_id = %item_id, error = %error, "Item failed");
                }
                Ok(event) => tracing::debug!(?event, "Scheduler event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pixelmill_runner=debug,pixelmill_scheduler=debug,pixelmill_pool=debug,pixelmill_cache=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = RunnerConfig::from_env();
    validate_concurrency(config.max_concurrency)?;
    validate_concurrency(config.max_contexts)?;
    tracing::info!(
        max_concurrency = config.max_concurrency,
        max_contexts = config.max_contexts,
        item_count = config.item_count,
        cache_dir = %config.cache_dir.display(),
        "Loaded runner configuration"
    );

    // --- Byte cache ---
    let store = FsStore::open(config.cache_dir.clone()).await?;
    let cache = CachedFetcher::new(store, SyntheticFetcher);

    // --- Execution pool ---
    let pool = ContextPool::with_max_contexts(|| EditHandler, config.max_contexts);
    tracing::info!(max_contexts = pool.max_contexts(), "Execution pool ready");

    // --- Scheduler ---
    let scheduler = BatchScheduler::with_config(
        EditWorker {
            pool: Arc::clone(&pool),
            cache: cache.clone(),
        },
        SchedulerConfig {
            max_concurrency: config.max_concurrency,
        },
    )
    .with_cleanup(|item| tracing::debug!(item_id = %item.id, "Released item resources"));

    let logger = spawn_event_logger(scheduler.subscribe());

    // --- Batch run ---
    let photos: Vec<Photo> = (1..=config.item_count)
        .map(|n| {
            // One deterministic failure to exercise the retry path.
            let name = if n == 3 {
                "corrupt-photo-003".to_string()
            } else {
                format!("photo-{n:03}")
            };
            Photo { name, edited: None }
        })
        .collect();
    let ids = scheduler.submit(photos);
    tracing::info!(submitted = ids.len(), "Batch submitted");

    scheduler.run_all().await;

    let counts = scheduler.counts();
    tracing::info!(done = counts.done, errors = counts.error, "First pass settled");

    if counts.error > 0 {
        tracing::info!(retryable = counts.retryable(), "Retrying settled items");
        scheduler.retry_all().await;
    }

    // --- Final report ---
    for id in &ids {
        let Some(photo) = scheduler.item_data(*id) else {
            continue;
        };
        match photo.edited {
            Some(outcome) => tracing::info!(
                photo = %photo.name,
                checksum = %outcome.checksum,
                output_len = outcome.output_len,
                "Edit result",
            ),
            None => tracing::warn!(photo = %photo.name, "No edit result"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&scheduler.views())?);

    // --- Teardown ---
    scheduler.clear();
    drop(scheduler);
    let _ = logger.await;
    pool.terminate().await;
    tracing::info!(
        cached_bytes = cache.store().total_size().await?,
        "Runner finished"
    );
    Ok(())
}
