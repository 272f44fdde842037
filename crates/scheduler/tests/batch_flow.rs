//! Integration tests for batch scheduling end to end.
//!
//! Covers the behavioural guarantees callers rely on: the concurrency
//! ceiling across waves, cancellation returning items to a retry-eligible
//! state, retry selection, double-run prevention, and isolation when the
//! work function delegates into an execution pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pixelmill_core::status::ItemStatus;
use pixelmill_core::types::ItemId;
use pixelmill_pool::{ContextPool, TaskHandler};
use pixelmill_scheduler::{
    BatchScheduler, ItemData, ItemWorker, SchedulerConfig, WorkContext, WorkError,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Photo {
    name: String,
    output: Option<String>,
}

impl Photo {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            output: None,
        }
    }
}

impl ItemData for Photo {
    type Update = String;

    fn apply_update(&mut self, update: String) {
        self.output = Some(update);
    }
}

/// Poll `condition` until it holds or the deadline passes.
async fn wait_for(deadline_ms: u64, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not reached within {deadline_ms}ms"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Concurrency ceiling
// ---------------------------------------------------------------------------

/// Tracks how many items run at once while sleeping briefly.
struct GaugeWorker {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ItemWorker<Photo> for GaugeWorker {
    async fn process(
        &self,
        _id: ItemId,
        data: Photo,
        _ctx: &WorkContext,
    ) -> Result<String, WorkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(data.name)
    }
}

/// Ten items with a limit of three never exceed three concurrent runs, and
/// all of them settle.
#[tokio::test]
async fn processing_never_exceeds_max_concurrency() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let scheduler = BatchScheduler::with_config(
        GaugeWorker {
            in_flight: Arc::clone(&in_flight),
            peak: Arc::clone(&peak),
        },
        SchedulerConfig { max_concurrency: 3 },
    );

    scheduler.submit((0..10).map(|i| Photo::new(&format!("img-{i}"))));
    scheduler.run_all().await;

    assert_eq!(scheduler.counts().done, 10);
    assert!(
        peak.load(Ordering::SeqCst) <= 3,
        "peak concurrency {} exceeded the limit",
        peak.load(Ordering::SeqCst)
    );
    assert!(!scheduler.is_processing());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Blocks until cancelled while armed; completes normally otherwise.
struct BlockWhileArmed {
    armed: Arc<AtomicBool>,
}

impl ItemWorker<Photo> for BlockWhileArmed {
    async fn process(
        &self,
        _id: ItemId,
        data: Photo,
        ctx: &WorkContext,
    ) -> Result<String, WorkError> {
        if self.armed.load(Ordering::SeqCst) {
            ctx.cancel_token().cancelled().await;
            return Err(WorkError::Cancelled);
        }
        Ok(data.name.to_uppercase())
    }
}

/// Cancelling a processing item lands it back in `pending` with no error
/// and zero progress, and it can be re-run immediately.
#[tokio::test]
async fn cancel_one_restores_retry_eligibility() {
    let armed = Arc::new(AtomicBool::new(true));
    let scheduler = Arc::new(BatchScheduler::with_config(
        BlockWhileArmed {
            armed: Arc::clone(&armed),
        },
        SchedulerConfig { max_concurrency: 2 },
    ));
    let ids = scheduler.submit(vec![Photo::new("stuck")]);

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_all().await })
    };
    wait_for(2_000, || {
        scheduler.view(ids[0]).unwrap().status == ItemStatus::Processing
    })
    .await;

    scheduler.cancel_one(ids[0]).unwrap();
    runner.await.unwrap();

    let view = scheduler.view(ids[0]).unwrap();
    assert_eq!(view.status, ItemStatus::Pending);
    assert_eq!(view.progress, 0);
    assert!(view.error.is_none());

    // Re-run works on the first attempt.
    armed.store(false, Ordering::SeqCst);
    scheduler.run_one(ids[0]).await.unwrap();
    assert_eq!(scheduler.view(ids[0]).unwrap().status, ItemStatus::Done);
}

/// Cancelling the batch while three items are processing returns all three
/// to `pending`, none of them marked as failed.
#[tokio::test]
async fn cancel_all_fans_out_to_every_running_item() {
    let armed = Arc::new(AtomicBool::new(true));
    let scheduler = Arc::new(BatchScheduler::with_config(
        BlockWhileArmed {
            armed: Arc::clone(&armed),
        },
        SchedulerConfig { max_concurrency: 3 },
    ));
    scheduler.submit(vec![Photo::new("a"), Photo::new("b"), Photo::new("c")]);

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_all().await })
    };
    wait_for(2_000, || scheduler.counts().processing == 3).await;
    assert!(scheduler.is_processing());

    scheduler.cancel_all();
    runner.await.unwrap();

    let counts = scheduler.counts();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.error, 0);
    assert!(!scheduler.is_processing());

    // A fresh run is unaffected by the spent batch token.
    armed.store(false, Ordering::SeqCst);
    scheduler.run_all().await;
    assert_eq!(scheduler.counts().done, 3);
}

// ---------------------------------------------------------------------------
// Retry selection
// ---------------------------------------------------------------------------

/// Counts executions per item name; fails names starting with "fail".
struct CountingWorker {
    runs: Arc<Mutex<HashMap<String, usize>>>,
}

impl ItemWorker<Photo> for CountingWorker {
    async fn process(
        &self,
        _id: ItemId,
        data: Photo,
        _ctx: &WorkContext,
    ) -> Result<String, WorkError> {
        *self
            .runs
            .lock()
            .unwrap()
            .entry(data.name.clone())
            .or_insert(0) += 1;
        if data.name.starts_with("fail") {
            Err(WorkError::Failed("synthetic failure".to_string()))
        } else {
            Ok(format!("processed {}", data.name))
        }
    }
}

/// `retry_all` re-runs exactly the settled (done + error) items and leaves
/// later-submitted pending items untouched.
#[tokio::test]
async fn retry_all_targets_only_settled_items() {
    let runs = Arc::new(Mutex::new(HashMap::new()));
    let scheduler = BatchScheduler::with_config(
        CountingWorker {
            runs: Arc::clone(&runs),
        },
        SchedulerConfig { max_concurrency: 2 },
    );

    scheduler.submit(vec![
        Photo::new("ok-1"),
        Photo::new("ok-2"),
        Photo::new("ok-3"),
        Photo::new("fail-1"),
        Photo::new("fail-2"),
    ]);
    scheduler.run_all().await;
    assert_eq!(scheduler.counts().done, 3);
    assert_eq!(scheduler.counts().error, 2);

    // This one must not be touched by retry_all.
    let late = scheduler.submit(vec![Photo::new("late")]);

    scheduler.retry_all().await;

    let runs = runs.lock().unwrap();
    for name in ["ok-1", "ok-2", "ok-3", "fail-1", "fail-2"] {
        assert_eq!(runs.get(name), Some(&2), "{name} should have run twice");
    }
    assert_eq!(runs.get("late"), None);
    assert_eq!(
        scheduler.view(late[0]).unwrap().status,
        ItemStatus::Pending
    );
}

/// `retry_one` on a `done` item re-executes the work exactly once and
/// overwrites the prior result.
#[tokio::test]
async fn retry_one_overwrites_the_prior_result() {
    let runs = Arc::new(Mutex::new(HashMap::new()));
    let scheduler = BatchScheduler::with_config(
        CountingWorker {
            runs: Arc::clone(&runs),
        },
        SchedulerConfig { max_concurrency: 2 },
    );
    let ids = scheduler.submit(vec![Photo::new("photo")]);

    scheduler.run_all().await;
    scheduler.retry_one(ids[0]).await.unwrap();

    assert_eq!(runs.lock().unwrap().get("photo"), Some(&2));
    assert_eq!(
        scheduler.item_data(ids[0]).unwrap().output.as_deref(),
        Some("processed photo")
    );
}

// ---------------------------------------------------------------------------
// Double-run prevention
// ---------------------------------------------------------------------------

/// Sleeps long enough for a second run attempt to race the first.
struct SlowCountingWorker {
    executions: Arc<AtomicUsize>,
}

impl ItemWorker<Photo> for SlowCountingWorker {
    async fn process(
        &self,
        _id: ItemId,
        data: Photo,
        _ctx: &WorkContext,
    ) -> Result<String, WorkError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(data.name)
    }
}

/// `run_one` on an item that is already processing skips it instead of
/// running the work function twice.
#[tokio::test]
async fn run_one_never_double_runs_a_processing_item() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = Arc::new(BatchScheduler::with_config(
        SlowCountingWorker {
            executions: Arc::clone(&executions),
        },
        SchedulerConfig { max_concurrency: 1 },
    ));
    let ids = scheduler.submit(vec![Photo::new("solo")]);

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_all().await })
    };
    wait_for(2_000, || {
        scheduler.view(ids[0]).unwrap().status == ItemStatus::Processing
    })
    .await;

    // Second entry point while the first is mid-flight.
    scheduler.run_one(ids[0]).await.unwrap();
    runner.await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.view(ids[0]).unwrap().status, ItemStatus::Done);
}

// ---------------------------------------------------------------------------
// Isolation through the execution pool
// ---------------------------------------------------------------------------

/// Pool handler that crashes its context for marked payloads.
struct PixelHandler;

impl TaskHandler for PixelHandler {
    type Payload = String;
    type Output = String;

    fn handle(&mut self, payload: String, _: &mut dyn FnMut(i16)) -> Result<String, String> {
        if payload.contains("crash") {
            panic!("pixel buffer corrupted");
        }
        Ok(payload.to_uppercase())
    }
}

/// Work function that delegates each item into the shared pool.
struct PoolWorker {
    pool: Arc<ContextPool<PixelHandler>>,
}

impl ItemWorker<Photo> for PoolWorker {
    async fn process(
        &self,
        _id: ItemId,
        data: Photo,
        ctx: &WorkContext,
    ) -> Result<String, WorkError> {
        ctx.check_cancelled()?;
        ctx.report_stage("dispatching");
        self.pool
            .execute(data.name.clone())
            .await
            .map_err(|error| WorkError::Failed(error.to_string()))
    }
}

/// One item crashing its execution context fails alone; every sibling item
/// reaches `done` with its own result.
#[tokio::test]
async fn context_crash_is_isolated_to_one_item() {
    let pool = ContextPool::with_max_contexts(|| PixelHandler, 2);
    let scheduler = BatchScheduler::with_config(
        PoolWorker {
            pool: Arc::clone(&pool),
        },
        SchedulerConfig { max_concurrency: 5 },
    );

    let ids = scheduler.submit(vec![
        Photo::new("one"),
        Photo::new("two"),
        Photo::new("crash-three"),
        Photo::new("four"),
        Photo::new("five"),
    ]);
    scheduler.run_all().await;

    for (index, id) in ids.iter().enumerate() {
        let view = scheduler.view(*id).unwrap();
        if index == 2 {
            assert_eq!(view.status, ItemStatus::Error);
            assert!(
                view.error.as_deref().unwrap_or_default().contains("crashed"),
                "crash error should name the context crash, got {:?}",
                view.error
            );
        } else {
            assert_eq!(view.status, ItemStatus::Done, "item {index} should be done");
        }
    }

    let healthy = scheduler.item_data(ids[0]).unwrap();
    assert_eq!(healthy.output.as_deref(), Some("ONE"));
}
