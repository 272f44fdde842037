//! The batch scheduler: wave-based concurrent execution with cancellation
//! and retry.
//!
//! A run selects target items, partitions them into waves of at most
//! `max_concurrency`, and settles each wave fully before starting the next.
//! Every running item holds a cancellation token child-linked to a
//! batch-wide token: cancelling the batch fans out to all running items,
//! while cancelling one item leaves the rest untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use pixelmill_core::concurrency::{default_scheduler_concurrency, partition_waves};
use pixelmill_core::error::CoreError;
use pixelmill_core::progress::clamp_percent;
use pixelmill_core::status::{item_state_machine, ItemStatus};
use pixelmill_core::types::ItemId;
use pixelmill_events::EventBus;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::SchedulerEvent;
use crate::item::{BatchCounts, BatchItem, ItemData, ItemView};
use crate::work::{ItemWorker, WorkContext, WorkError};

/// Broadcast channel capacity for scheduler events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tuning knobs for a [`BatchScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Peak number of items processed concurrently within one run.
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_scheduler_concurrency(),
        }
    }
}

/// Per-removed-item cleanup hook.
type CleanupFn<T> = Box<dyn Fn(&BatchItem<T>) + Send + Sync>;

/// Items plus their submission order, guarded together.
struct ItemTable<T> {
    items: HashMap<ItemId, BatchItem<T>>,
    order: Vec<ItemId>,
}

impl<T> ItemTable<T> {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            order: Vec::new(),
        }
    }
}

// Poisoning only means a panicked writer; the table itself stays valid.
fn table_read<T>(table: &RwLock<ItemTable<T>>) -> RwLockReadGuard<'_, ItemTable<T>> {
    table.read().unwrap_or_else(PoisonError::into_inner)
}

fn table_write<T>(table: &RwLock<ItemTable<T>>) -> RwLockWriteGuard<'_, ItemTable<T>> {
    table.write().unwrap_or_else(PoisonError::into_inner)
}

/// Orchestrates item execution through a caller-supplied [`ItemWorker`].
///
/// All mutation of item state funnels through the scheduler; callers see
/// items only as [`ItemView`] snapshots and payload clones.
pub struct BatchScheduler<T: ItemData, W: ItemWorker<T>> {
    worker: W,
    max_concurrency: usize,
    table: Arc<RwLock<ItemTable<T>>>,
    /// Tokens for items currently in `processing`, removed at settlement.
    tokens: Mutex<HashMap<ItemId, CancellationToken>>,
    /// Parent of every per-item token; replaced wholesale by `cancel_all`.
    batch_token: Mutex<CancellationToken>,
    active_runs: AtomicUsize,
    events: Arc<EventBus<SchedulerEvent>>,
    cleanup: Option<CleanupFn<T>>,
}

impl<T: ItemData, W: ItemWorker<T>> BatchScheduler<T, W> {
    /// Create a scheduler with the default concurrency limit
    /// (`min(hardware, 4)`).
    pub fn new(worker: W) -> Self {
        Self::with_config(worker, SchedulerConfig::default())
    }

    /// Create a scheduler with an explicit configuration.
    ///
    /// `max_concurrency` is clamped to at least 1.
    pub fn with_config(worker: W, config: SchedulerConfig) -> Self {
        Self {
            worker,
            max_concurrency: config.max_concurrency.max(1),
            table: Arc::new(RwLock::new(ItemTable::new())),
            tokens: Mutex::new(HashMap::new()),
            batch_token: Mutex::new(CancellationToken::new()),
            active_runs: AtomicUsize::new(0),
            events: Arc::new(EventBus::new(EVENT_CHANNEL_CAPACITY)),
            cleanup: None,
        }
    }

    /// Install a hook invoked exactly once per removed item, for releasing
    /// external resources tied to it.
    pub fn with_cleanup(mut self, hook: impl Fn(&BatchItem<T>) + Send + Sync + 'static) -> Self {
        self.cleanup = Some(Box::new(hook));
        self
    }

    // ---- submission ----

    /// Register new items in `pending` status. Does not start any work.
    ///
    /// Returns the assigned ids in submission order.
    pub fn submit(&self, items: impl IntoIterator<Item = T>) -> Vec<ItemId> {
        let mut ids = Vec::new();
        {
            let mut table = table_write(&self.table);
            for data in items {
                let item = BatchItem::new(data);
                let id = item.id;
                table.order.push(id);
                table.items.insert(id, item);
                ids.push(id);
                self.events.publish(SchedulerEvent::ItemSubmitted { item_id: id });
            }
        }
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "Submitted items");
        }
        ids
    }

    // ---- running ----

    /// Run every `pending` and `error` item, in waves of at most
    /// `max_concurrency`, settling each wave fully before the next starts.
    ///
    /// Returns once every selected item has settled (done, error, or
    /// cancelled back to pending).
    pub async fn run_all(&self) {
        let targets = self.select_ids(|item| {
            matches!(item.status, ItemStatus::Pending | ItemStatus::Error)
        });
        self.run_ids(targets).await;
    }

    /// Run a single item outside of wave sequencing.
    ///
    /// Safe to call while `run_all` is in flight; an item that is already
    /// `processing` is skipped rather than run twice.
    pub async fn run_one(&self, id: ItemId) -> Result<(), CoreError> {
        if !self.contains(id) {
            return Err(CoreError::NotFound { entity: "item", id });
        }
        self.run_ids(vec![id]).await;
        Ok(())
    }

    /// Reset a `done` or `error` item to `pending` and run it again.
    ///
    /// Retrying an item that is currently `processing` is a no-op.
    pub async fn retry_one(&self, id: ItemId) -> Result<(), CoreError> {
        {
            let mut table = table_write(&self.table);
            let item = table
                .items
                .get_mut(&id)
                .ok_or(CoreError::NotFound { entity: "item", id })?;
            match item.status {
                ItemStatus::Processing => {
                    tracing::debug!(item_id = %id, "Item already processing, retry skipped");
                    return Ok(());
                }
                ItemStatus::Done | ItemStatus::Error => item.mark_pending(),
                ItemStatus::Pending => {}
            }
        }
        self.run_ids(vec![id]).await;
        Ok(())
    }

    /// Reset every `done` and `error` item to `pending` and run exactly
    /// those items, leaving untouched items that were already `pending`.
    pub async fn retry_all(&self) {
        let targets = {
            let mut table = table_write(&self.table);
            let ids: Vec<ItemId> = table
                .order
                .iter()
                .copied()
                .filter(|id| {
                    table
                        .items
                        .get(id)
                        .is_some_and(|item| {
                            matches!(item.status, ItemStatus::Done | ItemStatus::Error)
                        })
                })
                .collect();
            for id in &ids {
                if let Some(item) = table.items.get_mut(id) {
                    item.mark_pending();
                }
            }
            ids
        };
        tracing::info!(count = targets.len(), "Retrying settled items");
        self.run_ids(targets).await;
    }

    // ---- cancellation ----

    /// Signal one item's cancellation token.
    ///
    /// The running work function observes the token and unwinds; the item
    /// lands back in `pending` with no error recorded. Cancelling an item
    /// that is not processing has no effect.
    pub fn cancel_one(&self, id: ItemId) -> Result<(), CoreError> {
        if !self.contains(id) {
            return Err(CoreError::NotFound { entity: "item", id });
        }
        if let Some(token) = self.tokens_lock().get(&id) {
            tracing::debug!(item_id = %id, "Cancelling item");
            token.cancel();
        }
        Ok(())
    }

    /// Cancel the batch-wide token, fanning out to every running item.
    ///
    /// Waves not yet started are skipped. A fresh batch token is installed
    /// immediately, so later runs start unaffected.
    pub fn cancel_all(&self) {
        let previous = {
            let mut current = self.batch_lock();
            std::mem::replace(&mut *current, CancellationToken::new())
        };
        tracing::info!("Cancelling batch");
        previous.cancel();
    }

    // ---- removal ----

    /// Cancel (if running) and delete one item, invoking the cleanup hook.
    pub fn remove(&self, id: ItemId) -> Result<(), CoreError> {
        if let Some(token) = self.tokens_lock().remove(&id) {
            token.cancel();
        }
        let removed = {
            let mut table = table_write(&self.table);
            table.order.retain(|other| *other != id);
            table.items.remove(&id)
        };
        let Some(item) = removed else {
            return Err(CoreError::NotFound { entity: "item", id });
        };
        if let Some(cleanup) = &self.cleanup {
            cleanup(&item);
        }
        self.events.publish(SchedulerEvent::ItemRemoved { item_id: id });
        tracing::debug!(item_id = %id, "Removed item");
        Ok(())
    }

    /// Cancel everything and delete all items, invoking the cleanup hook
    /// once per item in submission order.
    pub fn clear(&self) {
        for (_, token) in self.tokens_lock().drain() {
            token.cancel();
        }
        let removed: Vec<BatchItem<T>> = {
            let mut table = table_write(&self.table);
            let order = std::mem::take(&mut table.order);
            let mut items = std::mem::take(&mut table.items);
            order.into_iter().filter_map(|id| items.remove(&id)).collect()
        };
        for item in &removed {
            if let Some(cleanup) = &self.cleanup {
                cleanup(item);
            }
            self.events.publish(SchedulerEvent::ItemRemoved { item_id: item.id });
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Cleared all items");
        }
    }

    // ---- observers ----

    /// Snapshot every item in submission order.
    pub fn views(&self) -> Vec<ItemView> {
        let table = table_read(&self.table);
        table
            .order
            .iter()
            .filter_map(|id| table.items.get(id).map(BatchItem::view))
            .collect()
    }

    /// Snapshot one item.
    pub fn view(&self, id: ItemId) -> Option<ItemView> {
        table_read(&self.table).items.get(&id).map(BatchItem::view)
    }

    /// Clone one item's payload (including any merged result).
    pub fn item_data(&self, id: ItemId) -> Option<T> {
        table_read(&self.table)
            .items
            .get(&id)
            .map(|item| item.data.clone())
    }

    /// Per-status totals.
    pub fn counts(&self) -> BatchCounts {
        let table = table_read(&self.table);
        let mut counts = BatchCounts {
            total: table.items.len(),
            ..BatchCounts::default()
        };
        for item in table.items.values() {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Done => counts.done += 1,
                ItemStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Whether any scheduling run is currently in flight.
    pub fn is_processing(&self) -> bool {
        self.active_runs.load(Ordering::SeqCst) > 0
    }

    pub fn len(&self) -> usize {
        table_read(&self.table).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    // ---- run internals ----

    /// Drive an explicit id list through the wave loop.
    async fn run_ids(&self, ids: Vec<ItemId>) {
        if ids.is_empty() {
            return;
        }
        let batch_token = self.batch_lock().clone();
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        self.events.publish(SchedulerEvent::RunStarted {
            selected: ids.len(),
        });
        tracing::info!(
            selected = ids.len(),
            max_concurrency = self.max_concurrency,
            "Starting run",
        );

        for wave in partition_waves(&ids, self.max_concurrency) {
            if batch_token.is_cancelled() {
                tracing::info!("Batch cancelled, skipping remaining waves");
                break;
            }
            join_all(wave.into_iter().map(|id| self.run_item(id, &batch_token))).await;
        }

        self.active_runs.fetch_sub(1, Ordering::SeqCst);
        self.events.publish(SchedulerEvent::RunSettled);
    }

    /// Run one item to settlement, racing the work against cancellation.
    async fn run_item(&self, id: ItemId, batch_token: &CancellationToken) {
        let Some((data, token)) = self.begin_item(id, batch_token) else {
            return;
        };

        let ctx = self.work_context(id, token.clone());
        let work = self.worker.process(id, data, &ctx);
        let outcome = tokio::select! {
            biased;
            result = work => result,
            () = token.cancelled() => Err(WorkError::Cancelled),
        };

        self.settle_item(id, outcome);
    }

    /// Transition an item into `processing` and register its token.
    ///
    /// Returns `None` when the item is missing or not in a runnable state,
    /// which is how a double-run is prevented.
    fn begin_item(
        &self,
        id: ItemId,
        batch_token: &CancellationToken,
    ) -> Option<(T, CancellationToken)> {
        let data = {
            let mut table = table_write(&self.table);
            let item = table.items.get_mut(&id)?;
            if item.status == ItemStatus::Error {
                // run_all re-runs failed items; route through pending so the
                // old error is cleared by a legal transition.
                item.mark_pending();
            }
            if !item_state_machine::can_transition(item.status, ItemStatus::Processing) {
                tracing::debug!(
                    item_id = %id,
                    status = item.status.label(),
                    "Item not runnable, skipped",
                );
                return None;
            }
            item.mark_processing();
            item.data.clone()
        };

        let token = batch_token.child_token();
        self.tokens_lock().insert(id, token.clone());
        self.events.publish(SchedulerEvent::ItemStarted { item_id: id });
        tracing::debug!(item_id = %id, "Item processing");
        Some((data, token))
    }

    /// Record a run's outcome and discard its token.
    ///
    /// An item removed mid-flight is simply gone; nothing is recorded.
    fn settle_item(&self, id: ItemId, outcome: Result<T::Update, WorkError>) {
        self.tokens_lock().remove(&id);
        let mut table = table_write(&self.table);
        let Some(item) = table.items.get_mut(&id) else {
            return;
        };
        match outcome {
            Ok(update) => {
                item.data.apply_update(update);
                item.mark_done();
                self.events.publish(SchedulerEvent::ItemCompleted { item_id: id });
                tracing::debug!(item_id = %id, "Item done");
            }
            Err(WorkError::Cancelled) => {
                item.mark_pending();
                self.events.publish(SchedulerEvent::ItemCancelled { item_id: id });
                tracing::debug!(item_id = %id, "Item cancelled back to pending");
            }
            Err(WorkError::Failed(error)) => {
                item.mark_error(error.clone());
                self.events.publish(SchedulerEvent::ItemFailed { item_id: id, error: error.clone() });
                tracing::warn!(item_id = %id, error = %error, "Item failed");
            }
        }
    }

    /// Build the per-run context whose report sinks write back into the
    /// item, ignoring reports that arrive after the item left `processing`.
    fn work_context(&self, id: ItemId, token: CancellationToken) -> WorkContext {
        let on_progress = {
            let table = Arc::clone(&self.table);
            let events = Arc::clone(&self.events);
            Arc::new(move |percent: i16| {
                let percent = clamp_percent(percent);
                let mut table = table_write(&table);
                if let Some(item) = table.items.get_mut(&id) {
                    if item.status == ItemStatus::Processing {
                        item.progress = percent;
                        item.touch();
                        events.publish(SchedulerEvent::ItemProgress {
                            item_id: id,
                            percent,
                        });
                    }
                }
            }) as Arc<dyn Fn(i16) + Send + Sync>
        };

        let on_stage = {
            let table = Arc::clone(&self.table);
            let events = Arc::clone(&self.events);
            Arc::new(move |stage: String| {
                let mut table = table_write(&table);
                if let Some(item) = table.items.get_mut(&id) {
                    if item.status == ItemStatus::Processing {
                        item.stage = stage.clone();
                        item.touch();
                        events.publish(SchedulerEvent::ItemStage { item_id: id, stage });
                    }
                }
            }) as Arc<dyn Fn(String) + Send + Sync>
        };

        WorkContext::new(token, on_progress, on_stage)
    }

    // ---- small helpers ----

    fn select_ids(&self, predicate: impl Fn(&BatchItem<T>) -> bool) -> Vec<ItemId> {
        let table = table_read(&self.table);
        table
            .order
            .iter()
            .copied()
            .filter(|id| table.items.get(id).is_some_and(|item| predicate(item)))
            .collect()
    }

    fn contains(&self, id: ItemId) -> bool {
        table_read(&self.table).items.contains_key(&id)
    }

    fn tokens_lock(&self) -> MutexGuard<'_, HashMap<ItemId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn batch_lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.batch_token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
