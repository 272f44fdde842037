//! Execution context pool with FIFO dispatch and crash eviction.
//!
//! [`ContextPool`] owns up to `max_contexts` execution contexts, created
//! lazily as load arrives. Tasks queue in FIFO order and are dispatched
//! to an idle context as soon as one is available; a context that
//! crashes is evicted permanently and its task fails, while the rest of
//! the pool keeps draining the queue.
//!
//! Task bookkeeping ([`TaskInfo`]) and [`PoolEvent`]s give observers a
//! live view without coupling them to callers.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use pixelmill_core::concurrency::default_pool_size;
use pixelmill_core::status::TaskStatus;
use pixelmill_core::types::{TaskId, Timestamp};
use pixelmill_events::EventBus;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};

use crate::bridge::{CallError, ContextBridge, ProgressFn};
use crate::context::ContextId;
use crate::events::PoolEvent;
use crate::handler::TaskHandler;

/// Broadcast channel capacity for pool events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bookkeeping for one task, kept from enqueue until [`ContextPool::terminate`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Latest reported progress percentage (0-100).
    pub progress: i16,
    /// Failure description once `status` is [`TaskStatus::Error`].
    pub error: Option<String>,
    /// The context the task ran on, once dispatched.
    pub context_id: Option<ContextId>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

/// A task waiting in the FIFO queue.
struct QueuedTask<P, R> {
    task_id: TaskId,
    payload: P,
    reply_tx: oneshot::Sender<Result<R, PoolError>>,
    on_progress: Option<ProgressFn>,
}

/// A context currently owned by the pool.
struct ManagedContext<P, R> {
    id: ContextId,
    bridge: Arc<ContextBridge<P, R>>,
    busy: bool,
}

/// Contexts and queue, guarded together so acquire/enqueue stay atomic.
struct PoolState<P, R> {
    contexts: Vec<ManagedContext<P, R>>,
    queue: VecDeque<QueuedTask<P, R>>,
}

/// Pool of isolated execution contexts for one handler type.
///
/// Constructed via [`ContextPool::new`], which returns an `Arc` that is
/// cheap to clone into whatever drives the pool.
pub struct ContextPool<H: TaskHandler> {
    factory: Box<dyn Fn() -> H + Send + Sync>,
    max_contexts: usize,
    state: Mutex<PoolState<H::Payload, H::Output>>,
    tasks: RwLock<HashMap<TaskId, TaskInfo>>,
    events: EventBus<PoolEvent>,
    next_context_id: AtomicU64,
}

impl<H: TaskHandler> ContextPool<H> {
    /// Create a pool with the default size (`min(hardware, 8)`).
    ///
    /// `factory` builds one handler per context; it runs on the caller's
    /// thread, heavy setup belongs in [`TaskHandler::init`].
    pub fn new(factory: impl Fn() -> H + Send + Sync + 'static) -> Arc<Self> {
        Self::with_max_contexts(factory, default_pool_size())
    }

    /// Create a pool with an explicit context limit (clamped to at least 1).
    pub fn with_max_contexts(
        factory: impl Fn() -> H + Send + Sync + 'static,
        max_contexts: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory: Box::new(factory),
            max_contexts: max_contexts.max(1),
            state: Mutex::new(PoolState {
                contexts: Vec::new(),
                queue: VecDeque::new(),
            }),
            tasks: RwLock::new(HashMap::new()),
            events: EventBus::new(EVENT_CHANNEL_CAPACITY),
            next_context_id: AtomicU64::new(0),
        })
    }

    /// Subscribe to pool-level events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Run one task on the pool and await its result.
    pub async fn execute(self: &Arc<Self>, payload: H::Payload) -> Result<H::Output, PoolError> {
        self.execute_with_progress(payload, None).await
    }

    /// Run one task, forwarding its progress reports to `on_progress`.
    pub async fn execute_with_progress(
        self: &Arc<Self>,
        payload: H::Payload,
        on_progress: Option<ProgressFn>,
    ) -> Result<H::Output, PoolError> {
        let task_id = uuid::Uuid::new_v4();
        self.tasks_write().insert(
            task_id,
            TaskInfo {
                task_id,
                status: TaskStatus::Queued,
                progress: 0,
                error: None,
                context_id: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );
        self.events.publish(PoolEvent::TaskQueued { task_id });

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.queue.push_back(QueuedTask {
                task_id,
                payload,
                reply_tx,
                on_progress,
            });
        }
        self.pump_queue().await;

        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::Terminated),
        }
    }

    /// Run a batch of payloads, settling each independently.
    ///
    /// Results come back in payload order. One failed task does not stop
    /// the others.
    pub async fn execute_batch(
        self: &Arc<Self>,
        payloads: Vec<H::Payload>,
    ) -> Vec<Result<H::Output, PoolError>> {
        let calls = payloads.into_iter().map(|payload| {
            let pool = Arc::clone(self);
            async move { pool.execute(payload).await }
        });
        futures::future::join_all(calls).await
    }

    /// Stop every context and reject everything still queued.
    ///
    /// Already dispatched tasks settle with [`PoolError::Terminated`];
    /// task bookkeeping is cleared. The pool itself stays usable — the
    /// next task lazily spawns fresh contexts.
    pub async fn terminate(&self) {
        tracing::info!("Terminating context pool");
        let (contexts, queued) = {
            let mut state = self.state.lock().await;
            (
                std::mem::take(&mut state.contexts),
                std::mem::take(&mut state.queue),
            )
        };

        for managed in &contexts {
            managed.bridge.terminate().await;
        }
        for task in queued {
            tracing::debug!(task_id = %task.task_id, "Rejecting queued task");
            let _ = task.reply_tx.send(Err(PoolError::Terminated));
        }

        self.tasks_write().clear();
        self.events.publish(PoolEvent::PoolTerminated);
    }

    // ---- observers ----

    /// Snapshot of one task's bookkeeping.
    pub fn task_info(&self, task_id: TaskId) -> Option<TaskInfo> {
        self.tasks_read().get(&task_id).cloned()
    }

    /// Snapshot of every tracked task.
    pub fn all_tasks(&self) -> Vec<TaskInfo> {
        self.tasks_read().values().cloned().collect()
    }

    /// Number of contexts currently running a task.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.contexts.iter().filter(|c| c.busy).count()
    }

    /// Number of tasks waiting for a context.
    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Number of live contexts (busy or idle).
    pub async fn context_count(&self) -> usize {
        self.state.lock().await.contexts.len()
    }

    /// Upper bound on live contexts.
    pub fn max_contexts(&self) -> usize {
        self.max_contexts
    }

    // ---- dispatch internals ----

    /// Drain the queue onto idle contexts, creating new ones lazily.
    ///
    /// Stops when the queue is empty or every context slot is busy.
    /// Boxed because `run_task` awaits it recursively after settling.
    fn pump_queue(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                let action = {
                    let mut state = self.state.lock().await;
                    let Some(task) = state.queue.pop_front() else {
                        return;
                    };
                    match self.try_acquire(&mut state) {
                        Ok(Some((context_id, bridge))) => Ok((context_id, bridge, task)),
                        Ok(None) => {
                            // At capacity with every context busy; the task
                            // keeps its place at the head of the queue.
                            state.queue.push_front(task);
                            return;
                        }
                        Err(error) => Err((task, error)),
                    }
                };

                match action {
                    Ok((context_id, bridge, task)) => {
                        let pool = Arc::clone(self);
                        tokio::spawn(async move {
                            pool.run_task(context_id, bridge, task).await;
                        });
                    }
                    Err((task, error)) => {
                        tracing::error!(error = %error, "Failed to spawn execution context");
                        self.settle_failed(task, PoolError::ContextSpawn(error.to_string()));
                    }
                }
            }
        })
    }

    /// Find an idle context, or create one if below the limit.
    ///
    /// The returned context is already marked busy.
    #[allow(clippy::type_complexity)]
    fn try_acquire(
        &self,
        state: &mut PoolState<H::Payload, H::Output>,
    ) -> std::io::Result<Option<(ContextId, Arc<ContextBridge<H::Payload, H::Output>>)>> {
        if let Some(managed) = state.contexts.iter_mut().find(|c| !c.busy) {
            managed.busy = true;
            return Ok(Some((managed.id, Arc::clone(&managed.bridge))));
        }

        if state.contexts.len() < self.max_contexts {
            let id = self.next_context_id.fetch_add(1, Ordering::Relaxed) + 1;
            let bridge = Arc::new(ContextBridge::start(id, (self.factory)())?);
            state.contexts.push(ManagedContext {
                id,
                bridge: Arc::clone(&bridge),
                busy: true,
            });
            tracing::info!(
                context_id = id,
                pool_size = state.contexts.len(),
                "Spawned execution context",
            );
            self.events.publish(PoolEvent::ContextSpawned { context_id: id });
            return Ok(Some((id, bridge)));
        }

        Ok(None)
    }

    /// Run one dispatched task to settlement, then keep the queue moving.
    async fn run_task(
        self: &Arc<Self>,
        context_id: ContextId,
        bridge: Arc<ContextBridge<H::Payload, H::Output>>,
        task: QueuedTask<H::Payload, H::Output>,
    ) {
        let QueuedTask {
            task_id,
            payload,
            reply_tx,
            on_progress,
        } = task;

        self.update_task(task_id, |info| {
            info.status = TaskStatus::Processing;
            info.context_id = Some(context_id);
            info.started_at = Some(Utc::now());
        });
        self.events.publish(PoolEvent::TaskStarted {
            task_id,
            context_id,
        });
        tracing::debug!(task_id = %task_id, context_id, "Dispatching task");

        let observer: ProgressFn = {
            let pool = Arc::clone(self);
            Arc::new(move |percent: i16| {
                pool.record_progress(task_id, percent);
                if let Some(user) = &on_progress {
                    user(percent);
                }
            })
        };

        // Release or evict the context before settling the caller, so the
        // slot is already free when `execute` returns.
        match bridge.call_with_progress(payload, Some(observer)).await {
            Ok(result) => {
                self.update_task(task_id, |info| {
                    info.status = TaskStatus::Complete;
                    info.progress = 100;
                    info.completed_at = Some(Utc::now());
                });
                self.events.publish(PoolEvent::TaskCompleted {
                    task_id,
                    context_id,
                });
                self.release_context(context_id).await;
                let _ = reply_tx.send(Ok(result));
            }
            Err(CallError::Task(error)) => {
                self.update_task(task_id, |info| {
                    info.status = TaskStatus::Error;
                    info.error = Some(error.clone());
                    info.completed_at = Some(Utc::now());
                });
                self.events.publish(PoolEvent::TaskFailed {
                    task_id,
                    error: error.clone(),
                });
                // Handler-level errors leave the context healthy.
                self.release_context(context_id).await;
                let _ = reply_tx.send(Err(PoolError::Task(error)));
            }
            Err(CallError::Crashed) => {
                tracing::warn!(task_id = %task_id, context_id, "Execution context crashed");
                self.update_task(task_id, |info| {
                    info.status = TaskStatus::Error;
                    info.error = Some("Execution context crashed".to_string());
                    info.completed_at = Some(Utc::now());
                });
                self.events.publish(PoolEvent::ContextCrashed { context_id });
                self.events.publish(PoolEvent::TaskFailed {
                    task_id,
                    error: "Execution context crashed".to_string(),
                });
                self.evict_context(context_id).await;
                let _ = reply_tx.send(Err(PoolError::ContextCrashed));
            }
            Err(CallError::InitFailed(error)) => {
                self.update_task(task_id, |info| {
                    info.status = TaskStatus::Error;
                    info.error = Some(error.clone());
                    info.completed_at = Some(Utc::now());
                });
                self.events.publish(PoolEvent::ContextInitFailed {
                    context_id,
                    error: error.clone(),
                });
                self.events.publish(PoolEvent::TaskFailed {
                    task_id,
                    error: error.clone(),
                });
                self.evict_context(context_id).await;
                let _ = reply_tx.send(Err(PoolError::InitFailed(error)));
            }
            Err(CallError::Terminated) => {
                // terminate() already tore the context list down and
                // cleared bookkeeping; just settle the caller.
                let _ = reply_tx.send(Err(PoolError::Terminated));
            }
        }

        self.pump_queue().await;
    }

    /// Mark a context idle again.
    async fn release_context(&self, context_id: ContextId) {
        let mut state = self.state.lock().await;
        if let Some(managed) = state.contexts.iter_mut().find(|c| c.id == context_id) {
            managed.busy = false;
        }
    }

    /// Remove a dead context. It is never reused.
    async fn evict_context(&self, context_id: ContextId) {
        let mut state = self.state.lock().await;
        state.contexts.retain(|c| c.id != context_id);
        tracing::warn!(
            context_id,
            pool_size = state.contexts.len(),
            "Evicted execution context",
        );
    }

    /// Fail a task that never reached a context.
    fn settle_failed(&self, task: QueuedTask<H::Payload, H::Output>, error: PoolError) {
        let message = error.to_string();
        self.update_task(task.task_id, |info| {
            info.status = TaskStatus::Error;
            info.error = Some(message.clone());
            info.completed_at = Some(Utc::now());
        });
        self.events.publish(PoolEvent::TaskFailed {
            task_id: task.task_id,
            error: message,
        });
        let _ = task.reply_tx.send(Err(error));
    }

    /// Record a progress report (bookkeeping + event fan-out).
    fn record_progress(&self, task_id: TaskId, percent: i16) {
        self.update_task(task_id, |info| info.progress = percent);
        self.events.publish(PoolEvent::TaskProgress { task_id, percent });
    }

    fn update_task(&self, task_id: TaskId, apply: impl FnOnce(&mut TaskInfo)) {
        if let Some(info) = self.tasks_write().get_mut(&task_id) {
            apply(info);
        }
    }

    // Poison only means a panicked writer; the map itself stays valid.
    fn tasks_read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskInfo>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskInfo>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Errors surfaced to pool callers.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The handler reported a task-level failure.
    #[error("Task failed: {0}")]
    Task(String),

    /// The context running this task died before settling it.
    #[error("Execution context crashed")]
    ContextCrashed,

    /// The context's init hook failed before the task could run.
    #[error("Context initialization failed: {0}")]
    InitFailed(String),

    /// The OS refused to spawn a context thread.
    #[error("Failed to spawn execution context: {0}")]
    ContextSpawn(String),

    /// The pool was terminated while this task was queued or running.
    #[error("Pool terminated")]
    Terminated,
}
