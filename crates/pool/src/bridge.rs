//! Call correlation bridge for a single execution context.
//!
//! [`ContextBridge`] owns a context's channels and matches replies back
//! to awaiting callers by [`CallId`]. Callers never see the channels:
//! they get a future per call that resolves when the matching settlement
//! arrives, regardless of arrival order.
//!
//! The bridge also owns the ready handshake. All callers await the same
//! handshake state, so concurrent first calls collapse into one
//! initialization instead of racing. A failed handshake latches the
//! bridge: every later call fails fast with the original error, and the
//! owner decides whether to build a replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};

use crate::context::{spawn_context, ContextId};
use crate::handler::TaskHandler;
use crate::messages::{CallId, ContextReply, ContextRequest};

/// Caller-side progress observer for one call.
///
/// Invoked on the bridge's router task, so it must not block.
pub type ProgressFn = Arc<dyn Fn(i16) + Send + Sync>;

/// Handshake state published by the router task.
#[derive(Debug, Clone)]
enum Handshake {
    Pending,
    Ready,
    Failed(String),
}

/// A call waiting for its settlement.
struct PendingCall<R> {
    reply_tx: oneshot::Sender<Result<R, CallError>>,
    on_progress: Option<ProgressFn>,
}

type PendingMap<R> = Arc<Mutex<HashMap<CallId, PendingCall<R>>>>;

/// Correlation bridge to one execution context.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct ContextBridge<P, R> {
    context_id: ContextId,
    requests: mpsc::Sender<ContextRequest<P>>,
    next_call_id: AtomicU64,
    pending: PendingMap<R>,
    handshake: watch::Receiver<Handshake>,
    /// Set by [`terminate`](Self::terminate) before the shutdown request,
    /// so the router can tell a clean stop from a crash.
    terminated: Arc<AtomicBool>,
    /// Set by the router when the reply stream ends without a terminate.
    crashed: Arc<AtomicBool>,
    router: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<P, R> ContextBridge<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Spawn a context for `handler` and start routing its replies.
    ///
    /// The context initializes in the background; calls made before the
    /// handshake completes simply wait for it.
    pub fn start<H>(context_id: ContextId, handler: H) -> std::io::Result<Self>
    where
        H: TaskHandler<Payload = P, Output = R>,
    {
        let channels = spawn_context(context_id, handler)?;
        let (handshake_tx, handshake_rx) = watch::channel(Handshake::Pending);
        let pending: PendingMap<R> = Arc::new(Mutex::new(HashMap::new()));
        let terminated = Arc::new(AtomicBool::new(false));
        let crashed = Arc::new(AtomicBool::new(false));

        let router = tokio::spawn(run_router(
            context_id,
            channels.replies,
            Arc::clone(&pending),
            handshake_tx,
            Arc::clone(&terminated),
            Arc::clone(&crashed),
        ));

        Ok(Self {
            context_id,
            requests: channels.requests,
            next_call_id: AtomicU64::new(0),
            pending,
            handshake: handshake_rx,
            terminated,
            crashed,
            router: Mutex::new(Some(router)),
        })
    }

    /// The id of the context this bridge talks to.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Whether the context thread died without a terminate.
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Number of calls currently awaiting settlement.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Run one task on the context and await its result.
    pub async fn call(&self, payload: P) -> Result<R, CallError> {
        self.call_with_progress(payload, None).await
    }

    /// Run one task, forwarding its progress reports to `on_progress`.
    pub async fn call_with_progress(
        &self,
        payload: P,
        on_progress: Option<ProgressFn>,
    ) -> Result<R, CallError> {
        self.await_ready().await?;

        if self.terminated.load(Ordering::SeqCst) {
            return Err(CallError::Terminated);
        }
        if self.crashed.load(Ordering::SeqCst) {
            return Err(CallError::Crashed);
        }

        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingCall {
                reply_tx,
                on_progress,
            },
        );

        if self
            .requests
            .send(ContextRequest::Call { id, payload })
            .is_err()
        {
            // The thread is already gone; take our entry back out in case
            // the router swept before we inserted it.
            self.pending.lock().await.remove(&id);
            return Err(CallError::Crashed);
        }

        match reply_rx.await {
            Ok(outcome) => outcome,
            // The sweep settles every removed entry, so a dropped sender
            // means the router task itself died.
            Err(_) => Err(CallError::Crashed),
        }
    }

    /// Stop the context and settle everything that is still pending.
    ///
    /// Pending calls are rejected with [`CallError::Terminated`]
    /// immediately; the context thread finishes its current task (late
    /// replies are dropped) and exits. Waits up to 5 seconds for the
    /// router to drain.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(context_id = self.context_id, "Terminating context");

        let _ = self.requests.send(ContextRequest::Shutdown);
        reject_all(&self.pending, self.context_id, false).await;

        if let Some(router) = self.router.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), router).await;
        }
    }

    /// Wait for the ready handshake, failing fast once it has failed.
    async fn await_ready(&self) -> Result<(), CallError> {
        let mut handshake = self.handshake.clone();
        // Clone out of the watch ref so the borrow ends with this statement.
        let state = match handshake
            .wait_for(|state| !matches!(state, Handshake::Pending))
            .await
        {
            Ok(state) => (*state).clone(),
            // Watch sender dropped while still pending: router died.
            Err(_) => return Err(CallError::Crashed),
        };
        match state {
            Handshake::Ready => Ok(()),
            Handshake::Failed(error) => Err(CallError::InitFailed(error)),
            Handshake::Pending => Err(CallError::Crashed),
        }
    }
}

/// Consume context replies, settling pending calls by id.
///
/// Runs until the reply stream ends, then sweeps the pending table once:
/// with `Terminated` after a clean shutdown, with `Crashed` otherwise.
async fn run_router<R>(
    context_id: ContextId,
    mut replies: tokio::sync::mpsc::UnboundedReceiver<ContextReply<R>>,
    pending: PendingMap<R>,
    handshake_tx: watch::Sender<Handshake>,
    terminated: Arc<AtomicBool>,
    crashed: Arc<AtomicBool>,
) {
    while let Some(reply) = replies.recv().await {
        tracing::trace!(
            context_id,
            reply = reply.label(),
            call_id = reply.call_id(),
            "Context reply",
        );
        match reply {
            ContextReply::Ready => {
                tracing::debug!(context_id, "Context handshake complete");
                let _ = handshake_tx.send(Handshake::Ready);
            }
            ContextReply::InitFailed { error } => {
                tracing::warn!(context_id, error = %error, "Context handshake failed");
                let _ = handshake_tx.send(Handshake::Failed(error));
            }
            ContextReply::Progress { id, percent } => {
                let guard = pending.lock().await;
                match guard.get(&id) {
                    Some(call) => {
                        if let Some(observer) = &call.on_progress {
                            observer(percent);
                        }
                    }
                    None => {
                        tracing::debug!(
                            context_id,
                            call_id = id,
                            "Progress for unknown call dropped",
                        );
                    }
                }
            }
            ContextReply::Done { id, result } => {
                settle(&pending, context_id, id, Ok(result)).await;
            }
            ContextReply::TaskError { id, error } => {
                settle(&pending, context_id, id, Err(CallError::Task(error))).await;
            }
        }
    }

    // Reply stream closed: clean shutdown or crash.
    let was_terminated = terminated.load(Ordering::SeqCst);
    if !was_terminated {
        crashed.store(true, Ordering::SeqCst);
        tracing::warn!(context_id, "Context reply stream closed unexpectedly");
    }

    // A thread that panicked during init never sent a handshake reply.
    handshake_tx.send_if_modified(|state| {
        if matches!(state, Handshake::Pending) {
            *state = Handshake::Failed("Context exited during initialization".to_string());
            true
        } else {
            false
        }
    });

    reject_all(&pending, context_id, !was_terminated).await;
}

/// Resolve one pending call. Replies for unknown ids are dropped.
async fn settle<R>(
    pending: &PendingMap<R>,
    context_id: ContextId,
    id: CallId,
    outcome: Result<R, CallError>,
) {
    let call = pending.lock().await.remove(&id);
    match call {
        Some(call) => {
            // The caller may have gone away; nothing left to do then.
            let _ = call.reply_tx.send(outcome);
        }
        None => {
            tracing::debug!(context_id, call_id = id, "Settlement for unknown call dropped");
        }
    }
}

/// Drain the pending table and reject every entry exactly once.
async fn reject_all<R>(pending: &PendingMap<R>, context_id: ContextId, crashed: bool) {
    let drained: Vec<PendingCall<R>> = {
        let mut guard = pending.lock().await;
        guard.drain().map(|(_, call)| call).collect()
    };

    if drained.is_empty() {
        return;
    }
    tracing::warn!(
        context_id,
        count = drained.len(),
        crashed,
        "Rejecting all pending calls",
    );

    for call in drained {
        let error = if crashed {
            CallError::Crashed
        } else {
            CallError::Terminated
        };
        let _ = call.reply_tx.send(Err(error));
    }
}

/// Errors surfaced to bridge callers.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The context's init hook failed; the bridge is latched.
    #[error("Context initialization failed: {0}")]
    InitFailed(String),

    /// The handler reported a task-level failure. The context survives.
    #[error("Task failed: {0}")]
    Task(String),

    /// The context thread died before settling this call.
    #[error("Execution context crashed")]
    Crashed,

    /// The bridge was terminated while this call was pending.
    #[error("Execution context terminated")]
    Terminated,
}
