//! Execution context: a dedicated OS thread running a task handler.
//!
//! The context is the crash-isolation unit. Handler code runs on its own
//! thread and talks to the async side exclusively through channels, so a
//! panic in the handler tears down that thread alone. The reply channel
//! closing without a `Shutdown` request is how the rest of the system
//! learns about a crash.

use std::sync::mpsc;

use pixelmill_core::progress::clamp_percent;
use tokio::sync::mpsc as async_mpsc;

use crate::handler::TaskHandler;
use crate::messages::{ContextReply, ContextRequest};

/// Identifier for a context within its pool. Never reused.
pub type ContextId = u64;

/// Channel endpoints for one spawned context.
///
/// `requests` accepts work from any thread; `replies` is consumed by the
/// bridge's router task. When the context thread exits (cleanly or by
/// panic) the reply stream ends.
pub struct ContextChannels<P, R> {
    pub requests: mpsc::Sender<ContextRequest<P>>,
    pub replies: async_mpsc::UnboundedReceiver<ContextReply<R>>,
}

/// Spawn a context thread running `handler`.
///
/// The thread performs the ready handshake (`init` then `Ready`, or
/// `InitFailed` and exit), then serves calls one at a time until it
/// receives `Shutdown` or the request sender is dropped.
pub fn spawn_context<H: TaskHandler>(
    id: ContextId,
    handler: H,
) -> std::io::Result<ContextChannels<H::Payload, H::Output>> {
    let (req_tx, req_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = async_mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name(format!("pixelmill-context-{id}"))
        .spawn(move || run_context_loop(id, handler, req_rx, reply_tx))?;

    Ok(ContextChannels {
        requests: req_tx,
        replies: reply_rx,
    })
}

/// Body of the context thread: handshake, then serve calls serially.
fn run_context_loop<H: TaskHandler>(
    id: ContextId,
    mut handler: H,
    requests: mpsc::Receiver<ContextRequest<H::Payload>>,
    replies: async_mpsc::UnboundedSender<ContextReply<H::Output>>,
) {
    if let Err(error) = handler.init() {
        tracing::warn!(context_id = id, error = %error, "Context initialization failed");
        let _ = replies.send(ContextReply::InitFailed { error });
        return;
    }
    let _ = replies.send(ContextReply::Ready);
    tracing::debug!(context_id = id, "Context ready");

    while let Ok(request) = requests.recv() {
        match request {
            ContextRequest::Call { id: call_id, payload } => {
                let progress_tx = replies.clone();
                let mut report = move |percent: i16| {
                    let _ = progress_tx.send(ContextReply::Progress {
                        id: call_id,
                        percent: clamp_percent(percent),
                    });
                };

                let reply = match handler.handle(payload, &mut report) {
                    Ok(result) => ContextReply::Done {
                        id: call_id,
                        result,
                    },
                    Err(error) => ContextReply::TaskError { id: call_id, error },
                };

                if replies.send(reply).is_err() {
                    // Nobody is listening any more.
                    break;
                }
            }
            ContextRequest::Shutdown => break,
        }
    }

    tracing::debug!(context_id = id, "Context thread exiting");
}
