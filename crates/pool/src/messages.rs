//! Typed protocol between the async side and execution context threads.
//!
//! Requests flow into a context over its request channel; replies flow
//! back over its reply channel. Every task-scoped reply echoes the
//! [`CallId`] of the request it answers so the bridge can correlate
//! out-of-order traffic without trusting reply arrival order.

/// Identifier for one request/reply exchange with a context.
///
/// Allocated by the bridge, starting at 1 and strictly increasing.
/// Never reused within a context's lifetime.
pub type CallId = u64;

/// A request sent into an execution context.
#[derive(Debug)]
pub enum ContextRequest<P> {
    /// Run one task. The context answers with [`ContextReply::Done`] or
    /// [`ContextReply::TaskError`] carrying the same id, interleaved with
    /// any number of [`ContextReply::Progress`] replies.
    Call { id: CallId, payload: P },

    /// Stop the context thread after the task currently in flight.
    Shutdown,
}

/// A reply sent out of an execution context.
#[derive(Debug)]
pub enum ContextReply<R> {
    /// Initialization succeeded; the context is accepting calls.
    Ready,

    /// Initialization failed; the context thread is about to exit.
    InitFailed { error: String },

    /// Progress report for an in-flight call. Not a settlement: the call
    /// stays pending.
    Progress { id: CallId, percent: i16 },

    /// Successful settlement for a call.
    Done { id: CallId, result: R },

    /// Failed settlement for a call. The context itself stays usable.
    TaskError { id: CallId, error: String },
}

impl<R> ContextReply<R> {
    /// The call this reply belongs to (`None` for handshake replies).
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            ContextReply::Progress { id, .. }
            | ContextReply::Done { id, .. }
            | ContextReply::TaskError { id, .. } => Some(*id),
            ContextReply::Ready | ContextReply::InitFailed { .. } => None,
        }
    }

    /// Short name for log fields.
    pub fn label(&self) -> &'static str {
        match self {
            ContextReply::Ready => "ready",
            ContextReply::InitFailed { .. } => "init_failed",
            ContextReply::Progress { .. } => "progress",
            ContextReply::Done { .. } => "done",
            ContextReply::TaskError { .. } => "task_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_replies_have_no_call_id() {
        assert_eq!(ContextReply::<()>::Ready.call_id(), None);
        assert_eq!(
            ContextReply::<()>::InitFailed {
                error: "no model".into()
            }
            .call_id(),
            None
        );
    }

    #[test]
    fn task_replies_echo_their_call_id() {
        let done = ContextReply::Done { id: 7, result: 42 };
        assert_eq!(done.call_id(), Some(7));

        let err = ContextReply::<i32>::TaskError {
            id: 9,
            error: "oom".into(),
        };
        assert_eq!(err.call_id(), Some(9));

        let progress = ContextReply::<i32>::Progress { id: 3, percent: 50 };
        assert_eq!(progress.call_id(), Some(3));
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(ContextReply::<i32>::Ready.label(), "ready");
        assert_eq!(
            ContextReply::<i32>::Progress { id: 1, percent: 0 }.label(),
            "progress"
        );
        assert_eq!(ContextReply::Done { id: 1, result: 0 }.label(), "done");
    }
}
