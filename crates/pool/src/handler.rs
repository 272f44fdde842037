//! Task handler contract for execution contexts.
//!
//! Defines [`TaskHandler`], the trait implemented by the workload that
//! runs inside an execution context (image codecs, model inference, any
//! CPU-heavy routine that must not take the whole process down with it).

/// A workload hosted by an execution context.
///
/// One handler instance is created per context and moved onto the
/// context's dedicated thread, so implementations may hold mutable
/// scratch state without synchronization. A panic in either method kills
/// only that thread; the pool treats the context as crashed, fails the
/// in-flight task, and never reuses the context.
pub trait TaskHandler: Send + 'static {
    /// Task input moved into the context.
    type Payload: Send + 'static;

    /// Task output moved back to the caller.
    type Output: Send + 'static;

    /// One-time setup run before any task (load models, allocate
    /// buffers). An error here fails the ready handshake and the context
    /// is discarded without ever accepting a call.
    fn init(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Process a single task.
    ///
    /// `progress` may be called any number of times with a 0-100
    /// percentage; reports are forwarded to the task's observer and never
    /// settle the call.
    fn handle(
        &mut self,
        payload: Self::Payload,
        progress: &mut dyn FnMut(i16),
    ) -> Result<Self::Output, String>;
}
