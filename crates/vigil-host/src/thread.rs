//! Host threads.
//!
//! Each managed thread runs on its own OS thread with a fresh
//! [`ExecutionContext`]. `thread_begin` and `thread_end` fire on the new
//! context exactly once each, also when the body raises.

use std::fmt;
use std::thread::JoinHandle;

use tracing::{debug, info};

use vigil_core::{ContextId, EventKind, Exception, Value};
use vigil_hook::{Activation, ActivationKind, ExecutionContext, Locals, Tracer};

use crate::control::{settle, Flow};
use crate::error::{HostError, HostResult};

/// Start a managed thread running `body`.
///
/// The new thread inherits the caller's tracer and receiver.
pub fn spawn_thread<F>(cx: &ExecutionContext, body: F) -> HostResult<ThreadHandle>
where
    F: FnOnce(&mut ExecutionContext) -> Flow + Send + 'static,
{
    let tracer = cx.tracer().clone();
    let id = ContextId::next();
    let (path, line) = cx
        .current()
        .map_or((None, 0), |a| (a.path.clone(), a.line));
    let receiver = cx
        .current()
        .map(|a| a.receiver.clone())
        .unwrap_or_default();

    let handle = std::thread::Builder::new()
        .name(format!("vigil-{id}"))
        .spawn(move || {
            let mut cx = ExecutionContext::for_thread(tracer.clone(), id);
            let top = Activation::new(ActivationKind::Top, receiver)
                .at_path(path, line)
                .with_locals(Locals::new());
            let tag = top.tag;
            cx.push(top.unwinds_to(Some(tag), None));
            debug!(context = %id, "Thread started");

            let begin = cx.emit_thread(EventKind::ThreadBegin);
            let outcome = match begin {
                Ok(()) => settle(body(&mut cx)),
                Err(exception) => Err(exception),
            };
            let end = cx.emit_thread(EventKind::ThreadEnd);
            cx.pop();
            tracer.release_thread(id);
            debug!(context = %id, ok = outcome.is_ok(), "Thread finished");
            match end {
                Ok(()) => outcome,
                Err(exception) => Err(exception),
            }
        })?;

    info!(context = %id, "Spawned thread");
    Ok(ThreadHandle {
        id,
        handle,
        tracer: cx.tracer().clone(),
    })
}

/// Handle to a running managed thread.
pub struct ThreadHandle {
    id: ContextId,
    handle: JoinHandle<Result<Value, Exception>>,
    tracer: Tracer,
}

impl ThreadHandle {
    /// Context identity of the thread.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The thread as a value.
    pub fn to_value(&self) -> Value {
        Value::Thread(self.id)
    }

    /// Whether the thread has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and return the value or exception its body ended with.
    ///
    /// Joining from inside a callback lets the thread's own callbacks run
    /// meanwhile.
    pub fn join(self) -> HostResult<Result<Value, Exception>> {
        let Self { id, handle, tracer } = self;
        tracer
            .blocking(|| handle.join())
            .map_err(|_| HostError::ThreadPanicked(id))
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
