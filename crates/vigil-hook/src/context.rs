//! Per-thread execution state and event dispatch.
//!
//! Every host thread (and every fiber) runs on its own [`ExecutionContext`].
//! The context owns the activation stack host engines push and pop, and the
//! stack of callbacks currently running on it. Instrumentation points call
//! one of the `emit*` methods; when at least one enabled session wants the
//! event, the context builds the event's frame data once and hands a fresh
//! [`Frame`] view to each matching callback, newest session first.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use vigil_core::{
    CodeBody, ContextId, DefId, EventKind, Exception, FiberId, FrameTag, Parameter,
    ReentrancyError, SessionId, SourceLoc, Symbol, TraceResult, Value,
};

use crate::frame::{CompiledScript, Frame, FrameData, Locals};
use crate::session::{Hook, TraceSession};
use crate::tracer::Tracer;

#[derive(Clone)]
struct Current {
    id: ContextId,
    levels: DispatchStack,
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

fn install(current: Option<Current>) -> Option<Current> {
    CURRENT_CONTEXT.with(|slot| slot.replace(current))
}

/// Context running on the calling OS thread, if any.
pub fn current_context_id() -> Option<ContextId> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().as_ref().map(|current| current.id))
}

/// Whether `session`'s callback is running on the calling thread outside an
/// allow-reentry region.
pub(crate) fn in_own_callback(session: SessionId) -> bool {
    CURRENT_CONTEXT.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|current| current.levels.suppresses(session))
    })
}

/// What kind of code an activation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Top-level script or thread body.
    Top,
    /// A method defined in the managed language.
    Method,
    /// A block, proc or lambda body.
    Block,
    /// A natively implemented method.
    Native,
    /// A class or module body.
    Class,
    /// Code compiled at runtime.
    Eval,
}

/// One entry of a context's activation stack.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Kind of code running.
    pub kind: ActivationKind,
    /// Identity of this activation.
    pub tag: FrameTag,
    /// Current source path.
    pub path: Option<Arc<str>>,
    /// Current line.
    pub line: u32,
    /// Original method name.
    pub method_id: Option<Symbol>,
    /// Name the method was invoked under.
    pub callee_id: Option<Symbol>,
    /// Class owning the method.
    pub defined_class: Option<Symbol>,
    /// Receiver.
    pub receiver: Value,
    /// Local variables; `None` for native activations.
    pub locals: Option<Locals>,
    /// Formal parameters.
    pub parameters: Vec<Parameter>,
    /// Method definition the running code belongs to.
    pub owner: Option<DefId>,
    /// Code body being run.
    pub code: Option<Arc<CodeBody>>,
    /// Activation a `return` from here unwinds to.
    pub return_target: Option<FrameTag>,
    /// Activation a `break` from here unwinds to.
    pub break_target: Option<FrameTag>,
}

impl Activation {
    /// A new activation with a fresh tag and no location.
    pub fn new(kind: ActivationKind, receiver: Value) -> Self {
        Self {
            kind,
            tag: FrameTag::next(),
            path: None,
            line: 0,
            method_id: None,
            callee_id: None,
            defined_class: None,
            receiver,
            locals: None,
            parameters: Vec::new(),
            owner: None,
            code: None,
            return_target: None,
            break_target: None,
        }
    }

    /// Set the source position.
    pub fn at(mut self, loc: &SourceLoc) -> Self {
        self.path = Some(loc.shared_path());
        self.line = loc.line();
        self
    }

    /// Set the source position from a shared path.
    pub fn at_path(mut self, path: Option<Arc<str>>, line: u32) -> Self {
        self.path = path;
        self.line = line;
        self
    }

    /// Set method identity.
    pub fn method(
        mut self,
        method_id: Option<Symbol>,
        callee_id: Option<Symbol>,
        defined_class: Option<Symbol>,
    ) -> Self {
        self.method_id = method_id;
        self.callee_id = callee_id;
        self.defined_class = defined_class;
        self
    }

    /// Attach local variable storage.
    pub fn with_locals(mut self, locals: Locals) -> Self {
        self.locals = Some(locals);
        self
    }

    /// Set formal parameters.
    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the owning method definition.
    pub fn owned_by(mut self, owner: Option<DefId>) -> Self {
        self.owner = owner;
        self
    }

    /// Set the code body.
    pub fn with_code(mut self, code: Arc<CodeBody>) -> Self {
        self.code = Some(code);
        self
    }

    /// Set unwind targets for `return` and `break`.
    pub fn unwinds_to(mut self, return_target: Option<FrameTag>, break_target: Option<FrameTag>) -> Self {
        self.return_target = return_target;
        self.break_target = break_target;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct DispatchLevel {
    session: SessionId,
    reentry: bool,
}

/// Callbacks running on one logical thread, innermost last.
///
/// Shared by every fiber of the thread: a fiber resumed from inside a
/// callback still sees that callback as running.
#[derive(Clone, Default)]
pub struct DispatchStack {
    levels: Arc<Mutex<Vec<DispatchLevel>>>,
}

impl DispatchStack {
    fn depth(&self) -> usize {
        self.levels.lock().len()
    }

    fn push(&self, session: SessionId) {
        self.levels.lock().push(DispatchLevel {
            session,
            reentry: false,
        });
    }

    fn pop(&self) {
        self.levels.lock().pop();
    }

    /// A session is suppressed while its callback runs above the most
    /// recent reentry-enabled level.
    fn suppresses(&self, session: SessionId) -> bool {
        let levels = self.levels.lock();
        let start = levels
            .iter()
            .rposition(|level| level.reentry)
            .map_or(0, |index| index + 1);
        levels[start..].iter().any(|level| level.session == session)
    }

    /// Set the innermost level's reentry flag, returning its index and prior value.
    fn mark_reentry(&self, reentry: bool) -> Option<(usize, bool)> {
        let mut levels = self.levels.lock();
        let index = levels.len().checked_sub(1)?;
        let prior = std::mem::replace(&mut levels[index].reentry, reentry);
        Some((index, prior))
    }

    fn restore_reentry(&self, index: usize, reentry: bool) {
        if let Some(level) = self.levels.lock().get_mut(index) {
            level.reentry = reentry;
        }
    }
}

impl fmt::Debug for DispatchStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchStack")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Execution state of one host thread or fiber.
pub struct ExecutionContext {
    tracer: Tracer,
    id: ContextId,
    fiber: FiberId,
    stack: Vec<Activation>,
    levels: DispatchStack,
    previous: Option<Current>,
}

impl ExecutionContext {
    /// A context for a new thread.
    pub fn new(tracer: Tracer) -> Self {
        Self::for_fiber(tracer, ContextId::next(), FiberId::next())
    }

    /// A context for an existing thread identity, on its root fiber.
    pub fn for_thread(tracer: Tracer, id: ContextId) -> Self {
        Self::for_fiber(tracer, id, FiberId::next())
    }

    /// A context for a fiber of thread `id`.
    ///
    /// The context registers itself as current for the calling OS thread
    /// until dropped.
    pub fn for_fiber(tracer: Tracer, id: ContextId, fiber: FiberId) -> Self {
        Self::sharing(tracer, id, fiber, DispatchStack::default())
    }

    /// A context for a fiber of thread `id` that shares `levels` with the
    /// thread's other fibers.
    pub fn sharing(tracer: Tracer, id: ContextId, fiber: FiberId, levels: DispatchStack) -> Self {
        let previous = install(Some(Current {
            id,
            levels: levels.clone(),
        }));
        trace!(context = %id, fiber = %fiber, "Execution context created");
        Self {
            tracer,
            id,
            fiber,
            stack: Vec::new(),
            levels,
            previous,
        }
    }

    /// Thread identity.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Fiber identity.
    pub fn fiber(&self) -> FiberId {
        self.fiber
    }

    /// The tracer events are dispatched through.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Callbacks running on this context's thread.
    pub fn dispatch_stack(&self) -> &DispatchStack {
        &self.levels
    }

    /// Push an activation and return its tag.
    pub fn push(&mut self, activation: Activation) -> FrameTag {
        let tag = activation.tag;
        self.stack.push(activation);
        tag
    }

    /// Pop the innermost activation.
    pub fn pop(&mut self) -> Option<Activation> {
        self.stack.pop()
    }

    /// Innermost activation.
    pub fn current(&self) -> Option<&Activation> {
        self.stack.last()
    }

    /// Innermost activation, mutably.
    pub fn current_mut(&mut self) -> Option<&mut Activation> {
        self.stack.last_mut()
    }

    /// Find an activation still on the stack.
    pub fn activation(&self, tag: FrameTag) -> Option<&Activation> {
        self.stack.iter().rev().find(|activation| activation.tag == tag)
    }

    /// Number of activations.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Move the innermost activation to `line`.
    pub fn set_line(&mut self, line: u32) {
        if let Some(activation) = self.stack.last_mut() {
            activation.line = line;
        }
    }

    /// Whether a callback is running on this context.
    pub fn in_callback(&self) -> bool {
        self.levels.depth() > 0
    }

    /// Let the running callback's session receive events raised by `body`.
    ///
    /// Fails with [`ReentrancyError::NotInCallback`] when no callback is
    /// running on this context.
    pub fn allow_reentry<R>(&mut self, body: impl FnOnce(&mut Self) -> R) -> TraceResult<R> {
        let Some((index, prior)) = self.levels.mark_reentry(true) else {
            return Err(ReentrancyError::NotInCallback.into());
        };
        let result = body(self);
        self.levels.restore_reentry(index, prior);
        Ok(result)
    }

    /// Emit an event described entirely by the innermost activation.
    pub fn emit(&mut self, kind: EventKind) -> Result<(), Exception> {
        self.dispatch(kind, |_| {})
    }

    /// Emit a return-family event carrying `value`.
    pub fn emit_return(&mut self, kind: EventKind, value: Value) -> Result<(), Exception> {
        self.dispatch(kind, |data| data.return_value = Some(value))
    }

    /// Emit `raise` or `rescue` carrying `exception`.
    pub fn emit_exception(&mut self, kind: EventKind, exception: Exception) -> Result<(), Exception> {
        self.dispatch(kind, |data| data.exception = Some(exception))
    }

    /// Emit `script_compiled`.
    pub fn emit_script(&mut self, script: CompiledScript) -> Result<(), Exception> {
        self.dispatch(EventKind::ScriptCompiled, |data| data.script = Some(script))
    }

    /// Emit `thread_begin` or `thread_end`. These carry no source position.
    pub fn emit_thread(&mut self, kind: EventKind) -> Result<(), Exception> {
        let thread = Value::Thread(self.id);
        self.dispatch(kind, |data| {
            data.path = None;
            data.lineno = 0;
            data.method_id = None;
            data.callee_id = None;
            data.defined_class = None;
            data.locals = None;
            data.parameters = Vec::new();
            data.receiver = thread;
        })
    }

    fn frame_data(&self, event: EventKind) -> FrameData {
        let top = self.stack.last();
        let site = self
            .stack
            .iter()
            .rev()
            .find(|activation| activation.kind != ActivationKind::Native);

        FrameData {
            event,
            context: self.id,
            fiber: self.fiber,
            path: top.and_then(|a| a.path.clone()),
            lineno: top.map_or(0, |a| a.line),
            method_id: top.and_then(|a| a.method_id.clone()),
            callee_id: top.and_then(|a| a.callee_id.clone()),
            defined_class: top.and_then(|a| a.defined_class.clone()),
            receiver: top.map(|a| a.receiver.clone()).unwrap_or_default(),
            locals: top.and_then(|a| a.locals.clone()),
            parameters: top.map(|a| a.parameters.clone()).unwrap_or_default(),
            return_value: None,
            exception: None,
            script: None,
            owner: site.and_then(|a| a.owner),
            code: site.and_then(|a| a.code.clone()),
        }
    }

    fn dispatch(&mut self, kind: EventKind, decorate: impl FnOnce(&mut FrameData)) -> Result<(), Exception> {
        if !self.tracer.wants(kind) {
            return Ok(());
        }

        let tracer = self.tracer.clone();
        let registrations = tracer.snapshot();
        let mut data = self.frame_data(kind);
        decorate(&mut data);
        let data = Arc::new(data);
        tracer.stats().event(kind);

        for registration in registrations.iter().rev() {
            if !registration.is_active()
                || !registration.events.contains(kind)
                || !registration.scope.admits(&data)
            {
                continue;
            }

            let session_id = registration.session.id;
            if self.levels.suppresses(session_id) {
                tracer.stats().suppressed();
                continue;
            }
            let depth = self.levels.depth();
            if depth >= tracer.config().max_dispatch_depth {
                warn!(
                    context = %self.id,
                    depth,
                    event = %kind,
                    "Trace callback nesting too deep"
                );
                return Err(Exception::system_stack_error("stack level too deep"));
            }

            let Some(guard) = tracer.guards().enter(session_id, self.id) else {
                tracer.stats().contended();
                continue;
            };
            if !registration.is_active() {
                continue;
            }

            let frame = Frame::new(Arc::clone(&data));
            let _expire = ExpireOnDrop(&frame);
            let session = TraceSession::from_parts(Arc::clone(&registration.session), tracer.clone());

            let result = {
                let _guard = guard;
                let _running = Running::enter(self.id, &self.levels, session_id);
                let mut hook = Hook::new(frame.clone(), session, self);
                registration.session.invoke(&mut hook)
            };

            if tracer.config().log_dispatch {
                trace!(
                    context = %self.id,
                    session = %session_id,
                    event = %kind,
                    line = data.lineno,
                    ok = result.is_ok(),
                    "Trace callback delivered"
                );
            }
            tracer.stats().callback(result.is_err());

            if let Err(exception) = result {
                trace!(
                    session = %session_id,
                    exception = %exception,
                    "Trace callback raised"
                );
                return Err(exception);
            }
        }
        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        install(self.previous.take());
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("fiber", &self.fiber)
            .field("depth", &self.stack.len())
            .field("callbacks", &self.levels.depth())
            .finish()
    }
}

/// One callback level, popped and uninstalled when dropped.
struct Running {
    levels: DispatchStack,
    previous: Option<Current>,
}

impl Running {
    fn enter(id: ContextId, levels: &DispatchStack, session: SessionId) -> Self {
        let previous = install(Some(Current {
            id,
            levels: levels.clone(),
        }));
        levels.push(session);
        Self {
            levels: levels.clone(),
            previous,
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.levels.pop();
        install(self.previous.take());
    }
}

struct ExpireOnDrop<'a>(&'a Frame);

impl Drop for ExpireOnDrop<'_> {
    fn drop(&mut self) {
        self.0.expire();
    }
}
