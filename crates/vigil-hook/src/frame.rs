//! Event frame views.
//!
//! A [`Frame`] is the read-only view a callback receives. It is only valid
//! while that callback runs: once the callback returns, the dispatcher
//! expires the view and every accessor fails with
//! [`StaleAccessError::FrameExpired`]. Cloning a frame shares the same
//! liveness token, so a clone smuggled out of the callback expires too.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use vigil_core::{
    Attribute, Availability, CodeBody, ContextId, DefId, EventKind, Exception, FiberId, Parameter,
    StaleAccessError, Symbol, TraceResult, Value,
};

/// Local variable storage for one activation.
///
/// Block activations chain to the storage of the activation that created
/// them, so lookups fall through to enclosing scopes.
#[derive(Clone, Default)]
pub struct Locals {
    inner: Arc<LocalsInner>,
}

#[derive(Default)]
struct LocalsInner {
    vars: RwLock<Vec<(Symbol, Value)>>,
    parent: Option<Locals>,
}

impl Locals {
    /// Empty top-level storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty storage nested inside `parent`.
    pub fn child(parent: &Locals) -> Self {
        Self {
            inner: Arc::new(LocalsInner {
                vars: RwLock::new(Vec::new()),
                parent: Some(parent.clone()),
            }),
        }
    }

    /// Read a variable, searching enclosing scopes.
    pub fn get(&self, name: &str) -> Option<Value> {
        let found = self
            .inner
            .vars
            .read()
            .iter()
            .find(|(var, _)| var.as_str() == name)
            .map(|(_, value)| value.clone());
        found.or_else(|| self.inner.parent.as_ref().and_then(|p| p.get(name)))
    }

    /// Assign a variable. An existing variable in an enclosing scope is
    /// updated in place; otherwise the variable is created here.
    pub fn set(&self, name: impl Into<Symbol>, value: Value) {
        let name = name.into();
        if !self.assign_existing(&name, &value) {
            self.inner.vars.write().push((name, value));
        }
    }

    fn assign_existing(&self, name: &Symbol, value: &Value) -> bool {
        {
            let mut vars = self.inner.vars.write();
            if let Some(slot) = vars.iter_mut().find(|(var, _)| var == name) {
                slot.1 = value.clone();
                return true;
            }
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(|parent| parent.assign_existing(name, value))
    }

    /// Visible variable names, innermost scope first.
    pub fn names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self
            .inner
            .vars
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        if let Some(parent) = &self.inner.parent {
            for name in parent.names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

impl fmt::Debug for Locals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Source compiled at runtime, reported by `script_compiled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    /// Path the source was compiled under.
    pub path: Option<String>,
    /// The source text.
    pub source: String,
}

/// Everything the dispatcher knows about one event occurrence.
///
/// Built once per event and shared by every callback that receives it.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub(crate) event: EventKind,
    pub(crate) context: ContextId,
    pub(crate) fiber: FiberId,
    pub(crate) path: Option<Arc<str>>,
    pub(crate) lineno: u32,
    pub(crate) method_id: Option<Symbol>,
    pub(crate) callee_id: Option<Symbol>,
    pub(crate) defined_class: Option<Symbol>,
    pub(crate) receiver: Value,
    pub(crate) locals: Option<Locals>,
    pub(crate) parameters: Vec<Parameter>,
    pub(crate) return_value: Option<Value>,
    pub(crate) exception: Option<Exception>,
    pub(crate) script: Option<CompiledScript>,
    pub(crate) owner: Option<DefId>,
    pub(crate) code: Option<Arc<CodeBody>>,
}

impl FrameData {
    /// The event kind.
    pub fn event(&self) -> EventKind {
        self.event
    }

    /// Context the event occurred on.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Line number at the event.
    pub fn lineno(&self) -> u32 {
        self.lineno
    }

    /// Method definition the instrumentation site belongs to.
    pub fn owner(&self) -> Option<DefId> {
        self.owner
    }

    /// Code body the instrumentation site belongs to.
    pub fn code(&self) -> Option<&Arc<CodeBody>> {
        self.code.as_ref()
    }
}

/// Liveness token shared by a frame and the bindings derived from it.
#[derive(Clone)]
struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn check(&self) -> TraceResult<()> {
        if self.0.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StaleAccessError::FrameExpired.into())
        }
    }

    fn expire(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A callback's view of the current event.
#[derive(Clone)]
pub struct Frame {
    data: Arc<FrameData>,
    live: Liveness,
}

impl Frame {
    pub(crate) fn new(data: Arc<FrameData>) -> Self {
        Self {
            data,
            live: Liveness::new(),
        }
    }

    pub(crate) fn expire(&self) {
        self.live.expire();
    }

    fn require(&self, attribute: Attribute) -> TraceResult<Availability> {
        self.live.check()?;
        match self.data.event.availability(attribute) {
            Availability::Undefined => Err(StaleAccessError::InvalidAccessForEvent {
                attribute,
                event: self.data.event,
            }
            .into()),
            availability => Ok(availability),
        }
    }

    /// Whether the owning callback is still running.
    pub fn is_live(&self) -> bool {
        self.live.check().is_ok()
    }

    /// The event kind.
    pub fn event(&self) -> TraceResult<EventKind> {
        self.require(Attribute::Event)?;
        Ok(self.data.event)
    }

    /// Line number; `0` for events without a source position.
    pub fn lineno(&self) -> TraceResult<u32> {
        self.require(Attribute::Lineno)?;
        Ok(self.data.lineno)
    }

    /// Source path; `None` for events without a source position.
    pub fn path(&self) -> TraceResult<Option<&str>> {
        match self.require(Attribute::Path)? {
            Availability::Defined => Ok(self.data.path.as_deref()),
            _ => Ok(None),
        }
    }

    /// Original name of the executing method.
    pub fn method_id(&self) -> TraceResult<Option<Symbol>> {
        self.require(Attribute::MethodId)?;
        Ok(self.data.method_id.clone())
    }

    /// Name the executing method was called under.
    pub fn callee_id(&self) -> TraceResult<Option<Symbol>> {
        self.require(Attribute::CalleeId)?;
        Ok(self.data.callee_id.clone())
    }

    /// Class owning the executing method.
    pub fn defined_class(&self) -> TraceResult<Option<Symbol>> {
        self.require(Attribute::DefinedClass)?;
        Ok(self.data.defined_class.clone())
    }

    /// Receiver of the executing frame.
    pub fn self_value(&self) -> TraceResult<Value> {
        self.require(Attribute::SelfValue)?;
        Ok(self.data.receiver.clone())
    }

    /// Local variable view; `None` where the event has no managed frame.
    pub fn binding(&self) -> TraceResult<Option<Binding>> {
        match self.require(Attribute::Binding)? {
            Availability::Defined => Ok(self.data.locals.as_ref().map(|locals| Binding {
                locals: locals.clone(),
                receiver: self.data.receiver.clone(),
                live: self.live.clone(),
            })),
            _ => Ok(None),
        }
    }

    /// Value produced by the returning frame.
    pub fn return_value(&self) -> TraceResult<Value> {
        self.require(Attribute::ReturnValue)?;
        Ok(self.data.return_value.clone().unwrap_or_default())
    }

    /// Exception being raised or rescued.
    pub fn raised_exception(&self) -> TraceResult<Exception> {
        self.require(Attribute::RaisedException)?;
        self.data.exception.clone().ok_or_else(|| {
            StaleAccessError::InvalidAccessForEvent {
                attribute: Attribute::RaisedException,
                event: self.data.event,
            }
            .into()
        })
    }

    /// Formal parameters of the method or block.
    pub fn parameters(&self) -> TraceResult<Vec<Parameter>> {
        self.require(Attribute::Parameters)?;
        Ok(self.data.parameters.clone())
    }

    /// Path of compiled source.
    pub fn compiled_path(&self) -> TraceResult<Option<&str>> {
        self.require(Attribute::CompiledPath)?;
        Ok(self.data.script.as_ref().and_then(|s| s.path.as_deref()))
    }

    /// Text of compiled source.
    pub fn eval_script(&self) -> TraceResult<&str> {
        self.require(Attribute::EvalScript)?;
        Ok(self
            .data
            .script
            .as_ref()
            .map(|s| s.source.as_str())
            .unwrap_or_default())
    }

    /// Context the event occurred on.
    pub fn context(&self) -> TraceResult<ContextId> {
        self.live.check()?;
        Ok(self.data.context)
    }

    /// Fiber the event occurred on.
    pub fn fiber(&self) -> TraceResult<FiberId> {
        self.live.check()?;
        Ok(self.data.fiber)
    }

    /// Human-readable summary, e.g. `#<TracePoint:call 'foo' app.rb:3>`.
    pub fn inspect(&self) -> TraceResult<String> {
        self.live.check()?;
        let data = &self.data;
        let location = match &data.path {
            Some(path) => format!("{path}:{}", data.lineno),
            None => String::new(),
        };
        Ok(match data.event {
            EventKind::Line => format!("#<TracePoint:line {location}>"),
            EventKind::Call
            | EventKind::CCall
            | EventKind::Return
            | EventKind::CReturn => {
                let name = data.method_id.as_ref().map(Symbol::as_str).unwrap_or("");
                format!("#<TracePoint:{} '{name}' {location}>", data.event)
            }
            EventKind::ThreadBegin | EventKind::ThreadEnd => {
                format!("#<TracePoint:{} {}>", data.event, data.receiver)
            }
            other => format!("#<TracePoint:{other} {location}>"),
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("event", &self.data.event)
            .field("lineno", &self.data.lineno)
            .field("method_id", &self.data.method_id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Read-only view of a frame's local variables.
///
/// Shares its frame's lifetime.
#[derive(Clone)]
pub struct Binding {
    locals: Locals,
    receiver: Value,
    live: Liveness,
}

impl Binding {
    /// Read a local variable.
    pub fn local_variable_get(&self, name: &str) -> TraceResult<Option<Value>> {
        self.live.check()?;
        Ok(self.locals.get(name))
    }

    /// Whether a local variable is visible.
    pub fn local_variable_defined(&self, name: &str) -> TraceResult<bool> {
        self.live.check()?;
        Ok(self.locals.get(name).is_some())
    }

    /// Names of visible local variables.
    pub fn local_variables(&self) -> TraceResult<Vec<Symbol>> {
        self.live.check()?;
        Ok(self.locals.names())
    }

    /// Receiver of the bound frame.
    pub fn receiver(&self) -> TraceResult<Value> {
        self.live.check()?;
        Ok(self.receiver.clone())
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("receiver", &self.receiver)
            .field("locals", &self.locals)
            .finish()
    }
}
