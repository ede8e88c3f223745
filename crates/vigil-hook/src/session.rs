//! Trace sessions.
//!
//! A [`TraceSession`] pairs an event set with a callback. Sessions start
//! disabled; enabling registers them with their [`Tracer`] under a
//! [`Scope`], disabling removes the registration.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use vigil_core::{EventSet, Exception, ReentrancyError, ScopeConflictError, SessionId, TraceResult};

use crate::context::{self, ExecutionContext};
use crate::frame::Frame;
use crate::scope::{EnableOptions, Scope};
use crate::tracer::Tracer;

/// Signature of a session callback.
///
/// Returning an exception aborts delivery of the current event and raises
/// the exception at the instrumentation point.
pub type Callback = dyn Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync;

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) events: EventSet,
    callback: Box<Callback>,
    state: Mutex<Option<Scope>>,
}

impl SessionInner {
    pub(crate) fn new(events: EventSet, callback: Box<Callback>) -> Self {
        Self {
            id: SessionId::new(),
            events,
            callback,
            state: Mutex::new(None),
        }
    }

    pub(crate) fn invoke(&self, hook: &mut Hook<'_>) -> Result<(), Exception> {
        (self.callback)(hook)
    }
}

/// A subscription to execution events.
#[derive(Clone)]
pub struct TraceSession {
    inner: Arc<SessionInner>,
    tracer: Tracer,
}

impl TraceSession {
    pub(crate) fn from_parts(inner: Arc<SessionInner>, tracer: Tracer) -> Self {
        Self { inner, tracer }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Session identity.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Events this session was created with.
    pub fn events(&self) -> EventSet {
        self.inner.events
    }

    /// Whether the session is currently registered.
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Scope of the current registration, if enabled.
    pub fn scope(&self) -> Option<Scope> {
        self.inner.state.lock().clone()
    }

    /// The tracer this session belongs to.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Enable the session. Returns whether it was already enabled.
    ///
    /// Enabling an enabled session with a global or thread scope is a no-op
    /// (or a re-scope). When either the current or the requested scope is
    /// code-targeted the call fails with
    /// [`ScopeConflictError::NestedTargetConflict`].
    ///
    /// From inside the session's own callback the call fails with
    /// [`ReentrancyError::RecursiveActivation`] unless the callback is in an
    /// `allow_reentry` region.
    pub fn enable(&self, options: EnableOptions) -> TraceResult<bool> {
        if context::in_own_callback(self.inner.id) {
            debug!(session = %self.inner.id, "Enable from own callback rejected");
            return Err(ReentrancyError::RecursiveActivation.into());
        }
        let scope = options.resolve(self.inner.events)?;
        let mut state = self.inner.state.lock();

        match state.as_ref() {
            Some(current) if current.is_target() || scope.is_target() => {
                Err(ScopeConflictError::NestedTargetConflict.into())
            }
            Some(current) => {
                if *current != scope {
                    debug!(session = %self.inner.id, scope = ?scope, "Trace session re-scoped");
                    self.tracer.register(&self.inner, scope.clone());
                    *state = Some(scope);
                }
                Ok(true)
            }
            None => {
                self.tracer.register(&self.inner, scope.clone());
                self.tracer.stats().session_enabled();
                info!(
                    session = %self.inner.id,
                    events = %self.inner.events,
                    scope = ?scope,
                    "Trace session enabled"
                );
                *state = Some(scope);
                Ok(false)
            }
        }
    }

    /// Enable for the duration of `body`, then restore the prior state.
    ///
    /// The prior state is restored even if `body` unwinds.
    pub fn enable_scoped<R>(&self, options: EnableOptions, body: impl FnOnce() -> R) -> TraceResult<R> {
        let prior = self.scope();
        self.enable(options)?;
        let _restore = Restore {
            session: self,
            prior: Some(prior),
        };
        Ok(body())
    }

    /// Disable the session. Returns whether it was enabled.
    pub fn disable(&self) -> bool {
        let was_enabled = self.transition(None);
        if was_enabled {
            info!(session = %self.inner.id, "Trace session disabled");
        }
        was_enabled
    }

    /// Disable for the duration of `body`, then restore the prior state.
    pub fn disable_scoped<R>(&self, body: impl FnOnce() -> R) -> TraceResult<R> {
        let prior = self.scope();
        if prior.as_ref().is_some_and(Scope::is_target) {
            return Err(ScopeConflictError::DisableTargetInBlock.into());
        }
        self.transition(None);
        let _restore = Restore {
            session: self,
            prior: Some(prior),
        };
        Ok(body())
    }

    /// `#<TracePoint:enabled>` or `#<TracePoint:disabled>`.
    pub fn inspect(&self) -> String {
        if self.is_enabled() {
            "#<TracePoint:enabled>".to_string()
        } else {
            "#<TracePoint:disabled>".to_string()
        }
    }

    /// Move to `next` without conflict checks. Returns whether the session
    /// was enabled before.
    fn transition(&self, next: Option<Scope>) -> bool {
        let mut state = self.inner.state.lock();
        let was_enabled = state.is_some();
        if *state == next {
            return was_enabled;
        }
        match &next {
            Some(scope) => {
                self.tracer.register(&self.inner, scope.clone());
                if !was_enabled {
                    self.tracer.stats().session_enabled();
                }
            }
            None => {
                self.tracer.unregister(self.inner.id);
            }
        }
        *state = next;
        was_enabled
    }
}

impl fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSession")
            .field("id", &self.inner.id)
            .field("events", &self.inner.events)
            .field("scope", &self.scope())
            .finish()
    }
}

struct Restore<'a> {
    session: &'a TraceSession,
    prior: Option<Option<Scope>>,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            self.session.transition(prior);
        }
    }
}

/// The argument every callback receives.
///
/// Dereferences to the event's [`Frame`], and also exposes the running
/// session and the execution context the event fired on.
pub struct Hook<'a> {
    frame: Frame,
    session: TraceSession,
    cx: &'a mut ExecutionContext,
}

impl<'a> Hook<'a> {
    pub(crate) fn new(frame: Frame, session: TraceSession, cx: &'a mut ExecutionContext) -> Self {
        Self { frame, session, cx }
    }

    /// The event frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// The session whose callback is running.
    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    /// The execution context the event fired on.
    pub fn context(&mut self) -> &mut ExecutionContext {
        self.cx
    }

    /// Run `body` with this session allowed to receive nested events.
    pub fn allow_reentry<R>(&mut self, body: impl FnOnce(&mut ExecutionContext) -> R) -> TraceResult<R> {
        self.cx.allow_reentry(body)
    }
}

impl Deref for Hook<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl fmt::Debug for Hook<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("frame", &self.frame)
            .field("session", &self.session.id())
            .field("context", &self.cx.id())
            .finish()
    }
}
