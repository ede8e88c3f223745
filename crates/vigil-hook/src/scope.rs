//! Session scopes and enable options.

use vigil_core::{
    CodeId, ConfigurationError, ContextId, DefId, EventKind, EventSet, TraceResult,
};

use crate::context;
use crate::frame::FrameData;

/// Callable a session can be narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetCallable {
    /// A method definition, matched through any of its aliases.
    Method(DefId),
    /// A compiled body (block, lambda, script) and everything nested in it.
    Code(CodeId),
}

/// A code-targeted scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    callable: TargetCallable,
    line: Option<u32>,
}

impl Target {
    /// The targeted callable.
    pub fn callable(&self) -> TargetCallable {
        self.callable
    }

    /// The targeted line, if narrowed to one.
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    fn admits(&self, frame: &FrameData) -> bool {
        if !EventSet::TARGETABLE.contains(frame.event) {
            return false;
        }
        if let Some(line) = self.line {
            if frame.event != EventKind::Line || frame.lineno != line {
                return false;
            }
        }
        match self.callable {
            TargetCallable::Method(def) => frame.owner == Some(def),
            TargetCallable::Code(code) => frame
                .code
                .as_ref()
                .is_some_and(|body| body.descends_from(code)),
        }
    }
}

/// Where an enabled session listens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// Every context.
    #[default]
    Global,
    /// One context only.
    Thread(ContextId),
    /// Instrumentation sites inside one callable.
    Target(Target),
}

impl Scope {
    /// Whether this is a code-targeted scope.
    pub fn is_target(&self) -> bool {
        matches!(self, Scope::Target(_))
    }

    /// Narrow `events` to what this scope can ever deliver.
    pub fn effective_events(&self, events: EventSet) -> EventSet {
        match self {
            Scope::Target(_) => events.intersection(EventSet::TARGETABLE),
            _ => events,
        }
    }

    /// Whether an event occurrence falls inside this scope.
    pub fn admits(&self, frame: &FrameData) -> bool {
        match self {
            Scope::Global => true,
            Scope::Thread(context) => frame.context == *context,
            Scope::Target(target) => target.admits(frame),
        }
    }
}

/// Which context a thread-scoped session should listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSelector {
    /// The context calling `enable`.
    Current,
    /// A specific context.
    Context(ContextId),
}

/// Options accepted by `enable`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableOptions {
    target: Option<TargetCallable>,
    target_line: Option<u32>,
    target_thread: Option<ThreadSelector>,
}

impl EnableOptions {
    /// Listen everywhere.
    pub fn global() -> Self {
        Self::default()
    }

    /// Listen inside `callable` only.
    pub fn target(callable: TargetCallable) -> Self {
        Self {
            target: Some(callable),
            ..Self::default()
        }
    }

    /// Listen on one context only.
    pub fn thread(context: ContextId) -> Self {
        Self {
            target_thread: Some(ThreadSelector::Context(context)),
            ..Self::default()
        }
    }

    /// Listen on the calling context only.
    pub fn current_thread() -> Self {
        Self {
            target_thread: Some(ThreadSelector::Current),
            ..Self::default()
        }
    }

    /// Narrow a target to one line.
    pub fn with_line(mut self, line: u32) -> Self {
        self.target_line = Some(line);
        self
    }

    /// Narrow to a callable.
    pub fn with_target(mut self, callable: TargetCallable) -> Self {
        self.target = Some(callable);
        self
    }

    /// Narrow to a context.
    pub fn with_thread(mut self, selector: ThreadSelector) -> Self {
        self.target_thread = Some(selector);
        self
    }

    /// Validate the options against a session's events and produce a scope.
    pub fn resolve(&self, events: EventSet) -> TraceResult<Scope> {
        match (self.target, self.target_line, self.target_thread) {
            (None, Some(_), _) => Err(ConfigurationError::LineWithoutTarget.into()),
            (Some(_), _, Some(_)) => Err(ConfigurationError::InvalidScope(
                "target and target_thread cannot be combined".to_string(),
            )
            .into()),
            (Some(_), Some(_), None) if !events.contains(EventKind::Line) => {
                Err(ConfigurationError::LineWithoutLineEvent.into())
            }
            (Some(callable), line, None) => Ok(Scope::Target(Target { callable, line })),
            (None, None, Some(ThreadSelector::Context(context))) => Ok(Scope::Thread(context)),
            (None, None, Some(ThreadSelector::Current)) => context::current_context_id()
                .map(Scope::Thread)
                .ok_or_else(|| {
                    ConfigurationError::InvalidScope(
                        "no execution context is running on this thread".to_string(),
                    )
                    .into()
                }),
            (None, None, None) => Ok(Scope::Global),
        }
    }
}
