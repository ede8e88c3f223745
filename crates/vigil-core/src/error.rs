//! Core error types for Vigil.
//!
//! Errors are grouped by origin: session configuration, scope conflicts,
//! access to expired or inapplicable frame data, and reentrancy misuse.
//! Every [`TraceError`] also converts into a managed-language [`Exception`]
//! so host engines can surface it at the point of failure.

use thiserror::Error;

use crate::event::{Attribute, EventKind};
use crate::value::Exception;

/// Top-level error type for tracing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    /// Invalid session or enable configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Conflicting enable/disable calls.
    #[error("Scope conflict: {0}")]
    ScopeConflict(#[from] ScopeConflictError),

    /// Frame data read outside its lifetime or for the wrong event.
    #[error("Stale access: {0}")]
    StaleAccess(#[from] StaleAccessError),

    /// Reentrancy requested outside a callback.
    #[error("Reentrancy error: {0}")]
    Reentrancy(#[from] ReentrancyError),
}

/// Errors in session or enable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A session was created with no events.
    #[error("event set is empty")]
    EmptyEventSet,

    /// An event name could not be parsed.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// A target line was given without a target.
    #[error("only target_line is specified")]
    LineWithoutTarget,

    /// A target line was given but the session does not watch `line`.
    #[error("target_line is specified, but line event is not specified")]
    LineWithoutLineEvent,

    /// The requested target has no compiled body to attach to.
    #[error("specified target is not supported: {0}")]
    UnsupportedTarget(String),

    /// Scope options that cannot be combined.
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// A configuration value outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from nested enable/disable calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeConflictError {
    /// Enabling an enabled session when either scope is code-targeted.
    #[error("can't nest-enable a targeting TracePoint")]
    NestedTargetConflict,

    /// Scoped disable of a code-targeted session.
    #[error("can't disable a targeting TracePoint in a block")]
    DisableTargetInBlock,
}

/// Errors reading frame data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaleAccessError {
    /// The frame view was read after its callback returned.
    #[error("access from outside")]
    FrameExpired,

    /// The attribute has no meaning for the current event.
    #[error("not supported by this event: {attribute} during {event}")]
    InvalidAccessForEvent {
        /// The attribute that was read.
        attribute: Attribute,
        /// The event being delivered.
        event: EventKind,
    },
}

/// Errors from reentrancy control.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReentrancyError {
    /// `allow_reentry` called while no callback is running.
    #[error("No running TracePoint hook")]
    NotInCallback,

    /// A session enabled from inside its own callback without `allow_reentry`.
    #[error("can't enable a TracePoint from inside its own hook")]
    RecursiveActivation,
}

/// Result type for tracing operations.
pub type TraceResult<T> = std::result::Result<T, TraceError>;

impl TraceError {
    /// Class of the exception this error raises inside the managed program.
    pub fn exception_class(&self) -> &'static str {
        match self {
            TraceError::Configuration(_) | TraceError::ScopeConflict(_) => "ArgumentError",
            TraceError::StaleAccess(_) | TraceError::Reentrancy(_) => "RuntimeError",
        }
    }
}

impl From<TraceError> for Exception {
    fn from(error: TraceError) -> Self {
        let message = match &error {
            TraceError::Configuration(inner) => inner.to_string(),
            TraceError::ScopeConflict(inner) => inner.to_string(),
            TraceError::StaleAccess(inner) => inner.to_string(),
            TraceError::Reentrancy(inner) => inner.to_string(),
        };
        Exception::new(error.exception_class(), message)
    }
}
