//! Error types for the host engine.
//!
//! These are failures of the engine itself. Failures inside the managed
//! program travel as [`Unwind`](crate::control::Unwind) values instead.

use thiserror::Error;

use vigil_core::{ContextId, TraceError};

/// Errors raised by host engine operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// A method name could not be resolved on a class.
    #[error("Undefined method '{method}' for class '{class}'")]
    UndefinedMethod {
        /// The class searched.
        class: String,
        /// The missing method name.
        method: String,
    },

    /// The OS refused to start a thread.
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// A thread body panicked instead of returning.
    #[error("Thread {0} panicked")]
    ThreadPanicked(ContextId),

    /// A tracing operation failed.
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Result type for host engine operations.
pub type HostResult<T> = std::result::Result<T, HostError>;
