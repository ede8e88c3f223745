//! Vigil Hook - sessions, scopes and event dispatch
//!
//! This crate is the bridge between instrumentation points in a host engine
//! and user callbacks:
//!
//! - [`Tracer`]: registry of enabled sessions with a lock-free fast path
//! - [`TraceSession`]: an event set plus a callback, enabled under a [`Scope`]
//! - [`ExecutionContext`]: per-thread activation stack and dispatcher
//! - [`Frame`] and [`Binding`]: callback-lifetime views of an event
//! - Legacy trace functions ([`Tracer::set_trace_func`])
//!
//! # Quick Start
//!
//! ```ignore
//! use vigil_hook::prelude::*;
//!
//! let tracer = Tracer::with_defaults();
//! let session = tracer.session(EventSet::A_CALL, |hook| {
//!     println!("{} {:?}", hook.event()?, hook.method_id()?);
//!     Ok(())
//! })?;
//!
//! session.enable_scoped(EnableOptions::global(), || {
//!     // run host code on an ExecutionContext
//! })?;
//! ```
//!
//! # Dispatch Rules
//!
//! 1. Nothing is built unless some enabled session wants the event kind
//! 2. Sessions are visited newest first
//! 3. A session never observes events raised by its own callback unless the
//!    callback opts in with `allow_reentry`
//! 4. A callback error stops delivery and surfaces at the instrumentation point
//! 5. One session's callback never runs on two threads at once; fibers
//!    share their thread's callback state

pub mod context;
pub mod frame;
mod gate;
pub mod legacy;
pub mod scope;
pub mod session;
pub mod stats;
pub mod tracer;

pub use context::{current_context_id, Activation, ActivationKind, DispatchStack, ExecutionContext};
pub use frame::{Binding, CompiledScript, Frame, FrameData, Locals};
pub use legacy::LegacyEvent;
pub use scope::{EnableOptions, Scope, Target, TargetCallable, ThreadSelector};
pub use session::{Callback, Hook, TraceSession};
pub use stats::TraceStats;
pub use tracer::Tracer;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```ignore
/// use vigil_hook::prelude::*;
/// ```
pub mod prelude {
    pub use crate::context::{Activation, ActivationKind, ExecutionContext};
    pub use crate::frame::{Binding, Frame, Locals};
    pub use crate::scope::{EnableOptions, Scope, TargetCallable};
    pub use crate::session::{Hook, TraceSession};
    pub use crate::tracer::Tracer;
    pub use vigil_core::prelude::*;
}
