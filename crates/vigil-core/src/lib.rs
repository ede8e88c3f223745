//! Vigil Core - shared vocabulary of the Vigil tracing engine
//!
//! This crate defines the types every other Vigil crate speaks:
//!
//! - [`EventKind`] and [`EventSet`]: what can be observed
//! - [`Attribute`] and [`Availability`]: what can be read during each event
//! - [`Value`] and [`Exception`]: managed-language values seen by callbacks
//! - [`CodeBody`]: compiled code units forming a lexical tree
//! - [`TraceError`]: the error hierarchy, convertible to [`Exception`]
//! - [`TracerConfig`]: tracer configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use vigil_core::prelude::*;
//!
//! let events: EventSet = "call,return".parse()?;
//! assert!(events.contains(EventKind::Call));
//! assert_eq!(
//!     EventKind::CCall.availability(Attribute::Binding),
//!     Availability::Absent,
//! );
//! ```

pub mod code;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod value;

pub use code::{CodeBody, ParamKind, Parameter};
pub use config::TracerConfig;
pub use error::{
    ConfigurationError, ReentrancyError, ScopeConflictError, StaleAccessError, TraceError,
    TraceResult,
};
pub use event::{Attribute, Availability, EventKind, EventSet};
pub use ids::{CodeId, ContextId, DefId, FiberId, FrameTag, ObjectId, SessionId, SourceLoc, Symbol};
pub use value::{Exception, Value};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```ignore
/// use vigil_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::code::{CodeBody, Parameter};
    pub use crate::config::TracerConfig;
    pub use crate::error::{TraceError, TraceResult};
    pub use crate::event::{Attribute, Availability, EventKind, EventSet};
    pub use crate::ids::{ContextId, SourceLoc, Symbol};
    pub use crate::value::{Exception, Value};
}
