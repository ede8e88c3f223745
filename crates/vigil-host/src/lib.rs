//! Vigil Host - a minimal execution engine that drives instrumentation
//!
//! The tracing engine only sees activations and `emit*` calls. This crate
//! plays the runtime around it: methods and aliases, closure-bound methods,
//! blocks and lambdas, native methods, classes, exceptions with
//! rescue/ensure, non-local `break` and `return`, threads, fibers and runtime
//! compilation. It has no parser and no object model; programs are written
//! as Rust closures against the [`Interpreter`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use vigil_host::prelude::*;
//!
//! let tracer = Tracer::with_defaults();
//! let mut cx = main_context(tracer.clone(), "app.rb");
//!
//! let greeter = Class::new("Greeter");
//! let hello = greeter.define("hello", CodeBody::new("hello", SourceLoc::new("app.rb", 1)), |cx, _| {
//!     cx.line(2)?;
//!     Ok(Value::str("hi"))
//! });
//!
//! let _session = tracer.trace(EventSet::A_CALL, |hook| {
//!     println!("{}", hook.inspect()?);
//!     Ok(())
//! })?;
//! cx.invoke(&hello, greeter.instance(), vec![], None)?;
//! ```

pub mod class;
pub mod control;
pub mod error;
pub mod fiber;
pub mod interp;
pub mod method;
pub mod thread;

use std::sync::Arc;

use vigil_core::{CodeBody, SourceLoc, Value};
use vigil_hook::{Activation, ActivationKind, ExecutionContext, Locals, Tracer};

pub use class::Class;
pub use control::{settle, Flow, Unwind};
pub use error::{HostError, HostResult};
pub use fiber::{Fiber, FiberState};
pub use interp::{bind_parameters, Interpreter};
pub use method::{Block, Invocation, MethodDef, MethodEntry, MethodKind};
pub use thread::{spawn_thread, ThreadHandle};

/// A context for the main thread, positioned at line 1 of `path` inside the
/// top-level script body.
///
/// A `return` at top level ends the script with its value.
pub fn main_context(tracer: Tracer, path: &str) -> ExecutionContext {
    let mut cx = ExecutionContext::new(tracer);
    let loc = SourceLoc::new(path, 1);
    let code: Arc<CodeBody> = CodeBody::new("<main>", loc.clone()).shared();
    let top = Activation::new(ActivationKind::Top, Value::object("Object"))
        .at(&loc)
        .with_locals(Locals::new())
        .with_code(code);
    let tag = top.tag;
    cx.push(top.unwinds_to(Some(tag), None));
    cx
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```ignore
/// use vigil_host::prelude::*;
/// ```
pub mod prelude {
    pub use crate::class::Class;
    pub use crate::control::{Flow, Unwind};
    pub use crate::fiber::Fiber;
    pub use crate::interp::Interpreter;
    pub use crate::main_context;
    pub use crate::method::{Block, MethodEntry};
    pub use crate::thread::spawn_thread;
    pub use vigil_hook::prelude::*;
}
