//! # Vigil - Execution-Event Tracing Engine
//!
//! Vigil lets observers subscribe to execution events of a managed-language
//! runtime (method calls and returns, block entry and exit, line steps,
//! exceptions, class bodies, thread and fiber switches, script compilation)
//! and inspect the live frame from a callback.
//!
//! ## Features
//!
//! - **Sessions**: enable and disable observers globally, per thread, or
//!   narrowed to one method, block or line
//! - **Zero cost when idle**: events no enabled session wants are never built
//! - **Safe frames**: frame views expire when the callback returns
//! - **Reentrancy control**: callbacks do not observe themselves unless they
//!   opt in
//! - **Observability**: recorders, logging observers, balance checks, reports
//!
//! ## Quick Start
//!
//! ```ignore
//! use vigil::prelude::*;
//!
//! let runtime = Vigil::builder()
//!     .with_default_events(EventSet::A_CALL | EventSet::A_RETURN)
//!     .build()?;
//!
//! let session = runtime.trace(EventKind::Call | EventKind::Return, |hook| {
//!     println!("{}", hook.inspect()?);
//!     Ok(())
//! })?;
//!
//! let value = runtime.run("app.rb", |cx| {
//!     cx.line(1)?;
//!     Ok(Value::Nil)
//! })?;
//! session.disable();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Your Application                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                     vigil (facade)                      │
//! │                    ┌─────────────────┐                  │
//! │                    │  Vigil Builder  │                  │
//! │                    └────────┬────────┘                  │
//! │                             │                           │
//! │  ┌──────────────┬──────────┴───────┬───────────────┐   │
//! │  │ vigil-host   │ vigil-hook       │ vigil-observe │   │
//! │  │ (methods,    │ (sessions,       │ (records,     │   │
//! │  │  fibers)     │  dispatch)       │  reports)     │   │
//! │  └──────────────┴──────────────────┴───────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                       vigil-core                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use vigil_core::{EventSet, Exception, TraceError, TracerConfig, Value};
use vigil_hook::{EnableOptions, ExecutionContext, Hook, TraceSession, TraceStats, Tracer};
use vigil_host::{Flow, HostError};
use vigil_observe::{
    CallBalance, ObserverSet, Recorder, RunOutcome, TraceObserver, TraceReport,
};

// Re-export from sub-crates
pub use vigil_core;
pub use vigil_hook;
pub use vigil_host;
pub use vigil_observe;

/// Main entry point for Vigil.
pub struct Vigil;

impl Vigil {
    /// Create a new runtime builder.
    pub fn builder() -> VigilBuilder {
        VigilBuilder::new()
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<VigilRuntime, VigilError> {
        VigilBuilder::new().build()
    }
}

/// Builder for configuring a Vigil runtime.
pub struct VigilBuilder {
    config: TracerConfig,
    observers: Vec<Arc<dyn TraceObserver>>,
}

impl VigilBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: TracerConfig::default(),
            observers: Vec::new(),
        }
    }

    /// Replace the whole tracer configuration.
    pub fn with_config(mut self, config: TracerConfig) -> Self {
        self.config = config;
        self
    }

    /// Events used by sessions created without an explicit list.
    pub fn with_default_events(mut self, events: EventSet) -> Self {
        self.config.default_events = events;
        self
    }

    /// Enable or disable dispatch counters.
    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.config.collect_stats = enabled;
        self
    }

    /// Enable or disable a `trace` log record per delivered callback.
    pub fn with_dispatch_logging(mut self, enabled: bool) -> Self {
        self.config.log_dispatch = enabled;
        self
    }

    /// Set the maximum callback nesting depth.
    pub fn with_max_dispatch_depth(mut self, depth: usize) -> Self {
        self.config.max_dispatch_depth = depth;
        self
    }

    /// Add an observer fed by [`VigilRuntime::observe`].
    pub fn with_observer(mut self, observer: Arc<dyn TraceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<VigilRuntime, VigilError> {
        let tracer = Tracer::new(self.config)?;

        let observers = ObserverSet::new();
        for observer in self.observers {
            observers.subscribe(observer);
        }

        debug!(observers = observers.len(), "Vigil runtime built");
        Ok(VigilRuntime { tracer, observers })
    }
}

impl Default for VigilBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured Vigil runtime.
#[derive(Clone)]
pub struct VigilRuntime {
    tracer: Tracer,
    observers: ObserverSet,
}

impl VigilRuntime {
    /// The tracer behind this runtime.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The tracer configuration.
    pub fn config(&self) -> &TracerConfig {
        self.tracer.config()
    }

    /// Observers registered on the builder.
    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// Create a disabled session.
    pub fn session<F>(&self, events: impl Into<EventSet>, callback: F) -> Result<TraceSession, VigilError>
    where
        F: Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static,
    {
        Ok(self.tracer.session(events, callback)?)
    }

    /// Create a session over the configured default events.
    pub fn session_with_default_events<F>(&self, callback: F) -> TraceSession
    where
        F: Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.tracer.session_with_default_events(callback)
    }

    /// Create a session and enable it globally.
    pub fn trace<F>(&self, events: impl Into<EventSet>, callback: F) -> Result<TraceSession, VigilError>
    where
        F: Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static,
    {
        Ok(self.tracer.trace(events, callback)?)
    }

    /// Create a disabled session over `events` feeding the registered
    /// observers.
    pub fn observe(&self, events: impl Into<EventSet>) -> Result<TraceSession, VigilError> {
        Ok(self.observers.attach(&self.tracer, events)?)
    }

    /// A main-thread context positioned at line 1 of `path`.
    pub fn main_context(&self, path: &str) -> ExecutionContext {
        vigil_host::main_context(self.tracer.clone(), path)
    }

    /// Run `body` as the top-level script at `path`.
    ///
    /// A top-level `return` ends the script with its value. An exception
    /// escaping the script becomes [`VigilError::Raised`].
    pub fn run<F>(&self, path: &str, body: F) -> Result<Value, VigilError>
    where
        F: FnOnce(&mut ExecutionContext) -> Flow,
    {
        let mut cx = self.main_context(path);
        vigil_host::settle(body(&mut cx)).map_err(VigilError::Raised)
    }

    /// Run `body` with every event in `events` recorded, and report.
    ///
    /// Up to `max_records` records are kept. Calls and returns are checked
    /// for balance whenever `events` includes any of them. Observers
    /// registered on the builder see the same events. An uncaught exception
    /// is part of the report, not an error.
    pub fn run_recorded<F>(
        &self,
        path: &str,
        events: EventSet,
        max_records: usize,
        body: F,
    ) -> Result<TraceReport, VigilError>
    where
        F: FnOnce(&mut ExecutionContext) -> Flow,
    {
        let recorder = Recorder::new(max_records);
        let balance = Arc::new(CallBalance::new());

        let observers = ObserverSet::new();
        observers.subscribe(Arc::new(self.observers.clone()));
        observers.subscribe(Arc::new(recorder.clone()));
        let checks_balance = !events.intersection(CallBalance::events()).is_empty();
        if checks_balance {
            observers.subscribe(balance.clone());
        }

        let session = observers.attach(&self.tracer, events)?;
        info!(path, events = %events, "Recording trace run");
        let result = {
            let mut cx = self.main_context(path);
            session.enable_scoped(EnableOptions::global(), || vigil_host::settle(body(&mut cx)))?
        };

        let mut report = TraceReport::new(
            Some(path.to_string()),
            RunOutcome::from_result(&result),
            self.tracer.stat(),
        )
        .with_records(recorder.drain(), recorder.dropped());
        if checks_balance {
            let balance = balance.report();
            report.add_info(format!(
                "Checked {} call/return records, max depth {}",
                balance.checked, balance.max_depth
            ));
            report = report.with_balance(balance);
        }
        if max_records > 0 && report.dropped_records > 0 {
            report.add_info(format!(
                "Record limit {max_records} reached, {} more not kept",
                report.dropped_records
            ));
        }
        if let Err(exception) = &result {
            report.add_warning(format!("Uncaught exception: {exception}"));
        }
        Ok(report)
    }

    /// Snapshot of the tracer's counters.
    pub fn stat(&self) -> TraceStats {
        self.tracer.stat()
    }

    /// Disable every enabled session. Returns how many were disabled.
    pub fn disable_all(&self) -> usize {
        self.tracer.disable_all()
    }
}

impl std::fmt::Debug for VigilRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VigilRuntime")
            .field("config", self.tracer.config())
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Errors from the Vigil runtime.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Tracing error.
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    /// Host engine error.
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// An exception escaped the traced program.
    #[error("Uncaught exception: {0}")]
    Raised(Exception),
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Main types
    pub use crate::{Vigil, VigilBuilder, VigilError, VigilRuntime};

    // Hook and host types
    pub use vigil_host::prelude::*;
    pub use vigil_host::{settle, ThreadHandle};

    // Observability types
    pub use vigil_observe::{
        CallBalance, LoggingObserver, ObserverSet, Recorder, TraceObserver, TraceRecord,
        TraceReport,
    };

    // Common std types
    pub use std::sync::Arc;
}
