//! Vigil Observe - records, observers and reports
//!
//! This crate turns live trace events into owned data that outlives the
//! callback:
//!
//! - [`TraceRecord`]: an owned snapshot of one event's readable attributes
//! - [`Recorder`]: a bounded in-memory collector
//! - [`ObserverSet`]: one session fanned out to many [`TraceObserver`]s
//! - [`LoggingObserver`]: records forwarded to `tracing`
//! - [`CallBalance`]: checks that calls and returns nest per thread and fiber
//! - [`TraceReport`]: outcome, counters, records and diagnostics of a run
//!
//! # Recording
//!
//! ```ignore
//! use vigil_observe::Recorder;
//!
//! let recorder = Recorder::new(10_000);
//! let session = recorder.attach(&tracer, EventSet::ALL)?;
//! session.enable_scoped(EnableOptions::global(), || {
//!     // ... run host code ...
//! })?;
//!
//! for record in recorder.records() {
//!     println!("{record}");
//! }
//! ```
//!
//! # Fan-out
//!
//! ```ignore
//! use std::sync::Arc;
//! use vigil_observe::{CallBalance, LoggingObserver, ObserverSet};
//!
//! let observers = ObserverSet::new();
//! let balance = Arc::new(CallBalance::new());
//! observers.subscribe(balance.clone());
//! observers.subscribe(Arc::new(LoggingObserver::new()));
//!
//! let session = observers.attach(&tracer, EventSet::ALL)?;
//! // ...
//! assert!(balance.report().is_balanced());
//! ```

pub mod balance;
pub mod logging;
pub mod observer;
pub mod record;
pub mod recorder;
pub mod report;

pub use balance::{BalanceReport, CallBalance, CallFamily, Violation};
pub use logging::LoggingObserver;
pub use observer::{ObserverSet, TraceObserver};
pub use record::TraceRecord;
pub use recorder::Recorder;
pub use report::{Diagnostic, DiagnosticLevel, ReportId, RunOutcome, TraceReport};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::balance::CallBalance;
    pub use crate::observer::{ObserverSet, TraceObserver};
    pub use crate::record::TraceRecord;
    pub use crate::recorder::Recorder;
    pub use crate::report::{RunOutcome, TraceReport};
}
