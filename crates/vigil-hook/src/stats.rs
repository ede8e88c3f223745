//! Dispatch counters.
//!
//! Counters are plain atomics bumped with relaxed ordering; [`TraceStats`] is
//! a point-in-time snapshot suitable for reports.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use vigil_core::EventKind;

/// Live counters owned by a tracer.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    dispatch_enabled: bool,
    sessions_created: AtomicU64,
    enables: AtomicU64,
    events: [AtomicU64; EventKind::ALL.len()],
    callbacks_invoked: AtomicU64,
    callback_errors: AtomicU64,
    reentry_suppressed: AtomicU64,
    contention_skipped: AtomicU64,
}

impl StatsCollector {
    pub(crate) fn new(dispatch_enabled: bool) -> Self {
        Self {
            dispatch_enabled,
            sessions_created: AtomicU64::new(0),
            enables: AtomicU64::new(0),
            events: std::array::from_fn(|_| AtomicU64::new(0)),
            callbacks_invoked: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            reentry_suppressed: AtomicU64::new(0),
            contention_skipped: AtomicU64::new(0),
        }
    }

    pub(crate) fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_enabled(&self) {
        self.enables.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event(&self, kind: EventKind) {
        if self.dispatch_enabled {
            self.events[kind.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn callback(&self, failed: bool) {
        if self.dispatch_enabled {
            self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
            if failed {
                self.callback_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn suppressed(&self) {
        if self.dispatch_enabled {
            self.reentry_suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn contended(&self) {
        if self.dispatch_enabled {
            self.contention_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, sessions_enabled: usize) -> TraceStats {
        let events = EventKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let count = self.events[kind.index()].load(Ordering::Relaxed);
                (count > 0).then_some((kind, count))
            })
            .collect();

        TraceStats {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_enabled,
            enables: self.enables.load(Ordering::Relaxed),
            events,
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            reentry_suppressed: self.reentry_suppressed.load(Ordering::Relaxed),
            contention_skipped: self.contention_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a tracer's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStats {
    /// Sessions created over the tracer's lifetime.
    pub sessions_created: u64,
    /// Sessions enabled right now.
    pub sessions_enabled: usize,
    /// Transitions from disabled to enabled.
    pub enables: u64,
    /// Events that reached at least the dispatch step, by kind.
    pub events: BTreeMap<EventKind, u64>,
    /// Callbacks run.
    pub callbacks_invoked: u64,
    /// Callbacks that returned an exception.
    pub callback_errors: u64,
    /// Deliveries skipped because the session was already running.
    pub reentry_suppressed: u64,
    /// Deliveries skipped because waiting for the session's callback on
    /// another thread would have deadlocked.
    #[serde(default)]
    pub contention_skipped: u64,
}

impl TraceStats {
    /// Total events across all kinds.
    pub fn total_events(&self) -> u64 {
        self.events.values().sum()
    }

    /// Count for a single kind.
    pub fn events_of(&self, kind: EventKind) -> u64 {
        self.events.get(&kind).copied().unwrap_or(0)
    }
}
