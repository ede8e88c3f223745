//! Observers of captured trace records.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use vigil_core::{EventSet, TraceResult};
use vigil_hook::{TraceSession, Tracer};

use crate::record::TraceRecord;

/// Receives captured trace records.
pub trait TraceObserver: Send + Sync {
    /// Called once per delivered event.
    fn on_record(&self, record: &TraceRecord);

    /// Event kinds this observer wants. `None` means all.
    fn event_filter(&self) -> Option<EventSet> {
        None
    }
}

/// Fans one trace session out to many observers.
///
/// The record is captured once per event and handed to every observer whose
/// filter admits it, in subscription order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<RwLock<Vec<Arc<dyn TraceObserver>>>>,
}

impl ObserverSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    pub fn subscribe(&self, observer: Arc<dyn TraceObserver>) {
        self.observers.write().push(observer);
    }

    /// Remove all observers.
    pub fn clear(&self) {
        self.observers.write().clear();
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether there are no observers.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Deliver a record to every interested observer.
    pub fn publish(&self, record: &TraceRecord) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            if let Some(filter) = observer.event_filter() {
                if !filter.contains(record.event) {
                    continue;
                }
            }
            observer.on_record(record);
        }
    }

    /// Create a disabled session over `events` that publishes to this set.
    pub fn attach(&self, tracer: &Tracer, events: impl Into<EventSet>) -> TraceResult<TraceSession> {
        let set = self.clone();
        tracer.session(events, move |hook| {
            let record = TraceRecord::capture(hook.frame())?;
            set.publish(&record);
            Ok(())
        })
    }
}

impl TraceObserver for ObserverSet {
    fn on_record(&self, record: &TraceRecord) {
        self.publish(record);
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}
