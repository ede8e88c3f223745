//! A bounded in-memory collector of trace records.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use vigil_core::{EventKind, EventSet, TraceResult};
use vigil_hook::{TraceSession, Tracer};

use crate::observer::TraceObserver;
use crate::record::TraceRecord;

/// Collects records up to a cap; later records are counted, not kept.
///
/// Cloning is cheap; clones share the buffer.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
    filter: Option<EventSet>,
}

struct RecorderInner {
    records: RwLock<Vec<TraceRecord>>,
    max_records: usize,
    dropped: AtomicU64,
}

impl Recorder {
    /// Create a recorder keeping at most `max_records`.
    pub fn new(max_records: usize) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                records: RwLock::new(Vec::new()),
                max_records,
                dropped: AtomicU64::new(0),
            }),
            filter: None,
        }
    }

    /// Only keep events in `events` when used as an observer.
    pub fn with_filter(mut self, events: EventSet) -> Self {
        self.filter = Some(events);
        self
    }

    /// Create a disabled session over `events` that records into this recorder.
    pub fn attach(&self, tracer: &Tracer, events: impl Into<EventSet>) -> TraceResult<TraceSession> {
        let recorder = self.clone();
        let session = tracer.session(events, move |hook| {
            recorder.push(TraceRecord::capture(hook.frame())?);
            Ok(())
        })?;
        debug!(session = %session.id(), max_records = self.inner.max_records, "Recorder attached");
        Ok(session)
    }

    /// Store a record, or count it as dropped when full.
    pub fn push(&self, record: TraceRecord) {
        let mut records = self.inner.records.write();
        if records.len() < self.inner.max_records {
            records.push(record);
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Collected records.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.inner.records.read().clone()
    }

    /// Event kinds of collected records, in order.
    pub fn events(&self) -> Vec<EventKind> {
        self.inner.records.read().iter().map(|r| r.event).collect()
    }

    /// Take every collected record, leaving the recorder empty.
    pub fn drain(&self) -> Vec<TraceRecord> {
        std::mem::take(&mut *self.inner.records.write())
    }

    /// Clear collected records and the dropped counter.
    pub fn clear(&self) {
        self.inner.records.write().clear();
        self.inner.dropped.store(0, Ordering::Relaxed);
    }

    /// Number of collected records.
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    /// Whether nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    /// Records discarded because the recorder was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl TraceObserver for Recorder {
    fn on_record(&self, record: &TraceRecord) {
        self.push(record.clone());
    }

    fn event_filter(&self) -> Option<EventSet> {
        self.filter
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("len", &self.len())
            .field("max_records", &self.inner.max_records)
            .field("dropped", &self.dropped())
            .finish()
    }
}
