//! An observer that turns trace records into log records.

use tracing::Level;

use vigil_core::{EventKind, EventSet};

use crate::observer::TraceObserver;
use crate::record::TraceRecord;

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            tracing::error!($($arg)+)
        } else if level == Level::WARN {
            tracing::warn!($($arg)+)
        } else if level == Level::INFO {
            tracing::info!($($arg)+)
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    }};
}

/// Logs every record it receives through `tracing`.
///
/// Exceptions are logged at `WARN` or the configured level, whichever is
/// more severe.
#[derive(Debug, Clone)]
pub struct LoggingObserver {
    /// Level for ordinary events.
    pub log_level: Level,
    /// Event kinds to log. `None` logs everything.
    pub events: Option<EventSet>,
}

impl LoggingObserver {
    /// Create an observer logging at `DEBUG`.
    pub fn new() -> Self {
        Self {
            log_level: Level::DEBUG,
            events: None,
        }
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Only log `events`.
    pub fn with_events(mut self, events: EventSet) -> Self {
        self.events = Some(events);
        self
    }

    fn level_for(&self, event: EventKind) -> Level {
        match event {
            EventKind::Raise if self.log_level > Level::WARN => Level::WARN,
            _ => self.log_level,
        }
    }
}

impl Default for LoggingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceObserver for LoggingObserver {
    fn on_record(&self, record: &TraceRecord) {
        let method = record.qualified_name();
        match record.event {
            EventKind::Raise | EventKind::Rescue => {
                log_at!(
                    self.level_for(record.event),
                    event = record.event.name(),
                    context = %record.context,
                    path = ?record.path,
                    line = record.lineno,
                    exception = ?record.exception,
                    "Exception event"
                );
            }
            EventKind::ThreadBegin
            | EventKind::ThreadEnd
            | EventKind::FiberSwitch => {
                log_at!(
                    self.level_for(record.event),
                    event = record.event.name(),
                    context = %record.context,
                    fiber = %record.fiber,
                    "Context event"
                );
            }
            _ => {
                log_at!(
                    self.level_for(record.event),
                    event = record.event.name(),
                    context = %record.context,
                    path = ?record.path,
                    line = record.lineno,
                    method = ?method,
                    return_value = ?record.return_value,
                    "Trace event"
                );
            }
        }
    }

    fn event_filter(&self) -> Option<EventSet> {
        self.events
    }
}
