//! Configuration types for the Vigil tracer.
//!
//! [`TracerConfig`] is deserializable so hosts and the CLI can load it from
//! TOML; every field has a default.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::event::EventSet;

/// Configuration for a tracer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Events used when a session is created without an explicit list.
    ///
    /// Defaults to every event.
    pub default_events: EventSet,

    /// Whether to maintain dispatch counters.
    ///
    /// Session creation and enable counts are always tracked; this covers
    /// the per-event and per-callback counters on the dispatch path.
    pub collect_stats: bool,

    /// Emit a `trace`-level log record for every delivered callback.
    pub log_dispatch: bool,

    /// Maximum nesting of callbacks on one execution context.
    ///
    /// Reentrant callbacks deeper than this raise `SystemStackError`.
    /// Defaults to 64.
    pub max_dispatch_depth: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            default_events: EventSet::ALL,
            collect_stats: true,
            log_dispatch: false,
            max_dispatch_depth: 64,
        }
    }
}

impl TracerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default event set.
    pub fn with_default_events(mut self, events: EventSet) -> Self {
        self.default_events = events;
        self
    }

    /// Enable or disable dispatch counters.
    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.collect_stats = enabled;
        self
    }

    /// Enable or disable per-callback logging.
    pub fn with_dispatch_logging(mut self, enabled: bool) -> Self {
        self.log_dispatch = enabled;
        self
    }

    /// Set the maximum callback nesting depth.
    pub fn with_max_dispatch_depth(mut self, depth: usize) -> Self {
        self.max_dispatch_depth = depth;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_dispatch_depth == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "max_dispatch_depth must be at least 1".to_string(),
            ));
        }
        if self.default_events.is_empty() {
            return Err(ConfigurationError::EmptyEventSet);
        }
        Ok(())
    }

    /// Configuration with the least dispatch overhead.
    ///
    /// Counters and logging are off.
    pub fn lean() -> Self {
        Self {
            collect_stats: false,
            log_dispatch: false,
            ..Self::default()
        }
    }

    /// Configuration for debugging instrumentation itself.
    ///
    /// Counters and per-callback logging are on, and reentrant nesting is
    /// kept shallow so runaway callbacks fail fast.
    pub fn diagnostic() -> Self {
        Self {
            collect_stats: true,
            log_dispatch: true,
            max_dispatch_depth: 16,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn test_defaults() {
        let config = TracerConfig::default();
        assert_eq!(config.default_events, EventSet::ALL);
        assert!(config.collect_stats);
        assert_eq!(config.max_dispatch_depth, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TracerConfig::new()
            .with_default_events(EventSet::from(EventKind::Line))
            .with_stats(false)
            .with_max_dispatch_depth(4);
        assert!(!config.collect_stats);
        assert_eq!(config.default_events.len(), 1);
        assert_eq!(config.max_dispatch_depth, 4);
    }

    #[test]
    fn test_validate_rejects_zero_depth() {
        let config = TracerConfig::new().with_max_dispatch_depth(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_presets() {
        assert!(!TracerConfig::lean().collect_stats);
        assert!(TracerConfig::diagnostic().log_dispatch);
    }
}
