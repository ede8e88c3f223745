//! The session registry.
//!
//! A [`Tracer`] owns every enabled registration. The registry is a
//! copy-on-write list kept in enable order: dispatch takes a cheap snapshot
//! (one `Arc` clone) and walks it newest first, so sessions enabled or
//! disabled by a callback never disturb the walk in progress. A union mask of
//! all registered events lets instrumentation points bail out with a single
//! atomic load when nobody is listening.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use vigil_core::{
    ConfigurationError, ContextId, EventKind, EventSet, Exception, SessionId, TraceResult,
    TracerConfig,
};

use crate::context::current_context_id;
use crate::gate::GuardTable;
use crate::scope::Scope;
use crate::session::{Hook, SessionInner, TraceSession};
use crate::stats::{StatsCollector, TraceStats};

/// One enabled session under one scope.
pub(crate) struct Registration {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) scope: Scope,
    pub(crate) events: EventSet,
    active: AtomicBool,
}

impl Registration {
    fn new(session: Arc<SessionInner>, scope: Scope) -> Self {
        let events = scope.effective_events(session.events);
        Self {
            session,
            scope,
            events,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }
}

pub(crate) type Snapshot = Arc<Vec<Arc<Registration>>>;

/// Legacy trace functions installed through [`Tracer::set_trace_func`] and
/// the per-thread variants.
#[derive(Default)]
pub(crate) struct LegacyHooks {
    pub(crate) global: Mutex<Option<Arc<SessionInner>>>,
    pub(crate) per_thread: DashMap<ContextId, Vec<Arc<SessionInner>>>,
}

struct TracerInner {
    config: TracerConfig,
    registry: RwLock<Snapshot>,
    mask: AtomicU32,
    stats: StatsCollector,
    legacy: LegacyHooks,
    guards: GuardTable,
}

/// Entry point for creating sessions and querying tracing state.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Create a tracer with the given configuration.
    pub fn new(config: TracerConfig) -> TraceResult<Self> {
        config.validate()?;
        debug!(
            default_events = %config.default_events,
            collect_stats = config.collect_stats,
            max_dispatch_depth = config.max_dispatch_depth,
            "Creating tracer"
        );
        let stats = StatsCollector::new(config.collect_stats);
        Ok(Self {
            inner: Arc::new(TracerInner {
                config,
                registry: RwLock::new(Arc::new(Vec::new())),
                mask: AtomicU32::new(0),
                stats,
                legacy: LegacyHooks::default(),
                guards: GuardTable::default(),
            }),
        })
    }

    /// Create a tracer with the default configuration.
    pub fn with_defaults() -> Self {
        let config = TracerConfig::default();
        Self {
            inner: Arc::new(TracerInner {
                stats: StatsCollector::new(config.collect_stats),
                config,
                registry: RwLock::new(Arc::new(Vec::new())),
                mask: AtomicU32::new(0),
                legacy: LegacyHooks::default(),
                guards: GuardTable::default(),
            }),
        }
    }

    /// The tracer's configuration.
    pub fn config(&self) -> &TracerConfig {
        &self.inner.config
    }

    /// Create a disabled session watching `events`.
    pub fn session<F>(&self, events: impl Into<EventSet>, callback: F) -> TraceResult<TraceSession>
    where
        F: Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static,
    {
        let events = events.into();
        if events.is_empty() {
            return Err(ConfigurationError::EmptyEventSet.into());
        }
        Ok(self.create(events, Box::new(callback)))
    }

    /// Create a disabled session watching the configured default events.
    pub fn session_with_default_events<F>(&self, callback: F) -> TraceSession
    where
        F: Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.create(self.inner.config.default_events, Box::new(callback))
    }

    /// Create a session and enable it globally.
    pub fn trace<F>(&self, events: impl Into<EventSet>, callback: F) -> TraceResult<TraceSession>
    where
        F: Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static,
    {
        let session = self.session(events, callback)?;
        session.enable(crate::scope::EnableOptions::global())?;
        Ok(session)
    }

    pub(crate) fn create(
        &self,
        events: EventSet,
        callback: Box<crate::session::Callback>,
    ) -> TraceSession {
        let inner = Arc::new(SessionInner::new(events, callback));
        self.inner.stats.session_created();
        debug!(session = %inner.id, events = %events, "Trace session created");
        TraceSession::from_parts(inner, self.clone())
    }

    /// Whether any enabled session could receive `kind`.
    pub fn wants(&self, kind: EventKind) -> bool {
        self.inner.mask.load(Ordering::Acquire) & kind.bit() != 0
    }

    /// Union of the events of every enabled session.
    pub fn active_events(&self) -> EventSet {
        EventSet::from_bits(self.inner.mask.load(Ordering::Acquire))
    }

    /// Number of enabled sessions.
    pub fn enabled_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Snapshot of the tracer's counters.
    pub fn stat(&self) -> TraceStats {
        self.inner.stats.snapshot(self.enabled_count())
    }

    /// Disable every enabled session.
    pub fn disable_all(&self) -> usize {
        let snapshot = self.snapshot();
        let count = snapshot
            .iter()
            .map(|registration| {
                TraceSession::from_parts(Arc::clone(&registration.session), self.clone())
            })
            .filter(TraceSession::disable)
            .count();
        info!(count, "Disabled all trace sessions");
        count
    }

    /// Run `body`, a blocking wait on another host thread.
    ///
    /// Called from inside a callback, the calling thread gives up its
    /// session guards until `body` returns, so the awaited thread's events
    /// still reach those sessions.
    pub fn blocking<R>(&self, body: impl FnOnce() -> R) -> R {
        match current_context_id() {
            Some(context) => self.inner.guards.suspended(context, body),
            None => body(),
        }
    }

    pub(crate) fn guards(&self) -> &GuardTable {
        &self.inner.guards
    }

    pub(crate) fn stats(&self) -> &StatsCollector {
        &self.inner.stats
    }

    pub(crate) fn legacy(&self) -> &LegacyHooks {
        &self.inner.legacy
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.inner.registry.read())
    }

    /// Register (or re-register) a session. The new registration becomes the
    /// most recent one.
    pub(crate) fn register(&self, session: &Arc<SessionInner>, scope: Scope) {
        let registration = Arc::new(Registration::new(Arc::clone(session), scope));
        let mut registry = self.inner.registry.write();
        let mut next = Vec::with_capacity(registry.len() + 1);
        for existing in registry.iter() {
            if existing.session.id == session.id {
                existing.retire();
            } else {
                next.push(Arc::clone(existing));
            }
        }
        next.push(registration);
        self.publish(&mut registry, next);
    }

    /// Remove a session's registration. Returns whether one existed.
    pub(crate) fn unregister(&self, id: SessionId) -> bool {
        let mut registry = self.inner.registry.write();
        let mut removed = false;
        let next: Vec<_> = registry
            .iter()
            .filter(|existing| {
                if existing.session.id == id {
                    existing.retire();
                    removed = true;
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        if removed {
            self.publish(&mut registry, next);
        }
        removed
    }

    fn publish(&self, registry: &mut Snapshot, next: Vec<Arc<Registration>>) {
        let mask = next
            .iter()
            .fold(EventSet::EMPTY, |mask, registration| mask | registration.events);
        self.inner.mask.store(mask.bits(), Ordering::Release);
        *registry = Arc::new(next);
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled_sessions", &self.enabled_count())
            .field("active_events", &self.active_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{EnableOptions, TargetCallable};
    use vigil_core::DefId;

    #[test]
    fn test_empty_event_set_rejected() {
        let tracer = Tracer::with_defaults();
        let result = tracer.session(EventSet::EMPTY, |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TracerConfig::new().with_max_dispatch_depth(0);
        assert!(Tracer::new(config).is_err());
    }

    #[test]
    fn test_mask_tracks_registrations() {
        let tracer = Tracer::with_defaults();
        assert!(!tracer.wants(EventKind::Call));

        let calls = tracer.trace(EventKind::Call, |_| Ok(())).unwrap();
        let lines = tracer.trace(EventKind::Line, |_| Ok(())).unwrap();
        assert!(tracer.wants(EventKind::Call));
        assert!(tracer.wants(EventKind::Line));
        assert_eq!(tracer.enabled_count(), 2);

        calls.disable();
        assert!(!tracer.wants(EventKind::Call));
        assert!(tracer.wants(EventKind::Line));

        lines.disable();
        assert!(tracer.active_events().is_empty());
    }

    #[test]
    fn test_target_scope_narrows_mask() {
        let tracer = Tracer::with_defaults();
        let session = tracer
            .session(EventSet::of(&[EventKind::Raise, EventKind::Call]), |_| Ok(()))
            .unwrap();
        session
            .enable(EnableOptions::target(TargetCallable::Method(DefId::next())))
            .unwrap();
        assert!(tracer.wants(EventKind::Call));
        assert!(!tracer.wants(EventKind::Raise));
    }

    #[test]
    fn test_stat_counts_sessions() {
        let tracer = Tracer::with_defaults();
        let a = tracer.trace(EventKind::Line, |_| Ok(())).unwrap();
        let _b = tracer.session(EventKind::Line, |_| Ok(())).unwrap();

        let stats = tracer.stat();
        assert_eq!(stats.sessions_created, 2);
        assert_eq!(stats.sessions_enabled, 1);
        assert_eq!(stats.enables, 1);

        a.disable();
        assert_eq!(tracer.stat().sessions_enabled, 0);
    }

    #[test]
    fn test_disable_all() {
        let tracer = Tracer::with_defaults();
        let a = tracer.trace(EventKind::Line, |_| Ok(())).unwrap();
        let b = tracer.trace(EventKind::Call, |_| Ok(())).unwrap();
        assert_eq!(tracer.disable_all(), 2);
        assert!(!a.is_enabled());
        assert!(!b.is_enabled());
    }
}
