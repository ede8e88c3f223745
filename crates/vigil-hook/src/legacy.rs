//! Legacy global and per-thread trace functions.
//!
//! A trace function is a session over [`EventSet::LEGACY`] whose callback
//! receives a flat [`LegacyEvent`] instead of a frame. At most one global
//! function is installed per tracer; installing another replaces it.

use std::sync::Arc;

use tracing::debug;

use vigil_core::{ContextId, EventSet, Exception, Symbol, TraceResult};

use crate::frame::{Binding, Frame};
use crate::scope::EnableOptions;
use crate::session::{Hook, TraceSession};
use crate::tracer::Tracer;

/// Arguments passed to a legacy trace function.
#[derive(Debug, Clone)]
pub struct LegacyEvent {
    /// Event name with dashes: `line`, `call`, `c-call`, ...
    pub event: &'static str,
    /// Source path.
    pub path: Option<String>,
    /// Line number.
    pub line: u32,
    /// Method name.
    pub id: Option<Symbol>,
    /// Local variables, absent for native calls.
    pub binding: Option<Binding>,
    /// Class owning the method.
    pub class: Option<Symbol>,
}

impl LegacyEvent {
    fn capture(frame: &Frame) -> TraceResult<Self> {
        Ok(Self {
            event: frame.event()?.legacy_name(),
            path: frame.path()?.map(str::to_string),
            line: frame.lineno()?,
            id: frame.method_id()?,
            binding: frame.binding()?,
            class: frame.defined_class()?,
        })
    }
}

fn adapt<F>(func: F) -> impl Fn(&mut Hook<'_>) -> Result<(), Exception> + Send + Sync + 'static
where
    F: Fn(&LegacyEvent) -> Result<(), Exception> + Send + Sync + 'static,
{
    move |hook: &mut Hook<'_>| {
        let event = LegacyEvent::capture(hook.frame())?;
        func(&event)
    }
}

impl Tracer {
    /// Install the global trace function, replacing any previous one.
    pub fn set_trace_func<F>(&self, func: F) -> TraceResult<()>
    where
        F: Fn(&LegacyEvent) -> Result<(), Exception> + Send + Sync + 'static,
    {
        let session = self.create(EventSet::LEGACY, Box::new(adapt(func)));
        let mut global = self.legacy().global.lock();
        if let Some(previous) = global.take() {
            TraceSession::from_parts(previous, self.clone()).disable();
        }
        session.enable(EnableOptions::global())?;
        *global = Some(Arc::clone(session.inner()));
        debug!(session = %session.id(), "Global trace function installed");
        Ok(())
    }

    /// Remove the global trace function. Returns whether one was installed.
    pub fn clear_trace_func(&self) -> bool {
        let previous = self.legacy().global.lock().take();
        match previous {
            Some(previous) => TraceSession::from_parts(previous, self.clone()).disable(),
            None => false,
        }
    }

    /// Add a trace function that only observes `context`.
    pub fn add_thread_trace_func<F>(&self, context: ContextId, func: F) -> TraceResult<()>
    where
        F: Fn(&LegacyEvent) -> Result<(), Exception> + Send + Sync + 'static,
    {
        let session = self.create(EventSet::LEGACY, Box::new(adapt(func)));
        session.enable(EnableOptions::thread(context))?;
        self.legacy()
            .per_thread
            .entry(context)
            .or_default()
            .push(Arc::clone(session.inner()));
        debug!(session = %session.id(), context = %context, "Thread trace function added");
        Ok(())
    }

    /// Replace every trace function on `context` with `func`.
    pub fn set_thread_trace_func<F>(&self, context: ContextId, func: F) -> TraceResult<()>
    where
        F: Fn(&LegacyEvent) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.clear_thread_trace_funcs(context);
        self.add_thread_trace_func(context, func)
    }

    /// Remove every trace function on `context`. Returns how many were removed.
    pub fn clear_thread_trace_funcs(&self, context: ContextId) -> usize {
        let Some((_, sessions)) = self.legacy().per_thread.remove(&context) else {
            return 0;
        };
        sessions
            .into_iter()
            .map(|inner| TraceSession::from_parts(inner, self.clone()))
            .filter(TraceSession::disable)
            .count()
    }

    /// Release per-thread state when a thread finishes.
    pub fn release_thread(&self, context: ContextId) {
        let removed = self.clear_thread_trace_funcs(context);
        if removed > 0 {
            debug!(context = %context, removed, "Released thread trace functions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Activation, ActivationKind, ExecutionContext};
    use crate::frame::Locals;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vigil_core::{EventKind, SourceLoc, Value};

    type Log = Arc<Mutex<Vec<(String, u32, bool)>>>;

    fn recorder(log: &Log) -> impl Fn(&LegacyEvent) -> Result<(), Exception> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event: &LegacyEvent| {
            log.lock()
                .push((event.event.to_string(), event.line, event.binding.is_some()));
            Ok(())
        }
    }

    fn context(tracer: &Tracer) -> ExecutionContext {
        let mut cx = ExecutionContext::new(tracer.clone());
        cx.push(
            Activation::new(ActivationKind::Top, Value::Nil)
                .at(&SourceLoc::new("legacy.rb", 4))
                .with_locals(Locals::new()),
        );
        cx
    }

    #[test]
    fn test_legacy_names_and_binding() {
        let tracer = Tracer::with_defaults();
        let mut cx = context(&tracer);
        let log: Log = Arc::default();
        tracer.set_trace_func(recorder(&log)).unwrap();

        cx.emit(EventKind::Line).unwrap();
        cx.push(Activation::new(ActivationKind::Native, Value::Nil).at(&SourceLoc::new("legacy.rb", 4)));
        cx.emit(EventKind::CCall).unwrap();
        cx.emit_return(EventKind::CReturn, Value::Nil).unwrap();
        cx.pop();
        cx.emit(EventKind::BCall).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                ("line".to_string(), 4, true),
                ("c-call".to_string(), 4, false),
                ("c-return".to_string(), 4, false),
            ]
        );
    }

    #[test]
    fn test_set_trace_func_replaces() {
        let tracer = Tracer::with_defaults();
        let mut cx = context(&tracer);
        let first: Log = Arc::default();
        let second: Log = Arc::default();
        tracer.set_trace_func(recorder(&first)).unwrap();
        tracer.set_trace_func(recorder(&second)).unwrap();
        assert_eq!(tracer.enabled_count(), 1);

        cx.emit(EventKind::Line).unwrap();
        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);

        assert!(tracer.clear_trace_func());
        assert!(!tracer.clear_trace_func());
        assert_eq!(tracer.enabled_count(), 0);
    }

    #[test]
    fn test_replaced_trace_func_never_shares_an_event() {
        let tracer = Tracer::with_defaults();
        let stop = Arc::new(AtomicBool::new(false));
        let emitter = {
            let tracer = tracer.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut cx = context(&tracer);
                let mut line = 0;
                while !stop.load(Ordering::Acquire) {
                    line += 1;
                    cx.set_line(line);
                    cx.emit(EventKind::Line).unwrap();
                }
            })
        };

        let first: Log = Arc::default();
        let second: Log = Arc::default();
        for round in 0..200 {
            let log = if round % 2 == 0 { &first } else { &second };
            tracer.set_trace_func(recorder(log)).unwrap();
            assert_eq!(tracer.enabled_count(), 1);
        }
        stop.store(true, Ordering::Release);
        emitter.join().unwrap();
        tracer.clear_trace_func();

        let seen: HashSet<u32> = first.lock().iter().map(|(_, line, _)| *line).collect();
        assert!(second.lock().iter().all(|(_, line, _)| !seen.contains(line)));
    }

    #[test]
    fn test_thread_trace_funcs() {
        let tracer = Tracer::with_defaults();
        let mut cx = context(&tracer);
        let mut other = context(&tracer);
        let log: Log = Arc::default();
        tracer.add_thread_trace_func(cx.id(), recorder(&log)).unwrap();
        tracer.add_thread_trace_func(cx.id(), recorder(&log)).unwrap();

        other.emit(EventKind::Line).unwrap();
        assert!(log.lock().is_empty());
        cx.emit(EventKind::Line).unwrap();
        assert_eq!(log.lock().len(), 2);

        tracer.set_thread_trace_func(cx.id(), recorder(&log)).unwrap();
        assert_eq!(tracer.enabled_count(), 1);

        tracer.release_thread(cx.id());
        assert_eq!(tracer.enabled_count(), 0);
    }
}
