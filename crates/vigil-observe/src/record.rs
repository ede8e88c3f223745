//! Owned copies of trace events.
//!
//! A [`Frame`] dies with its callback. A [`TraceRecord`] is what survives:
//! every attribute defined for the event, copied out while the frame is live.

use std::fmt;

use serde::{Deserialize, Serialize};

use vigil_core::{
    Attribute, Availability, ContextId, EventKind, FiberId, Symbol, TraceResult, Value,
};
use vigil_hook::Frame;

/// A captured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Event kind.
    pub event: EventKind,
    /// Source path, absent for thread events.
    pub path: Option<String>,
    /// Line number, `0` for thread events.
    pub lineno: u32,
    /// Original method name.
    pub method_id: Option<Symbol>,
    /// Name the method was called by.
    pub callee_id: Option<Symbol>,
    /// Class owning the method.
    pub defined_class: Option<Symbol>,
    /// Receiver, rendered.
    pub receiver: String,
    /// Value being returned, for return-family events.
    pub return_value: Option<Value>,
    /// Exception in flight, rendered, for `raise` and `rescue`.
    pub exception: Option<String>,
    /// Compiled source path, for `script_compiled`.
    pub compiled_path: Option<String>,
    /// Thread the event occurred on.
    pub context: ContextId,
    /// Fiber the event occurred on.
    pub fiber: FiberId,
}

impl TraceRecord {
    /// Copy everything defined for the frame's event.
    pub fn capture(frame: &Frame) -> TraceResult<Self> {
        let event = frame.event()?;
        let defined = |attribute| event.availability(attribute) != Availability::Undefined;

        Ok(Self {
            event,
            path: frame.path()?.map(str::to_string),
            lineno: frame.lineno()?,
            method_id: frame.method_id()?,
            callee_id: frame.callee_id()?,
            defined_class: frame.defined_class()?,
            receiver: frame.self_value()?.to_string(),
            return_value: if defined(Attribute::ReturnValue) {
                Some(frame.return_value()?)
            } else {
                None
            },
            exception: if defined(Attribute::RaisedException) {
                Some(frame.raised_exception()?.to_string())
            } else {
                None
            },
            compiled_path: if defined(Attribute::CompiledPath) {
                frame.compiled_path()?.map(str::to_string)
            } else {
                None
            },
            context: frame.context()?,
            fiber: frame.fiber()?,
        })
    }

    /// `Class#method` when both are known.
    pub fn qualified_name(&self) -> Option<String> {
        let method = self.method_id.as_ref()?;
        Some(match &self.defined_class {
            Some(class) => format!("{class}#{method}"),
            None => method.to_string(),
        })
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<15}", self.event.name())?;
        match &self.path {
            Some(path) => write!(f, " {path}:{}", self.lineno)?,
            None => write!(f, " {}", self.receiver)?,
        }
        if let Some(name) = self.qualified_name() {
            write!(f, " {name}")?;
            if let Some(callee) = self.callee_id.as_ref().filter(|c| Some(*c) != self.method_id.as_ref()) {
                write!(f, " (as {callee})")?;
            }
        }
        if let Some(value) = &self.return_value {
            write!(f, " => {value}")?;
        }
        if let Some(exception) = &self.exception {
            write!(f, " ! {exception}")?;
        }
        if let Some(path) = &self.compiled_path {
            write!(f, " <- {path}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use vigil_core::{CodeBody, SourceLoc};
    use vigil_hook::Tracer;
    use vigil_host::{main_context, Class, Interpreter};

    #[test]
    fn test_capture_return() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer.clone(), "app.rb");
        let class = Class::new("Greeter");
        class.define(
            "hello",
            CodeBody::new("hello", SourceLoc::new("app.rb", 2)).with_end_line(4),
            |_, _| Ok(Value::str("hi")),
        );
        let hi = class.alias("hi", "hello").unwrap();

        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let _session = tracer
            .trace(EventKind::Return, move |hook| {
                sink.lock().push(TraceRecord::capture(hook.frame())?);
                Ok(())
            })
            .unwrap();
        cx.invoke(&hi, class.instance(), Vec::new(), None).unwrap();

        let records = captured.lock();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.lineno, 4);
        assert_eq!(record.return_value, Some(Value::str("hi")));
        assert_eq!(record.exception, None);
        assert_eq!(record.qualified_name().as_deref(), Some("Greeter#hello"));
        assert_eq!(
            record.to_string(),
            "return          app.rb:4 Greeter#hello (as hi) => \"hi\""
        );
    }

    #[test]
    fn test_capture_thread_event_has_no_path() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer.clone(), "app.rb");
        let captured = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        let _session = tracer
            .trace(EventKind::ThreadBegin, move |hook| {
                *sink.lock() = Some(TraceRecord::capture(hook.frame())?);
                Ok(())
            })
            .unwrap();
        cx.emit_thread(EventKind::ThreadBegin).unwrap();

        let record = captured.lock().take().unwrap();
        assert_eq!(record.path, None);
        assert_eq!(record.lineno, 0);
        assert_eq!(record.receiver, Value::Thread(cx.id()).to_string());
    }
}
