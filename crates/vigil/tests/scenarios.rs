//! End-to-end tracing scenarios on the main thread.

use parking_lot::Mutex;
use vigil::prelude::*;
use vigil::vigil_core::{ReentrancyError, ScopeConflictError, StaleAccessError};

type Log = Arc<Mutex<Vec<String>>>;

fn loc(line: u32) -> SourceLoc {
    SourceLoc::new("app.rb", line)
}

/// A session logging `event:line`, or `event:value` for return kinds.
fn recording(runtime: &VigilRuntime, events: impl Into<EventSet>) -> (TraceSession, Log) {
    let log: Log = Arc::default();
    let sink = Arc::clone(&log);
    let session = runtime
        .session(events, move |hook| {
            let kind = hook.event()?;
            let entry = if kind.is_return() {
                format!("{kind}:{}", hook.return_value()?)
            } else {
                format!("{kind}:{}", hook.lineno()?)
            };
            sink.lock().push(entry);
            Ok(())
        })
        .unwrap();
    (session, log)
}

fn counter(runtime: &VigilRuntime, events: impl Into<EventSet>) -> (TraceSession, Arc<Mutex<usize>>) {
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    let session = runtime
        .session(events, move |_| {
            *sink.lock() += 1;
            Ok(())
        })
        .unwrap();
    (session, count)
}

#[test]
fn test_rescued_exception_reports_only_call_and_return() {
    let runtime = Vigil::with_defaults().unwrap();
    let class = Class::new("Parser");
    let parse = class.define("parse", CodeBody::new("parse", loc(1)).with_end_line(7), |cx, _| {
        cx.line(2)?;
        cx.rescue(
            5,
            |cx| {
                cx.line(3)?;
                Err(cx.raise(Exception::argument_error("bad input")))
            },
            |cx, _| {
                cx.line(6)?;
                Ok(Value::sym("fallback"))
            },
        )
    });
    let (session, log) = recording(&runtime, EventSet::A_CALL | EventSet::A_RETURN);
    session.enable(EnableOptions::global()).unwrap();

    let value = runtime
        .run("app.rb", |cx| cx.invoke(&parse, class.instance(), Vec::new(), None))
        .unwrap();

    assert_eq!(value, Value::sym("fallback"));
    assert_eq!(*log.lock(), vec!["call:1", "return::fallback"]);
}

#[test]
fn test_sessions_dispatch_most_recent_first() {
    let runtime = Vigil::with_defaults().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let sessions: Vec<TraceSession> = (0..3)
        .map(|n| {
            let sink = Arc::clone(&order);
            runtime
                .trace(EventKind::Line, move |_| {
                    sink.lock().push(n);
                    Ok(())
                })
                .unwrap()
        })
        .collect();

    runtime.run("app.rb", |cx| cx.line(1).map(|()| Value::Nil)).unwrap();

    assert_eq!(*order.lock(), vec![2, 1, 0]);
    assert_eq!(sessions.iter().filter(|s| s.disable()).count(), 3);
}

#[test]
fn test_target_does_not_follow_shared_closure_body() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let class = Class::new("Shared");
    let body = cx.block(loc(10), |cx, _| {
        cx.line(11)?;
        Ok(Value::Nil)
    });
    let first = class.define_bmethod("first", &body);
    let second = class.define_bmethod("second", &body);

    let (session, log) = recording(&runtime, EventSet::ALL);
    session
        .enable(EnableOptions::target(first.target().unwrap()))
        .unwrap();

    cx.invoke(&second, class.instance(), Vec::new(), None).unwrap();
    assert!(log.lock().is_empty());

    cx.invoke(&first, class.instance(), Vec::new(), None).unwrap();
    assert_eq!(
        *log.lock(),
        vec!["call:10", "b_call:10", "line:11", "b_return:nil", "return:nil"]
    );
}

#[test]
fn test_sessions_on_shared_body_bmethods_fire_independently() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let class = Class::new("Twins");
    let body = cx.block(loc(20), |cx, _| {
        cx.line(21)?;
        Ok(Value::Nil)
    });
    let left = class.define_bmethod("left", &body);
    let right = class.define_bmethod("right", &body);

    let (left_session, left_count) = counter(&runtime, EventKind::Line);
    let (right_session, right_count) = counter(&runtime, EventKind::Line);
    left_session
        .enable(EnableOptions::target(left.target().unwrap()))
        .unwrap();
    right_session
        .enable(EnableOptions::target(right.target().unwrap()))
        .unwrap();

    cx.invoke(&left, class.instance(), Vec::new(), None).unwrap();
    cx.invoke(&left, class.instance(), Vec::new(), None).unwrap();
    cx.invoke(&right, class.instance(), Vec::new(), None).unwrap();

    assert_eq!(*left_count.lock(), 2);
    assert_eq!(*right_count.lock(), 1);
}

#[test]
fn test_target_line_restricts_to_one_line() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let class = Class::new("Steps");
    let steps = class.define("steps", CodeBody::new("steps", loc(1)).with_end_line(5), |cx, _| {
        cx.line(2)?;
        cx.line(3)?;
        cx.line(4)?;
        Ok(Value::Nil)
    });
    let (session, log) = recording(&runtime, EventKind::Line | EventKind::Call);
    session
        .enable(EnableOptions::target(steps.target().unwrap()).with_line(3))
        .unwrap();

    cx.line(3).unwrap();
    cx.invoke(&steps, class.instance(), Vec::new(), None).unwrap();
    cx.invoke(&steps, class.instance(), Vec::new(), None).unwrap();

    assert_eq!(*log.lock(), vec!["line:3", "line:3"]);
}

#[test]
fn test_target_line_requires_line_event() {
    let runtime = Vigil::with_defaults().unwrap();
    let class = Class::new("Steps");
    let steps = class.define("steps", CodeBody::new("steps", loc(1)), |_, _| Ok(Value::Nil));
    let (session, _log) = recording(&runtime, EventKind::Call);

    let err = session
        .enable(EnableOptions::target(steps.target().unwrap()).with_line(3))
        .unwrap_err();
    assert_eq!(err.exception_class(), "ArgumentError");
    assert!(!session.is_enabled());
}

#[test]
fn test_nested_target_enable_conflicts() {
    let runtime = Vigil::with_defaults().unwrap();
    let class = Class::new("Nest");
    let method = class.define("run", CodeBody::new("run", loc(1)), |_, _| Ok(Value::Nil));
    let target = method.target().unwrap();

    let (session, _log) = recording(&runtime, EventKind::Call);
    session.enable(EnableOptions::target(target)).unwrap();
    let err = session.enable(EnableOptions::target(target)).unwrap_err();
    assert_eq!(
        err,
        TraceError::ScopeConflict(ScopeConflictError::NestedTargetConflict)
    );
    assert!(session.disable());

    session.enable(EnableOptions::global()).unwrap();
    let err = session.enable(EnableOptions::target(target)).unwrap_err();
    assert_eq!(
        err,
        TraceError::ScopeConflict(ScopeConflictError::NestedTargetConflict)
    );
    assert_eq!(session.scope(), Some(Scope::Global));
}

#[test]
fn test_callee_id_reports_alias_used_at_call_site() {
    let runtime = Vigil::with_defaults().unwrap();
    let class = Class::new("Greeter");
    class.define("hello", CodeBody::new("hello", loc(1)), |_, _| Ok(Value::str("hi")));
    let hi = class.alias("hi", "hello").unwrap();

    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&names);
    let _session = runtime
        .trace(EventKind::Call, move |hook| {
            sink.lock().push((hook.method_id()?, hook.callee_id()?));
            Ok(())
        })
        .unwrap();

    runtime
        .run("app.rb", |cx| {
            cx.send(&class, class.instance(), "hello", Vec::new(), None)?;
            cx.invoke(&hi, class.instance(), Vec::new(), None)
        })
        .unwrap();

    assert_eq!(
        *names.lock(),
        vec![
            (Some(Symbol::from("hello")), Some(Symbol::from("hello"))),
            (Some(Symbol::from("hello")), Some(Symbol::from("hi"))),
        ]
    );
}

#[test]
fn test_break_from_native_iterator_reports_values() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let array = Class::new("Array");
    let each = array.define_native("each", Vec::new(), |cx, inv| {
        if let Some(block) = &inv.block {
            for n in 1..=3 {
                cx.yield_block(block, &[Value::from(n)])?;
            }
        }
        Ok(inv.receiver.clone())
    });
    let block = cx.block_with(
        CodeBody::new("block in <main>", loc(2)).with_parameters(vec![Parameter::req("x")]),
        false,
        |cx, _| match cx.local_get("x") {
            Value::Integer(2) => Err(cx.break_with(Value::from(20))),
            _ => Ok(Value::Nil),
        },
    );
    let (session, log) = recording(&runtime, EventSet::A_CALL | EventSet::A_RETURN);
    session.enable(EnableOptions::global()).unwrap();

    cx.line(2).unwrap();
    let result = cx
        .invoke(&each, array.instance(), Vec::new(), Some(block))
        .unwrap();

    assert_eq!(result, Value::from(20));
    assert_eq!(
        *log.lock(),
        vec![
            "c_call:2",
            "b_call:2",
            "b_return:nil",
            "b_call:2",
            "b_return:20",
            "c_return:nil"
        ]
    );
}

#[test]
fn test_frame_expires_after_callback() {
    let runtime = Vigil::with_defaults().unwrap();
    let kept: Arc<Mutex<Option<Frame>>> = Arc::default();
    let sink = Arc::clone(&kept);
    let _session = runtime
        .trace(EventKind::Line, move |hook| {
            assert_eq!(hook.lineno()?, 4);
            *sink.lock() = Some(hook.frame().clone());
            Ok(())
        })
        .unwrap();

    runtime.run("app.rb", |cx| cx.line(4).map(|()| Value::Nil)).unwrap();

    let frame = kept.lock().take().unwrap();
    assert!(!frame.is_live());
    assert_eq!(
        frame.lineno().unwrap_err(),
        TraceError::StaleAccess(StaleAccessError::FrameExpired)
    );
    assert_eq!(frame.event().unwrap_err().to_string(), "Stale access: access from outside");
}

#[test]
fn test_reentry_requires_opt_in() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");

    let plain = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&plain);
    let session = runtime
        .session(EventKind::Line, move |hook| {
            *sink.lock() += 1;
            hook.context().line(99).map_err(Unwind::into_exception)?;
            Ok(())
        })
        .unwrap();
    session
        .enable_scoped(EnableOptions::global(), || cx.line(1))
        .unwrap()
        .unwrap();
    assert_eq!(*plain.lock(), 1);

    let reentrant = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reentrant);
    let session = runtime
        .session(EventKind::Line, move |hook| {
            let line = hook.lineno()?;
            sink.lock().push(line);
            if line != 99 {
                hook.allow_reentry(|cx| cx.line(99))?
                    .map_err(Unwind::into_exception)?;
            }
            Ok(())
        })
        .unwrap();
    session
        .enable_scoped(EnableOptions::global(), || cx.line(1))
        .unwrap()
        .unwrap();
    assert_eq!(*reentrant.lock(), vec![1, 99]);
    assert!(runtime.stat().reentry_suppressed >= 1);
}

#[test]
fn test_session_cannot_reenable_itself_from_its_callback() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let session = runtime
        .trace(EventKind::Line, move |hook| {
            let session = hook.session().clone();
            let scoped = session.enable_scoped(EnableOptions::global(), || ());
            let plain = session.enable(EnableOptions::current_thread());
            sink.lock().push((scoped, plain));
            Ok(())
        })
        .unwrap();

    cx.line(1).unwrap();
    let rejected = TraceError::from(ReentrancyError::RecursiveActivation);
    assert_eq!(*outcomes.lock(), vec![(Err(rejected.clone()), Err(rejected))]);
    assert_eq!(session.scope(), Some(Scope::Global));
    assert_eq!(
        TraceError::from(ReentrancyError::RecursiveActivation).exception_class(),
        "RuntimeError"
    );
}

#[test]
fn test_session_reenables_itself_inside_allow_reentry() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let session = runtime
        .trace(EventKind::Line, move |hook| {
            sink.lock().push(hook.lineno()?);
            let session = hook.session().clone();
            let narrowed = hook.allow_reentry(|_| session.enable(EnableOptions::current_thread()))?;
            narrowed.map_err(Exception::from)?;
            Ok(())
        })
        .unwrap();

    cx.line(1).unwrap();
    assert_eq!(session.scope(), Some(Scope::Thread(cx.id())));

    // Still delivered on this thread, no longer on others.
    cx.line(2).unwrap();
    let handle = spawn_thread(&cx, |cx| {
        cx.line(30)?;
        Ok(Value::Nil)
    })
    .unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(*lines.lock(), vec![1, 2]);
    session.disable();
}

#[test]
fn test_line_events_for_every_loop_iteration() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let integer = Class::new("Integer");
    let times = integer.define_native("times", Vec::new(), |cx, inv| {
        let n = match inv.receiver {
            Value::Integer(n) => n,
            _ => 0,
        };
        if let Some(block) = &inv.block {
            for i in 0..n {
                cx.yield_block(block, &[Value::from(i)])?;
            }
        }
        Ok(inv.receiver.clone())
    });
    let block = cx.block(loc(5), |cx, _| {
        cx.line(6)?;
        Ok(Value::Nil)
    });
    let (session, log) = recording(&runtime, EventKind::Line);
    session.enable(EnableOptions::global()).unwrap();

    cx.invoke(&times, Value::from(25), Vec::new(), Some(block))
        .unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 25);
    assert!(log.iter().all(|entry| entry == "line:6"));
}

#[test]
fn test_enable_and_disable_report_prior_state() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("app.rb");
    let (session, count) = counter(&runtime, EventKind::Line);

    assert!(!session.disable());
    assert!(!session.enable(EnableOptions::global()).unwrap());
    assert!(session.enable(EnableOptions::global()).unwrap());
    cx.line(1).unwrap();
    assert_eq!(*count.lock(), 1);

    assert!(session.disable());
    assert!(!session.disable());
    cx.line(2).unwrap();
    assert_eq!(*count.lock(), 1);
}

#[test]
fn test_callback_exception_surfaces_at_call_site() {
    let runtime = Vigil::with_defaults().unwrap();
    let class = Class::new("Guarded");
    let method = class.define("run", CodeBody::new("run", loc(1)), |cx, _| {
        cx.line(2)?;
        Ok(Value::from(1))
    });
    let _session = runtime
        .trace(EventKind::Call, |hook| {
            Err(Exception::new("SecurityError", format!("blocked {:?}", hook.method_id()?)))
        })
        .unwrap();

    let err = runtime
        .run("app.rb", |cx| cx.invoke(&method, class.instance(), Vec::new(), None))
        .unwrap_err();
    match err {
        VigilError::Raised(exception) => {
            assert!(exception.is("SecurityError"));
            assert!(exception.message.contains("run"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runtime.stat().callback_errors, 1);
}

#[test]
fn test_class_body_and_eval_events() {
    let runtime = Vigil::with_defaults().unwrap();
    let (session, log) = recording(
        &runtime,
        EventKind::Class | EventKind::End | EventKind::ScriptCompiled | EventKind::Line,
    );
    session.enable(EnableOptions::global()).unwrap();

    let widget = Class::new("Widget");
    runtime
        .run("app.rb", |cx| {
            cx.define_class(&widget, &loc(1), 3, |cx, _| {
                cx.line(2)?;
                Ok(Value::Nil)
            })?;
            cx.line(4)?;
            cx.local_set("x", Value::from(1));
            cx.eval(None, "x + 1", |cx| {
                cx.line(1)?;
                match cx.local_get("x") {
                    Value::Integer(x) => Ok(Value::from(x + 1)),
                    _ => Ok(Value::Nil),
                }
            })
        })
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "class:1",
            "line:2",
            "end:3",
            "line:4",
            "script_compiled:4",
            "line:1"
        ]
    );
}

#[test]
fn test_stats_follow_dispatch() {
    let runtime = Vigil::with_defaults().unwrap();
    let (session, _count) = counter(&runtime, EventKind::Line);
    let (_idle, _) = counter(&runtime, EventKind::Call);

    session.enable(EnableOptions::global()).unwrap();
    runtime
        .run("app.rb", |cx| {
            cx.line(1)?;
            cx.line(2)?;
            Ok(Value::Nil)
        })
        .unwrap();

    let stats = runtime.stat();
    assert_eq!(stats.sessions_created, 2);
    assert_eq!(stats.sessions_enabled, 1);
    assert_eq!(stats.events_of(EventKind::Line), 2);
    assert_eq!(stats.events_of(EventKind::Call), 0);
    assert_eq!(stats.callbacks_invoked, 2);
}
