//! Tracing across managed threads and fibers.

use std::collections::BTreeSet;
use std::sync::Barrier;

use parking_lot::Mutex;
use vigil::prelude::*;

fn loc(line: u32) -> SourceLoc {
    SourceLoc::new("workers.rb", line)
}

fn worker_class() -> (Class, MethodEntry) {
    let class = Class::new("Worker");
    let work = class.define(
        "work",
        CodeBody::new("work", loc(1))
            .with_parameters(vec![Parameter::req("n")])
            .with_end_line(4),
        |cx, _| {
            cx.line(2)?;
            let block = cx.block(loc(3), |cx, args| {
                cx.line(3)?;
                Ok(args.first().cloned().unwrap_or_default())
            });
            let n = cx.local_get("n");
            cx.yield_block(&block, &[n])
        },
    );
    (class, work)
}

#[test]
fn test_threads_record_balanced_per_context() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("workers.rb");
    let (class, work) = worker_class();

    let recorder = Recorder::new(1_000);
    let balance = Arc::new(CallBalance::new());
    let observers = ObserverSet::new();
    observers.subscribe(Arc::new(recorder.clone()));
    observers.subscribe(balance.clone());
    let session = observers.attach(runtime.tracer(), EventSet::ALL).unwrap();
    session.enable(EnableOptions::global()).unwrap();

    let handles: Vec<ThreadHandle> = (0..3)
        .map(|n| {
            let class = class.clone();
            let work = work.clone();
            spawn_thread(&cx, move |cx| {
                cx.invoke(&work, class.instance(), vec![Value::from(n)], None)
            })
            .unwrap()
        })
        .collect();
    let thread_ids: BTreeSet<ContextId> = handles.iter().map(ThreadHandle::id).collect();
    let mut results: Vec<Value> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();
    results.sort_by_key(|value| value.to_string());
    cx.line(10).unwrap();
    session.disable();

    assert_eq!(results, vec![Value::from(0), Value::from(1), Value::from(2)]);
    let records = recorder.records();
    let begins: Vec<&TraceRecord> = records
        .iter()
        .filter(|r| r.event == EventKind::ThreadBegin)
        .collect();
    let ends = records
        .iter()
        .filter(|r| r.event == EventKind::ThreadEnd)
        .count();
    assert_eq!(begins.len(), 3);
    assert_eq!(ends, 3);
    assert!(begins.iter().all(|r| r.lineno == 0 && r.path.is_none()));

    let seen: BTreeSet<ContextId> = begins.iter().map(|r| r.context).collect();
    assert_eq!(seen, thread_ids);
    assert!(records
        .iter()
        .filter(|r| r.event == EventKind::Line && r.lineno == 10)
        .all(|r| r.context == cx.id()));

    let report = balance.report();
    assert!(report.is_balanced(), "{:?}", report.violations);
    assert_eq!(report.checked, 12);
}

#[test]
fn test_current_thread_scope_ignores_spawned_threads() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("workers.rb");
    let recorder = Recorder::new(100);
    let session = recorder.attach(runtime.tracer(), EventKind::Line).unwrap();
    session.enable(EnableOptions::current_thread()).unwrap();

    let handle = spawn_thread(&cx, |cx| {
        cx.line(20)?;
        Ok(Value::Nil)
    })
    .unwrap();
    handle.join().unwrap().unwrap();
    cx.line(21).unwrap();

    let records = recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].lineno, 21);
    assert_eq!(records[0].context, cx.id());
}

#[test]
fn test_generator_fiber_events_stay_on_their_fiber() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("gen.rb");
    let (class, work) = worker_class();

    let recorder = Recorder::new(1_000);
    let balance = Arc::new(CallBalance::new());
    let observers = ObserverSet::new();
    observers.subscribe(Arc::new(recorder.clone()));
    observers.subscribe(balance.clone());
    let session = observers
        .attach(
            runtime.tracer(),
            EventSet::A_CALL | EventSet::A_RETURN | EventKind::FiberSwitch,
        )
        .unwrap();
    session.enable(EnableOptions::global()).unwrap();

    let generator = Fiber::new(&cx, move |cx, _| {
        for n in 0..3 {
            let value = cx.invoke(&work, class.instance(), vec![Value::from(n)], None)?;
            Fiber::yield_value(cx, value)?;
        }
        Ok(Value::sym("done"))
    });
    let mut produced = Vec::new();
    while generator.is_alive() {
        produced.push(generator.resume(&mut cx, Value::Nil).unwrap());
    }
    session.disable();

    assert_eq!(
        produced,
        vec![Value::from(0), Value::from(1), Value::from(2), Value::sym("done")]
    );

    let records = recorder.records();
    let switches = records
        .iter()
        .filter(|r| r.event == EventKind::FiberSwitch)
        .count();
    assert_eq!(switches, 8);
    assert!(records
        .iter()
        .filter(|r| r.event.is_call() || r.event.is_return())
        .all(|r| r.fiber == generator.id() && r.context == cx.id()));

    let report = balance.report();
    assert!(report.is_balanced(), "{:?}", report.violations);
    assert_eq!(report.checked, 12);
}

#[test]
fn test_exception_crosses_from_fiber_to_resumer() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("gen.rb");
    let recorder = Recorder::new(100);
    let session = recorder
        .attach(runtime.tracer(), EventKind::Raise | EventKind::FiberSwitch)
        .unwrap();
    session.enable(EnableOptions::global()).unwrap();

    let fiber = Fiber::new(&cx, |cx, _| Err(cx.raise(Exception::runtime_error("inside"))));
    let err = fiber.resume(&mut cx, Value::Nil).unwrap_err();
    session.disable();

    assert_eq!(err.into_exception().message, "inside");
    let trail: Vec<(EventKind, bool)> = recorder
        .records()
        .iter()
        .map(|r| (r.event, r.fiber == fiber.id()))
        .collect();
    assert_eq!(
        trail,
        vec![
            (EventKind::FiberSwitch, true),
            (EventKind::Raise, true),
            (EventKind::FiberSwitch, false),
            (EventKind::Raise, false),
        ]
    );
    assert!(!fiber.is_alive());
}

#[test]
fn test_fiber_resumed_from_callback_runs_to_completion() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("gen.rb");
    let recorder = Recorder::new(100);
    let watcher = recorder.attach(runtime.tracer(), EventKind::Line).unwrap();
    watcher.enable(EnableOptions::global()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let driver = runtime
        .session(EventKind::Line, move |hook| {
            let line = hook.lineno()?;
            sink.lock().push(line.to_string());
            if line == 1 {
                let fiber = Fiber::new(hook.context(), |cx, _| {
                    cx.line(5)?;
                    Ok(Value::sym("done"))
                });
                let value = fiber
                    .resume(hook.context(), Value::Nil)
                    .map_err(Unwind::into_exception)?;
                sink.lock().push(value.to_string());
            }
            Ok(())
        })
        .unwrap();
    driver.enable(EnableOptions::global()).unwrap();

    cx.line(1).unwrap();
    driver.disable();
    watcher.disable();

    // The fiber ran inside the driver's callback, so only the watcher sees line 5.
    assert_eq!(*seen.lock(), vec!["1".to_string(), Value::sym("done").to_string()]);
    let lines: Vec<(u32, bool)> = recorder
        .records()
        .iter()
        .map(|r| (r.lineno, r.fiber == cx.fiber()))
        .collect();
    assert_eq!(lines, vec![(5, false), (1, true)]);
}

#[test]
fn test_fiber_resumed_with_reentry_reaches_its_session() {
    let runtime = Vigil::with_defaults().unwrap();
    let mut cx = runtime.main_context("gen.rb");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _session = runtime
        .trace(EventKind::Line, move |hook| {
            let line = hook.lineno()?;
            sink.lock().push(line);
            if line == 1 {
                let fiber = Fiber::new(hook.context(), |cx, _| {
                    cx.line(5)?;
                    Ok(Value::Nil)
                });
                hook.allow_reentry(|cx| fiber.resume(cx, Value::Nil))?
                    .map_err(Unwind::into_exception)?;
            }
            Ok(())
        })
        .unwrap();

    cx.line(1).unwrap();
    assert_eq!(*seen.lock(), vec![1, 5]);
}

#[test]
fn test_crossed_callbacks_on_two_threads_finish() {
    let runtime = Vigil::with_defaults().unwrap();
    let tracer = runtime.tracer().clone();
    let barrier = Arc::new(Barrier::new(2));
    let log = Arc::new(Mutex::new(Vec::new()));

    // Each session pauses on its own trigger until both callbacks are
    // running, then raises an event only the other session wants.
    let on_line = {
        let barrier = Arc::clone(&barrier);
        let log = Arc::clone(&log);
        tracer
            .trace(EventKind::Line | EventKind::Return, move |hook| {
                let event = hook.event()?;
                log.lock().push(format!("line-session:{event}"));
                if event == EventKind::Line {
                    barrier.wait();
                    hook.context().emit(EventKind::Return)?;
                }
                Ok(())
            })
            .unwrap()
    };
    let on_call = {
        let barrier = Arc::clone(&barrier);
        let log = Arc::clone(&log);
        tracer
            .trace(EventKind::Call | EventKind::Return, move |hook| {
                let event = hook.event()?;
                log.lock().push(format!("call-session:{event}"));
                if event == EventKind::Call {
                    barrier.wait();
                    hook.context().emit(EventKind::Return)?;
                }
                Ok(())
            })
            .unwrap()
    };

    let workers: Vec<_> = [EventKind::Line, EventKind::Call]
        .into_iter()
        .map(|kind| {
            let tracer = tracer.clone();
            std::thread::spawn(move || {
                let mut cx = ExecutionContext::new(tracer);
                cx.push(Activation::new(ActivationKind::Top, Value::Nil));
                cx.emit(kind)
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    on_line.disable();
    on_call.disable();

    // One of the two crossed deliveries would have closed a wait cycle and is skipped.
    assert_eq!(runtime.stat().contention_skipped, 1);
    let log = log.lock();
    assert!(log.contains(&"line-session:line".to_string()));
    assert!(log.contains(&"call-session:call".to_string()));
    assert_eq!(log.iter().filter(|entry| entry.ends_with(":return")).count(), 1);
}
