//! Cooperative fibers.
//!
//! A fiber runs on its own OS thread with its own [`ExecutionContext`], but
//! only one fiber of a thread runs at a time: control is handed over by
//! sending a [`Wake`] into the mailbox of the fiber gaining control and then
//! blocking on one's own mailbox. `fiber_switch` fires in the fiber gaining
//! control, once per hand-over.
//!
//! Fibers of a thread share its [`DispatchStack`]: a callback that resumes a
//! fiber stays excluded from events the fiber raises, as for any other code
//! it runs synchronously.
//!
//! Fiber misuse raises `FiberError` into the managed program.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use vigil_core::{ContextId, EventKind, Exception, FiberId, Value};
use vigil_hook::{Activation, ActivationKind, DispatchStack, ExecutionContext, Locals, Tracer};

use crate::control::{settle, Flow, Unwind};
use crate::interp::Interpreter;

type FiberBody = Box<dyn FnOnce(&mut ExecutionContext, Value) -> Flow + Send>;

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created, never resumed.
    Created,
    /// Currently running.
    Running,
    /// Yielded or transferred away, waiting to be resumed.
    Suspended,
    /// Waiting for a fiber it resumed.
    Resuming,
    /// Body finished.
    Terminated,
}

enum Wake {
    Resume(Value),
    Raise(Exception),
}

struct FiberShared {
    state: FiberState,
    resumer: Option<Sender<Wake>>,
    body: Option<FiberBody>,
    inbox: Option<Receiver<Wake>>,
}

struct FiberInner {
    id: FiberId,
    context: ContextId,
    tracer: Tracer,
    levels: DispatchStack,
    mailbox: Sender<Wake>,
    root: Sender<Wake>,
    shared: Mutex<FiberShared>,
    activation: Activation,
}

#[derive(Clone)]
enum Endpoint {
    Root(Sender<Wake>),
    Fiber(Weak<FiberInner>),
}

/// The fiber running on the calling OS thread.
#[derive(Clone)]
struct Current {
    id: FiberId,
    inbox: Receiver<Wake>,
    me: Endpoint,
    root: Sender<Wake>,
}

impl Current {
    fn fiber(&self) -> Option<Arc<FiberInner>> {
        match &self.me {
            Endpoint::Root(_) => None,
            Endpoint::Fiber(weak) => weak.upgrade(),
        }
    }

    fn mailbox(&self) -> Option<Sender<Wake>> {
        match &self.me {
            Endpoint::Root(sender) => Some(sender.clone()),
            Endpoint::Fiber(weak) => weak.upgrade().map(|inner| inner.mailbox.clone()),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// The running fiber, creating the root entry on first use.
fn current(cx: &ExecutionContext) -> Current {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_ref() {
            Some(current) if current.id == cx.fiber() => current.clone(),
            _ => {
                let (sender, inbox) = unbounded();
                let root = Current {
                    id: cx.fiber(),
                    inbox,
                    me: Endpoint::Root(sender.clone()),
                    root: sender,
                };
                *slot = Some(root.clone());
                root
            }
        }
    })
}

/// Block until control comes back, then report the switch.
fn wait(cx: &mut ExecutionContext, current: &Current) -> Flow {
    let wake = current
        .inbox
        .recv()
        .map_err(|_| Unwind::Raise(Exception::fiber_error("fiber abandoned")))?;
    if let Some(inner) = current.fiber() {
        inner.shared.lock().state = FiberState::Running;
    }
    cx.emit(EventKind::FiberSwitch)?;
    match wake {
        Wake::Resume(value) => Ok(value),
        Wake::Raise(exception) => Err(cx.raise(exception)),
    }
}

/// A cooperative fiber.
///
/// Cloning is cheap; clones refer to the same fiber.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

impl Fiber {
    /// Create a fiber that will run `body` on first resume.
    ///
    /// `body` receives the value passed to the first `resume` or `transfer`.
    pub fn new<F>(cx: &ExecutionContext, body: F) -> Self
    where
        F: FnOnce(&mut ExecutionContext, Value) -> Flow + Send + 'static,
    {
        let (mailbox, inbox) = unbounded();
        let creator = current(cx);
        let site = cx.current();
        let activation = Activation::new(
            ActivationKind::Block,
            site.map(|a| a.receiver.clone()).unwrap_or_default(),
        )
        .at_path(site.and_then(|a| a.path.clone()), site.map_or(0, |a| a.line))
        .method(
            site.and_then(|a| a.method_id.clone()),
            site.and_then(|a| a.callee_id.clone()),
            site.and_then(|a| a.defined_class.clone()),
        )
        .with_locals(
            site.and_then(|a| a.locals.as_ref())
                .map_or_else(Locals::new, Locals::child),
        );

        let inner = Arc::new(FiberInner {
            id: FiberId::next(),
            context: cx.id(),
            tracer: cx.tracer().clone(),
            levels: cx.dispatch_stack().clone(),
            mailbox,
            root: creator.root,
            shared: Mutex::new(FiberShared {
                state: FiberState::Created,
                resumer: None,
                body: Some(Box::new(body)),
                inbox: Some(inbox),
            }),
            activation,
        });
        trace!(fiber = %inner.id, context = %inner.context, "Fiber created");
        Self { inner }
    }

    /// Fiber identity.
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// The fiber as a value.
    pub fn to_value(&self) -> Value {
        Value::Fiber(self.inner.id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FiberState {
        self.inner.shared.lock().state
    }

    /// Whether the body has not finished.
    pub fn is_alive(&self) -> bool {
        self.state() != FiberState::Terminated
    }

    /// Run the fiber until it yields or finishes, passing `value` in.
    ///
    /// Returns the yielded value or the body's result.
    pub fn resume(&self, cx: &mut ExecutionContext, value: Value) -> Flow {
        self.switch(cx, Wake::Resume(value), true)
    }

    /// Raise `exception` inside the fiber at its suspension point.
    pub fn raise(&self, cx: &mut ExecutionContext, exception: Exception) -> Flow {
        if self.state() == FiberState::Created {
            return Err(cx.raise(Exception::fiber_error("cannot raise exception on unborn fiber")));
        }
        self.switch(cx, Wake::Raise(exception), true)
    }

    /// Hand control to the fiber without becoming its resumer.
    pub fn transfer(&self, cx: &mut ExecutionContext, value: Value) -> Flow {
        self.switch(cx, Wake::Resume(value), false)
    }

    /// Suspend the running fiber and hand `value` to its resumer.
    pub fn yield_value(cx: &mut ExecutionContext, value: Value) -> Flow {
        let current = current(cx);
        let Some(inner) = current.fiber() else {
            return Err(cx.raise(Exception::fiber_error("can't yield from root fiber")));
        };
        let resumer = {
            let mut shared = inner.shared.lock();
            let resumer = shared.resumer.take();
            if resumer.is_some() {
                shared.state = FiberState::Suspended;
            }
            resumer
        };
        drop(inner);
        let Some(resumer) = resumer else {
            return Err(cx.raise(Exception::fiber_error("attempt to yield on a not resumed fiber")));
        };
        if resumer.send(Wake::Resume(value)).is_err() {
            return Err(cx.raise(Exception::fiber_error("resuming fiber is gone")));
        }
        wait(cx, &current)
    }

    fn switch(&self, cx: &mut ExecutionContext, wake: Wake, resuming: bool) -> Flow {
        let current = current(cx);
        if let Err(message) = self.prepare(&current, resuming) {
            return Err(cx.raise(Exception::fiber_error(message)));
        }
        if let Some(me) = current.fiber() {
            me.shared.lock().state = if resuming {
                FiberState::Resuming
            } else {
                FiberState::Suspended
            };
        }
        if let Err(message) = self.deliver(wake) {
            if let Some(me) = current.fiber() {
                me.shared.lock().state = FiberState::Running;
            }
            return Err(cx.raise(Exception::fiber_error(message)));
        }
        wait(cx, &current)
    }

    /// Validate the switch and record the resumer.
    fn prepare(&self, current: &Current, resuming: bool) -> Result<(), &'static str> {
        if self.inner.id == current.id {
            return Err(if resuming {
                "attempt to resume the current fiber"
            } else {
                "attempt to transfer to the current fiber"
            });
        }
        let mut shared = self.inner.shared.lock();
        match shared.state {
            FiberState::Terminated => return Err("dead fiber called"),
            FiberState::Resuming if resuming => return Err("attempt to resume a resuming fiber"),
            FiberState::Resuming => return Err("attempt to transfer to a resuming fiber"),
            FiberState::Running => return Err("attempt to resume a resumed fiber (double resume)"),
            FiberState::Created | FiberState::Suspended => {}
        }
        if resuming {
            shared.resumer = Some(current.mailbox().ok_or("fiber abandoned")?);
        }
        shared.state = FiberState::Running;
        Ok(())
    }

    /// Wake the fiber, starting its thread on first use.
    fn deliver(&self, wake: Wake) -> Result<(), &'static str> {
        let start = {
            let mut shared = self.inner.shared.lock();
            shared.body.take().zip(shared.inbox.take())
        };
        match start {
            Some((body, inbox)) => self.start(body, inbox, wake),
            None => self
                .inner
                .mailbox
                .send(wake)
                .map_err(|_| "dead fiber called"),
        }
    }

    fn start(&self, body: FiberBody, inbox: Receiver<Wake>, first: Wake) -> Result<(), &'static str> {
        let inner = Arc::clone(&self.inner);
        let name = format!("vigil-{}-{}", inner.context, inner.id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || run(inner, inbox, body, first))
            .map(|_| ())
            .map_err(|_| "can't start fiber")
    }
}

fn run(inner: Arc<FiberInner>, inbox: Receiver<Wake>, body: FiberBody, first: Wake) {
    let mut cx = ExecutionContext::sharing(
        inner.tracer.clone(),
        inner.context,
        inner.id,
        inner.levels.clone(),
    );
    let activation = inner.activation.clone();
    let tag = activation.tag;
    cx.push(activation.unwinds_to(Some(tag), Some(tag)));

    let root = inner.root.clone();
    let weak = Arc::downgrade(&inner);
    CURRENT.with(|slot| {
        *slot.borrow_mut() = Some(Current {
            id: inner.id,
            inbox,
            me: Endpoint::Fiber(weak.clone()),
            root: root.clone(),
        });
    });
    let id = inner.id;
    drop(inner);
    debug!(fiber = %id, "Fiber started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        cx.emit(EventKind::FiberSwitch)?;
        match first {
            Wake::Resume(value) => body(&mut cx, value),
            Wake::Raise(exception) => Err(cx.raise(exception)),
        }
    }));
    let result = match outcome {
        Ok(flow) => settle(flow),
        Err(_) => Err(Exception::fiber_error("fiber body panicked")),
    };
    cx.pop();

    let resumer = weak.upgrade().and_then(|inner| {
        let mut shared = inner.shared.lock();
        shared.state = FiberState::Terminated;
        shared.resumer.take()
    });
    let wake = match result {
        Ok(value) => Wake::Resume(value),
        Err(exception) => Wake::Raise(exception),
    };
    if resumer.unwrap_or(root).send(wake).is_err() {
        debug!(fiber = %id, "Fiber finished with nobody waiting");
    } else {
        debug!(fiber = %id, "Fiber finished");
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::main_context;

    fn count_switches(tracer: &Tracer) -> (Arc<Mutex<usize>>, vigil_hook::TraceSession) {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let session = tracer
            .trace(EventKind::FiberSwitch, move |_| {
                *sink.lock() += 1;
                Ok(())
            })
            .unwrap();
        (count, session)
    }

    #[test]
    fn test_resume_and_yield_switch_count() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer.clone(), "fiber.rb");
        let (count, _session) = count_switches(&tracer);

        let fiber = Fiber::new(&cx, |cx, _| {
            Fiber::yield_value(cx, Value::from(1))?;
            Fiber::yield_value(cx, Value::from(2))?;
            Fiber::yield_value(cx, Value::from(3))?;
            Ok(Value::sym("done"))
        });
        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(fiber.resume(&mut cx, Value::Nil).unwrap());
        }

        assert_eq!(
            results,
            vec![Value::from(1), Value::from(2), Value::from(3), Value::sym("done")]
        );
        assert_eq!(*count.lock(), 8);
        assert!(!fiber.is_alive());
    }

    #[test]
    fn test_transfer_switch_count() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer.clone(), "fiber.rb");
        let (count, _session) = count_switches(&tracer);

        let slot: Arc<Mutex<Option<Fiber>>> = Arc::new(Mutex::new(None));
        let first_slot = Arc::clone(&slot);
        let f2 = Fiber::new(&cx, move |cx, _| {
            let f1 = first_slot.lock().clone();
            if let Some(f1) = f1 {
                f1.transfer(cx, Value::Nil)?;
                f1.transfer(cx, Value::Nil)?;
            }
            Ok(Value::Nil)
        });
        let f2_handle = f2.clone();
        let f1 = Fiber::new(&cx, move |cx, _| {
            f2_handle.transfer(cx, Value::Nil)?;
            f2_handle.transfer(cx, Value::Nil)?;
            Fiber::yield_value(cx, Value::sym("ok"))
        });
        *slot.lock() = Some(f1.clone());

        assert_eq!(f1.resume(&mut cx, Value::Nil).unwrap(), Value::sym("ok"));
        assert_eq!(*count.lock(), 6);
        assert_eq!(f1.state(), FiberState::Suspended);
    }

    #[test]
    fn test_dead_fiber_raises_without_switch() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer.clone(), "fiber.rb");
        let fiber = Fiber::new(&cx, |_, value| Ok(value));
        assert_eq!(fiber.resume(&mut cx, Value::from(9)).unwrap(), Value::from(9));

        let (count, _session) = count_switches(&tracer);
        let err = fiber.resume(&mut cx, Value::Nil).unwrap_err();
        let exception = err.into_exception();
        assert!(exception.is("FiberError"));
        assert_eq!(exception.message, "dead fiber called");
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_raise_propagates_to_resumer() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer.clone(), "fiber.rb");
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let _session = tracer
            .trace(EventKind::Raise | EventKind::FiberSwitch, move |hook| {
                sink.lock().push((hook.event()?, hook.fiber()?));
                Ok(())
            })
            .unwrap();

        let fiber = Fiber::new(&cx, |cx, _| {
            Fiber::yield_value(cx, Value::Nil)?;
            Ok(Value::Nil)
        });
        fiber.resume(&mut cx, Value::Nil).unwrap();
        log.lock().clear();

        let err = fiber
            .raise(&mut cx, Exception::runtime_error("stop"))
            .unwrap_err();
        assert_eq!(err.into_exception().message, "stop");
        assert_eq!(
            *log.lock(),
            vec![
                (EventKind::FiberSwitch, fiber.id()),
                (EventKind::Raise, fiber.id()),
                (EventKind::FiberSwitch, cx.fiber()),
                (EventKind::Raise, cx.fiber()),
            ]
        );
    }

    #[test]
    fn test_misuse_errors() {
        let tracer = Tracer::with_defaults();
        let mut cx = main_context(tracer, "fiber.rb");
        let unborn = Fiber::new(&cx, |_, _| Ok(Value::Nil));

        let err = unborn
            .raise(&mut cx, Exception::runtime_error("x"))
            .unwrap_err()
            .into_exception();
        assert_eq!(err.message, "cannot raise exception on unborn fiber");

        let err = Fiber::yield_value(&mut cx, Value::Nil)
            .unwrap_err()
            .into_exception();
        assert_eq!(err.message, "can't yield from root fiber");
        assert_eq!(unborn.state(), FiberState::Created);
    }
}
