//! The interpreter surface: the operations managed code is built from.
//!
//! [`Interpreter`] is implemented for [`ExecutionContext`]. Every operation
//! that enters or leaves code pushes and pops activations and reaches the
//! matching instrumentation point, so a program written against this trait
//! produces the same event stream a real runtime would.
//!
//! Frames resolve their reported return value from the [`Flow`] that ends
//! them:
//!
//! | frame        | ends with                        | reports       |
//! |--------------|----------------------------------|---------------|
//! | method       | value, or `return` aimed at it   | the value     |
//! | method       | exception, or unwind through it  | `nil`         |
//! | block        | value, or `break` out of it      | the value     |
//! | block        | `return` aimed at its method     | `nil`         |
//! | lambda       | value, `return` or `break`       | the value     |

use std::sync::Arc;

use vigil_core::{
    CodeBody, EventKind, Exception, FrameTag, ParamKind, Parameter, SourceLoc, Symbol, Value,
};
use vigil_hook::{Activation, ActivationKind, CompiledScript, ExecutionContext, Locals};

use crate::class::Class;
use crate::control::{Flow, Unwind};
use crate::method::{Block, BlockInner, Invocation, MethodBody, MethodEntry, MethodKind};

/// Operations available to managed code running on a context.
pub trait Interpreter {
    /// Move to `line` and emit `line`.
    fn line(&mut self, line: u32) -> Flow<()>;

    /// Assign a local variable in the innermost activation.
    fn local_set(&mut self, name: impl Into<Symbol>, value: Value);

    /// Read a local variable, `nil` when undefined.
    fn local_get(&self, name: &str) -> Value;

    /// Receiver of the innermost activation.
    fn receiver(&self) -> Value;

    /// A block literal starting at `loc`, closed over the innermost activation.
    fn block<F>(&mut self, loc: SourceLoc, body: F) -> Block
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync + 'static;

    /// A lambda literal starting at `loc`.
    fn lambda<F>(&mut self, loc: SourceLoc, body: F) -> Block
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync + 'static;

    /// A block or lambda with an explicit body description.
    ///
    /// `code` is nested under the innermost activation's body.
    fn block_with<F>(&mut self, code: CodeBody, lambda: bool, body: F) -> Block
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync + 'static;

    /// Call `entry` on `receiver`.
    fn invoke(
        &mut self,
        entry: &MethodEntry,
        receiver: Value,
        args: Vec<Value>,
        block: Option<Block>,
    ) -> Flow;

    /// Look `name` up on `class` and call it. A missing method raises
    /// `NoMethodError`.
    fn send(
        &mut self,
        class: &Class,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Block>,
    ) -> Flow;

    /// Run `block` with `args`.
    fn yield_block(&mut self, block: &Block, args: &[Value]) -> Flow;

    /// Emit `raise` and build the unwind. An exception raised by a callback
    /// replaces `exception`.
    fn raise(&mut self, exception: Exception) -> Unwind;

    /// Run `body`; an exception escaping it is rescued at `handler_line`.
    fn rescue<B, H>(&mut self, handler_line: u32, body: B, handler: H) -> Flow
    where
        B: FnOnce(&mut Self) -> Flow,
        H: FnOnce(&mut Self, Exception) -> Flow;

    /// Run `body`, then `cleanup` on every exit path.
    fn ensure<B, C>(&mut self, body: B, cleanup: C) -> Flow
    where
        B: FnOnce(&mut Self) -> Flow,
        C: FnOnce(&mut Self) -> Flow<()>;

    /// `return value` from the innermost activation.
    fn return_with(&self, value: Value) -> Unwind;

    /// `break value` from the innermost activation.
    fn break_with(&self, value: Value) -> Unwind;

    /// Run a class body between `class` and `end`.
    fn define_class<F>(&mut self, class: &Class, loc: &SourceLoc, end_line: u32, body: F) -> Flow
    where
        F: FnOnce(&mut Self, &Class) -> Flow;

    /// Compile `source` and emit `script_compiled`.
    fn compile(&mut self, path: Option<&str>, source: &str) -> Flow<Arc<CodeBody>>;

    /// Compile `source` and run `body` as its code, in the caller's scope.
    fn eval<F>(&mut self, path: Option<&str>, source: &str, body: F) -> Flow
    where
        F: FnOnce(&mut Self) -> Flow;
}

impl Interpreter for ExecutionContext {
    fn line(&mut self, line: u32) -> Flow<()> {
        self.set_line(line);
        self.emit(EventKind::Line)?;
        Ok(())
    }

    fn local_set(&mut self, name: impl Into<Symbol>, value: Value) {
        if let Some(locals) = self.current().and_then(|a| a.locals.as_ref()) {
            locals.set(name, value);
        }
    }

    fn local_get(&self, name: &str) -> Value {
        self.current()
            .and_then(|a| a.locals.as_ref())
            .and_then(|locals| locals.get(name))
            .unwrap_or_default()
    }

    fn receiver(&self) -> Value {
        self.current().map(|a| a.receiver.clone()).unwrap_or_default()
    }

    fn block<F>(&mut self, loc: SourceLoc, body: F) -> Block
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync + 'static,
    {
        let code = CodeBody::new(block_label(self), loc);
        self.block_with(code, false, body)
    }

    fn lambda<F>(&mut self, loc: SourceLoc, body: F) -> Block
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync + 'static,
    {
        let code = CodeBody::new(block_label(self), loc);
        self.block_with(code, true, body)
    }

    fn block_with<F>(&mut self, code: CodeBody, lambda: bool, body: F) -> Block
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync + 'static,
    {
        let current = self.current();
        let code = code
            .with_parent(current.and_then(|a| a.code.clone()))
            .shared();
        Block::new(BlockInner {
            code,
            body: Arc::new(body),
            receiver: current.map(|a| a.receiver.clone()).unwrap_or_default(),
            method_id: current.and_then(|a| a.method_id.clone()),
            callee_id: current.and_then(|a| a.callee_id.clone()),
            defined_class: current.and_then(|a| a.defined_class.clone()),
            owner: current.and_then(|a| a.owner),
            home: current.and_then(|a| a.return_target),
            locals: current
                .and_then(|a| a.locals.clone())
                .unwrap_or_default(),
            lambda,
        })
    }

    fn invoke(
        &mut self,
        entry: &MethodEntry,
        receiver: Value,
        args: Vec<Value>,
        block: Option<Block>,
    ) -> Flow {
        let invocation = Invocation {
            receiver,
            args,
            block,
        };
        match entry.def().kind() {
            MethodKind::Iseq { code, body } => run_iseq(self, entry, code, body, &invocation),
            MethodKind::Native { body } => run_native(self, entry, body, &invocation),
            MethodKind::Bmethod { block } => run_bmethod(self, entry, block, &invocation),
        }
    }

    fn send(
        &mut self,
        class: &Class,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Block>,
    ) -> Flow {
        match class.lookup(name) {
            Some(entry) => self.invoke(&entry, receiver, args, block),
            None => Err(self.raise(Exception::no_method_error(format!(
                "undefined method '{name}' for an instance of {}",
                class.name()
            )))),
        }
    }

    fn yield_block(&mut self, block: &Block, args: &[Value]) -> Flow {
        run_block(self, block, args, None)
    }

    fn raise(&mut self, exception: Exception) -> Unwind {
        match self.emit_exception(EventKind::Raise, exception.clone()) {
            Ok(()) => Unwind::Raise(exception),
            Err(replaced) => Unwind::Raise(replaced),
        }
    }

    fn rescue<B, H>(&mut self, handler_line: u32, body: B, handler: H) -> Flow
    where
        B: FnOnce(&mut Self) -> Flow,
        H: FnOnce(&mut Self, Exception) -> Flow,
    {
        match body(self) {
            Err(Unwind::Raise(exception)) => {
                self.set_line(handler_line);
                self.emit_exception(EventKind::Rescue, exception.clone())?;
                handler(self, exception)
            }
            other => other,
        }
    }

    fn ensure<B, C>(&mut self, body: B, cleanup: C) -> Flow
    where
        B: FnOnce(&mut Self) -> Flow,
        C: FnOnce(&mut Self) -> Flow<()>,
    {
        let outcome = body(self);
        cleanup(self)?;
        outcome
    }

    fn return_with(&self, value: Value) -> Unwind {
        let target = self
            .current()
            .map_or_else(FrameTag::next, |a| a.return_target.unwrap_or(a.tag));
        Unwind::Return { value, target }
    }

    fn break_with(&self, value: Value) -> Unwind {
        let target = self
            .current()
            .map_or_else(FrameTag::next, |a| a.break_target.unwrap_or(a.tag));
        Unwind::Break { value, target }
    }

    fn define_class<F>(&mut self, class: &Class, loc: &SourceLoc, end_line: u32, body: F) -> Flow
    where
        F: FnOnce(&mut Self, &Class) -> Flow,
    {
        let code = CodeBody::new(format!("<class:{}>", class.name()), loc.clone())
            .with_end_line(end_line)
            .with_parent(self.current().and_then(|a| a.code.clone()))
            .shared();
        self.push(
            Activation::new(ActivationKind::Class, class.to_value())
                .at(loc)
                .with_locals(Locals::new())
                .with_code(code),
        );

        let outcome = match self.emit(EventKind::Class) {
            Ok(()) => body(self, class),
            Err(exception) => Err(exception.into()),
        };
        let result = outcome.and_then(|value| {
            self.set_line(end_line);
            self.emit(EventKind::End)?;
            Ok(value)
        });
        self.pop();
        result
    }

    fn compile(&mut self, path: Option<&str>, source: &str) -> Flow<Arc<CodeBody>> {
        self.emit_script(CompiledScript {
            path: path.map(str::to_string),
            source: source.to_string(),
        })?;
        let loc = SourceLoc::new(path.unwrap_or("(eval)"), 1);
        let end = u32::try_from(source.lines().count()).unwrap_or(u32::MAX).max(1);
        Ok(CodeBody::new("<compiled>", loc).with_end_line(end).shared())
    }

    fn eval<F>(&mut self, path: Option<&str>, source: &str, body: F) -> Flow
    where
        F: FnOnce(&mut Self) -> Flow,
    {
        let code = self.compile(path, source)?;
        let caller = self.current().cloned();
        let mut activation = Activation::new(
            ActivationKind::Eval,
            caller.as_ref().map(|a| a.receiver.clone()).unwrap_or_default(),
        )
        .at(code.loc())
        .with_code(code);
        if let Some(caller) = caller {
            activation = activation
                .method(caller.method_id, caller.callee_id, caller.defined_class)
                .unwinds_to(caller.return_target, caller.break_target);
            if let Some(locals) = caller.locals {
                activation = activation.with_locals(locals);
            }
        }
        self.push(activation);
        let result = body(self);
        self.pop();
        result
    }
}

/// Bind positional arguments to parameter names in `locals`.
///
/// Missing arguments bind `nil`. A rest parameter swallows the surplus and
/// binds `nil`, as do keyword and block parameters.
pub fn bind_parameters(locals: &Locals, parameters: &[Parameter], args: &[Value]) {
    let mut positional = args.iter();
    for parameter in parameters {
        let Some(name) = &parameter.name else {
            continue;
        };
        let value = match parameter.kind {
            ParamKind::Req | ParamKind::Opt => positional.next().cloned().unwrap_or_default(),
            ParamKind::Rest => {
                positional.by_ref().for_each(drop);
                Value::Nil
            }
            ParamKind::Keyreq | ParamKind::Key | ParamKind::Keyrest | ParamKind::Block => {
                Value::Nil
            }
        };
        locals.set(name.clone(), value);
    }
}

fn block_label(cx: &ExecutionContext) -> String {
    let parent = cx
        .current()
        .and_then(|a| a.code.as_ref().map(|code| code.label().to_string()))
        .unwrap_or_else(|| "<main>".to_string());
    format!("block in {parent}")
}

/// Pop the innermost activation after emitting its closing event.
///
/// A callback exception raised by the closing event replaces the result.
fn finish(cx: &mut ExecutionContext, kind: EventKind, end_line: Option<u32>, reported: Value, result: Flow) -> Flow {
    if let Some(line) = end_line {
        cx.set_line(line);
    }
    let closing = cx.emit_return(kind, reported);
    cx.pop();
    match closing {
        Ok(()) => result,
        Err(exception) => Err(Unwind::Raise(exception)),
    }
}

fn open(cx: &mut ExecutionContext, kind: EventKind) -> Flow<()> {
    cx.emit(kind)?;
    Ok(())
}

fn run_iseq(
    cx: &mut ExecutionContext,
    entry: &MethodEntry,
    code: &Arc<CodeBody>,
    body: &MethodBody,
    invocation: &Invocation,
) -> Flow {
    let def = entry.def();
    let locals = Locals::new();
    bind_parameters(&locals, def.parameters(), &invocation.args);
    let activation = Activation::new(ActivationKind::Method, invocation.receiver.clone())
        .at(code.loc())
        .method(
            Some(def.name().clone()),
            Some(entry.name().clone()),
            Some(def.owner().clone()),
        )
        .with_locals(locals)
        .with_parameters(def.parameters().to_vec())
        .owned_by(Some(def.id()))
        .with_code(Arc::clone(code));
    let tag = activation.tag;
    cx.push(activation.unwinds_to(Some(tag), None));

    let outcome = open(cx, EventKind::Call).and_then(|()| body(cx, invocation));
    let (reported, result) = match outcome {
        Ok(value) => (value.clone(), Ok(value)),
        Err(Unwind::Return { value, target }) if target == tag => (value.clone(), Ok(value)),
        Err(Unwind::Break { value, target }) if target == tag => (Value::Nil, Ok(value)),
        Err(unwind) => (Value::Nil, Err(unwind)),
    };
    finish(cx, EventKind::Return, code.end_line(), reported, result)
}

fn run_native(
    cx: &mut ExecutionContext,
    entry: &MethodEntry,
    body: &MethodBody,
    invocation: &Invocation,
) -> Flow {
    let def = entry.def();
    let (path, line) = cx
        .current()
        .map_or((None, 0), |a| (a.path.clone(), a.line));
    let activation = Activation::new(ActivationKind::Native, invocation.receiver.clone())
        .at_path(path, line)
        .method(
            Some(def.name().clone()),
            Some(entry.name().clone()),
            Some(def.owner().clone()),
        )
        .with_parameters(def.parameters().to_vec());
    let tag = cx.push(activation);

    let outcome = open(cx, EventKind::CCall).and_then(|()| body(cx, invocation));
    let (reported, result) = match outcome {
        Ok(value) => (value.clone(), Ok(value)),
        Err(Unwind::Break { value, target }) if target == tag => (Value::Nil, Ok(value)),
        Err(unwind) => (Value::Nil, Err(unwind)),
    };
    finish(cx, EventKind::CReturn, None, reported, result)
}

/// Activation details a bmethod imposes on its body block.
struct MethodFrame {
    receiver: Value,
    method_id: Symbol,
    callee_id: Symbol,
    defined_class: Symbol,
    owner: vigil_core::DefId,
    locals: Locals,
}

fn run_bmethod(
    cx: &mut ExecutionContext,
    entry: &MethodEntry,
    block: &Block,
    invocation: &Invocation,
) -> Flow {
    let def = entry.def();
    let code = block.code();
    let locals = Locals::child(&block.inner().locals);
    bind_parameters(&locals, def.parameters(), &invocation.args);
    let activation = Activation::new(ActivationKind::Method, invocation.receiver.clone())
        .at(code.loc())
        .method(
            Some(def.name().clone()),
            Some(entry.name().clone()),
            Some(def.owner().clone()),
        )
        .with_locals(locals.clone())
        .with_parameters(def.parameters().to_vec())
        .owned_by(Some(def.id()))
        .with_code(Arc::clone(code));
    let tag = activation.tag;
    cx.push(activation.unwinds_to(Some(tag), None));

    let frame = MethodFrame {
        receiver: invocation.receiver.clone(),
        method_id: def.name().clone(),
        callee_id: entry.name().clone(),
        defined_class: def.owner().clone(),
        owner: def.id(),
        locals,
    };
    let outcome = open(cx, EventKind::Call)
        .and_then(|()| run_block(cx, block, &invocation.args, Some(frame)));
    let (reported, result) = match outcome {
        Ok(value) => (value.clone(), Ok(value)),
        Err(Unwind::Return { value, target }) if target == tag => (value.clone(), Ok(value)),
        Err(unwind) => (Value::Nil, Err(unwind)),
    };
    finish(cx, EventKind::Return, code.end_line(), reported, result)
}

fn run_block(
    cx: &mut ExecutionContext,
    block: &Block,
    args: &[Value],
    method: Option<MethodFrame>,
) -> Flow {
    let inner = block.inner();
    let yielder = cx.current().map(|a| a.tag);
    let own_frame = inner.lambda || method.is_some();

    let activation = match method {
        Some(frame) => Activation::new(ActivationKind::Block, frame.receiver)
            .method(
                Some(frame.method_id),
                Some(frame.callee_id),
                Some(frame.defined_class),
            )
            .owned_by(Some(frame.owner))
            .with_locals(frame.locals),
        None => {
            let locals = Locals::child(&inner.locals);
            bind_parameters(&locals, inner.code.parameters(), args);
            Activation::new(ActivationKind::Block, inner.receiver.clone())
                .method(
                    inner.method_id.clone(),
                    inner.callee_id.clone(),
                    inner.defined_class.clone(),
                )
                .owned_by(inner.owner)
                .with_locals(locals)
        }
    };
    let activation = activation
        .at(inner.code.loc())
        .with_parameters(inner.code.parameters().to_vec())
        .with_code(Arc::clone(&inner.code));
    let tag = activation.tag;
    let activation = if own_frame {
        activation.unwinds_to(Some(tag), Some(tag))
    } else {
        activation.unwinds_to(inner.home, yielder)
    };
    cx.push(activation);

    let outcome = open(cx, EventKind::BCall).and_then(|()| (inner.body)(cx, args));
    let (reported, result) = match outcome {
        Ok(value) => (value.clone(), Ok(value)),
        Err(Unwind::Return { value, target } | Unwind::Break { value, target })
            if own_frame && target == tag =>
        {
            (value.clone(), Ok(value))
        }
        Err(Unwind::Break { value, target }) if Some(target) == yielder => {
            (value.clone(), Err(Unwind::Break { value, target }))
        }
        Err(unwind) => (Value::Nil, Err(unwind)),
    };
    finish(cx, EventKind::BReturn, inner.code.end_line(), reported, result)
}
