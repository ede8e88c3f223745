//! TOML-described programs.
//!
//! A program declares classes with methods and a list of top-level
//! operations. The operations drive the host engine directly, so every
//! instrumentation point of a real interpreter is reachable from a file:
//!
//! ```toml
//! path = "greeter.rb"
//!
//! [[classes]]
//! name = "Greeter"
//!
//! [[classes.methods]]
//! name = "hello"
//! line = 2
//! end_line = 4
//! params = ["name"]
//! body = [{ op = "line", line = 3 }, { op = "get", name = "name" }]
//!
//! [[main]]
//! op = "call"
//! class = "Greeter"
//! method = "hello"
//! args = ["world"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use vigil::prelude::*;
use vigil::vigil_core::ConfigurationError;
use vigil::vigil_host::Invocation;
use vigil::VigilError;

/// A complete program.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    /// Script path reported by events.
    #[serde(default = "default_path")]
    pub path: String,

    /// Events to record. Every event when omitted.
    #[serde(default)]
    pub events: Option<Vec<String>>,

    /// Classes defined before the script runs.
    #[serde(default)]
    pub classes: Vec<ClassSpec>,

    /// Top-level operations.
    #[serde(default)]
    pub main: Vec<Op>,
}

fn default_path() -> String {
    "main.rb".to_string()
}

fn runtime_error() -> String {
    "RuntimeError".to_string()
}

/// A class with its methods and aliases.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSpec {
    /// Class name.
    pub name: String,
    /// Methods, defined in order.
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
    /// Aliases, installed after the methods.
    #[serde(default)]
    pub aliases: Vec<AliasSpec>,
}

/// A method definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodSpec {
    /// Method name.
    pub name: String,
    /// Line of the `def`.
    #[serde(default = "first_line")]
    pub line: u32,
    /// Line of the closing `end`.
    #[serde(default)]
    pub end_line: Option<u32>,
    /// Required parameter names.
    #[serde(default)]
    pub params: Vec<String>,
    /// Implemented natively (`c_call`/`c_return`).
    #[serde(default)]
    pub native: bool,
    /// Body operations.
    #[serde(default)]
    pub body: Vec<Op>,
}

fn first_line() -> u32 {
    1
}

/// `alias_method name, original`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasSpec {
    /// New name.
    pub name: String,
    /// Existing method name.
    pub original: String,
}

/// A block or lambda literal.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockSpec {
    /// Line of the literal.
    #[serde(default = "first_line")]
    pub line: u32,
    /// Lambda semantics for `return`.
    #[serde(default)]
    pub lambda: bool,
    /// Block parameter names.
    #[serde(default)]
    pub params: Vec<String>,
    /// Body operations.
    #[serde(default)]
    pub body: Vec<Op>,
}

/// A literal value.
///
/// Strings starting with `:` are symbols and `"nil"` is `nil`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    /// `true` or `false`.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A string, symbol or `nil`.
    Text(String),
}

impl Literal {
    /// The value this literal denotes.
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Bool(b) => Value::from(*b),
            Literal::Int(n) => Value::from(*n),
            Literal::Text(text) if text == "nil" => Value::Nil,
            Literal::Text(text) => match text.strip_prefix(':') {
                Some(name) => Value::sym(name.to_string()),
                None => Value::str(text.clone()),
            },
        }
    }
}

fn value_of(literal: &Option<Literal>) -> Value {
    literal.as_ref().map(Literal::to_value).unwrap_or_default()
}

/// One operation. The value of a sequence is the value of its last
/// operation, or `nil` when empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Step to a line.
    Line {
        /// Line number.
        line: u32,
    },
    /// Produce a literal.
    Value {
        /// The literal; `nil` when omitted.
        #[serde(default)]
        value: Option<Literal>,
    },
    /// Assign a local variable.
    Set {
        /// Variable name.
        name: String,
        /// Assigned literal.
        #[serde(default)]
        value: Option<Literal>,
    },
    /// Read a local variable.
    Get {
        /// Variable name.
        name: String,
    },
    /// Call a method on a fresh instance of a class.
    Call {
        /// Class name.
        class: String,
        /// Method name.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Literal>,
        /// Block passed to the call.
        #[serde(default)]
        block: Option<BlockSpec>,
    },
    /// Run the block of the enclosing method.
    Yield {
        /// Yielded values.
        #[serde(default)]
        args: Vec<Literal>,
    },
    /// `count.times { ... }` through a native iterator.
    Times {
        /// Iteration count.
        count: i64,
        /// The block run each time.
        block: BlockSpec,
    },
    /// Raise an exception.
    Raise {
        /// Exception class.
        #[serde(default = "runtime_error")]
        class: String,
        /// Message.
        #[serde(default)]
        message: String,
    },
    /// `begin ... rescue ... end`.
    Rescue {
        /// Line of the `rescue` clause.
        line: u32,
        /// Protected operations.
        body: Vec<Op>,
        /// Local that receives the exception.
        #[serde(default)]
        var: Option<String>,
        /// Handler operations.
        #[serde(default)]
        handler: Vec<Op>,
    },
    /// `begin ... ensure ... end`.
    Ensure {
        /// Protected operations.
        body: Vec<Op>,
        /// Operations run on every exit.
        cleanup: Vec<Op>,
    },
    /// `return value`.
    Return {
        /// Returned literal.
        #[serde(default)]
        value: Option<Literal>,
    },
    /// `break value`.
    Break {
        /// Break literal.
        #[serde(default)]
        value: Option<Literal>,
    },
    /// `class Name ... end`.
    Class {
        /// Class name.
        name: String,
        /// Line of `class`.
        line: u32,
        /// Line of `end`.
        end_line: u32,
        /// Class body.
        #[serde(default)]
        body: Vec<Op>,
    },
    /// `eval(source)`, run in the caller's scope.
    Eval {
        /// Source text reported to `script_compiled`.
        source: String,
        /// Path of the evaluated code.
        #[serde(default)]
        path: Option<String>,
        /// Operations standing for the compiled code.
        #[serde(default)]
        body: Vec<Op>,
    },
}

impl Program {
    /// Parse a program from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid program")
    }

    /// Read and parse a program file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read program {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("In {}", path.display()))
    }

    /// Events the program asks to record.
    pub fn events(&self) -> Result<EventSet, ConfigurationError> {
        match &self.events {
            Some(names) => EventSet::parse(names),
            None => Ok(EventSet::ALL),
        }
    }

    /// Static problems: references to unknown classes or methods, and
    /// operations that can never run where they are placed.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut methods: HashMap<&str, Vec<&str>> = HashMap::new();
        for class in &self.classes {
            let names = methods.entry(class.name.as_str()).or_default();
            names.extend(class.methods.iter().map(|m| m.name.as_str()));
            for alias in &class.aliases {
                if !names.contains(&alias.original.as_str()) {
                    problems.push(format!(
                        "Alias '{}' refers to undefined method '{}#{}'",
                        alias.name, class.name, alias.original
                    ));
                }
                names.push(alias.name.as_str());
            }
        }

        let mut check = |ops: &[Op], in_method: bool| {
            visit(ops, &mut |op| match op {
                Op::Line { line: 0 } => problems.push("Line numbers start at 1".to_string()),
                Op::Call { class, method, .. } => match methods.get(class.as_str()) {
                    None => problems.push(format!("Call to undefined class '{class}'")),
                    Some(names) if !names.contains(&method.as_str()) => {
                        problems.push(format!("Call to undefined method '{class}#{method}'"))
                    }
                    Some(_) => {}
                },
                Op::Yield { .. } if !in_method => {
                    problems.push("'yield' outside of a method".to_string())
                }
                _ => {}
            });
        };
        for class in &self.classes {
            for method in &class.methods {
                check(&method.body, true);
            }
        }
        check(&self.main, false);
        problems
    }

    /// Run the program under `runtime`, recording `events`.
    pub fn record(
        &self,
        runtime: &VigilRuntime,
        events: EventSet,
        max_records: usize,
    ) -> Result<TraceReport, VigilError> {
        let env = self.environment()?;
        let main = self.main.clone();
        runtime.run_recorded(&self.path, events, max_records, move |cx| {
            exec(cx, &env, &Enclosing::default(), &main)
        })
    }

    fn environment(&self) -> Result<Arc<Env>, VigilError> {
        let integer = Class::new("Integer");
        integer.define_native("times", Vec::new(), |cx, inv| {
            let count = match inv.receiver {
                Value::Integer(n) => n,
                _ => 0,
            };
            if let Some(block) = &inv.block {
                for i in 0..count {
                    cx.yield_block(block, &[Value::from(i)])?;
                }
            }
            Ok(inv.receiver.clone())
        });

        let classes: HashMap<String, Class> = self
            .classes
            .iter()
            .map(|spec| (spec.name.clone(), Class::new(spec.name.clone())))
            .collect();
        let env = Arc::new(Env {
            path: self.path.clone(),
            classes,
            integer,
        });

        for spec in &self.classes {
            let Some(class) = env.classes.get(&spec.name) else {
                continue;
            };
            for method in &spec.methods {
                define(&env, class, method);
            }
            for alias in &spec.aliases {
                class.alias(alias.name.clone(), &alias.original)?;
            }
        }
        Ok(env)
    }
}

/// Walk every operation, including nested bodies.
fn visit(ops: &[Op], f: &mut impl FnMut(&Op)) {
    for op in ops {
        f(op);
        match op {
            Op::Call {
                block: Some(block), ..
            }
            | Op::Times { block, .. } => visit(&block.body, f),
            Op::Rescue { body, handler, .. } => {
                visit(body, f);
                visit(handler, f);
            }
            Op::Ensure { body, cleanup } => {
                visit(body, f);
                visit(cleanup, f);
            }
            Op::Class { body, .. } | Op::Eval { body, .. } => visit(body, f),
            _ => {}
        }
    }
}

/// Classes and builtins shared by every running body.
struct Env {
    path: String,
    classes: HashMap<String, Class>,
    integer: Class,
}

impl Env {
    fn loc(&self, line: u32) -> SourceLoc {
        SourceLoc::new(&self.path, line)
    }
}

/// Lexical surroundings of an operation: the block `yield` runs.
#[derive(Clone, Default)]
struct Enclosing {
    block: Option<Block>,
}

fn parameters(names: &[String]) -> Vec<Parameter> {
    names.iter().map(|name| Parameter::req(name.clone())).collect()
}

fn define(env: &Arc<Env>, class: &Class, spec: &MethodSpec) {
    let body = spec.body.clone();
    let shared = Arc::clone(env);
    let run = move |cx: &mut ExecutionContext, inv: &Invocation| {
        let enclosing = Enclosing {
            block: inv.block.clone(),
        };
        exec(cx, &shared, &enclosing, &body)
    };

    if spec.native {
        class.define_native(spec.name.clone(), parameters(&spec.params), run);
    } else {
        let mut code = CodeBody::new(spec.name.clone(), env.loc(spec.line))
            .with_parameters(parameters(&spec.params));
        if let Some(end_line) = spec.end_line {
            code = code.with_end_line(end_line);
        }
        class.define(spec.name.clone(), code, run);
    }
}

fn make_block(cx: &mut ExecutionContext, env: &Arc<Env>, enclosing: &Enclosing, spec: &BlockSpec) -> Block {
    let body = spec.body.clone();
    let shared = Arc::clone(env);
    let outer = enclosing.clone();
    let code = CodeBody::new("block", env.loc(spec.line)).with_parameters(parameters(&spec.params));
    cx.block_with(code, spec.lambda, move |cx, _| exec(cx, &shared, &outer, &body))
}

fn exec(cx: &mut ExecutionContext, env: &Arc<Env>, enclosing: &Enclosing, ops: &[Op]) -> Flow {
    let mut last = Value::Nil;
    for op in ops {
        last = step(cx, env, enclosing, op)?;
    }
    Ok(last)
}

fn step(cx: &mut ExecutionContext, env: &Arc<Env>, enclosing: &Enclosing, op: &Op) -> Flow {
    match op {
        Op::Line { line } => {
            cx.line(*line)?;
            Ok(Value::Nil)
        }
        Op::Value { value } => Ok(value_of(value)),
        Op::Set { name, value } => {
            let value = value_of(value);
            cx.local_set(name.clone(), value.clone());
            Ok(value)
        }
        Op::Get { name } => Ok(cx.local_get(name)),
        Op::Call {
            class,
            method,
            args,
            block: spec,
        } => {
            let Some(target) = env.classes.get(class) else {
                return Err(cx.raise(Exception::new(
                    "NameError",
                    format!("uninitialized constant {class}"),
                )));
            };
            let args = args.iter().map(Literal::to_value).collect();
            let block = spec.as_ref().map(|spec| make_block(cx, env, enclosing, spec));
            cx.send(target, target.instance(), method, args, block)
        }
        Op::Yield { args } => match &enclosing.block {
            Some(block) => {
                let args: Vec<Value> = args.iter().map(Literal::to_value).collect();
                cx.yield_block(block, &args)
            }
            None => Err(cx.raise(Exception::local_jump_error("no block given (yield)"))),
        },
        Op::Times { count, block: spec } => {
            let block = make_block(cx, env, enclosing, spec);
            let integer = env.integer.clone();
            cx.send(&integer, Value::from(*count), "times", Vec::new(), Some(block))
        }
        Op::Raise { class, message } => {
            Err(cx.raise(Exception::new(class.clone(), message.clone())))
        }
        Op::Rescue {
            line,
            body,
            var,
            handler,
        } => cx.rescue(
            *line,
            |cx| exec(cx, env, enclosing, body),
            |cx, exception| {
                if let Some(var) = var {
                    cx.local_set(var.clone(), Value::from(exception));
                }
                exec(cx, env, enclosing, handler)
            },
        ),
        Op::Ensure { body, cleanup } => cx.ensure(
            |cx| exec(cx, env, enclosing, body),
            |cx| exec(cx, env, enclosing, cleanup).map(|_| ()),
        ),
        Op::Return { value } => Err(cx.return_with(value_of(value))),
        Op::Break { value } => Err(cx.break_with(value_of(value))),
        Op::Class {
            name,
            line,
            end_line,
            body,
        } => {
            let class = env
                .classes
                .get(name)
                .cloned()
                .unwrap_or_else(|| Class::new(name.clone()));
            let loc = env.loc(*line);
            cx.define_class(&class, &loc, *end_line, |cx, _| {
                exec(cx, env, &Enclosing::default(), body)
            })
        }
        Op::Eval { source, path, body } => {
            cx.eval(path.as_deref(), source, |cx| exec(cx, env, enclosing, body))
        }
    }
}
