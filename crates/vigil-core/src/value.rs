//! Runtime values observed by callbacks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ids::{ContextId, FiberId, ObjectId, Symbol};

/// A managed-language value as seen by instrumentation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// `nil`.
    #[default]
    Nil,
    /// `true` or `false`.
    Bool(bool),
    /// An integer.
    Integer(i64),
    /// A string.
    Str(String),
    /// A symbol such as `:foo`.
    Symbol(Symbol),
    /// A class or module.
    Class(Symbol),
    /// An instance of a class.
    Object {
        /// Class of the instance.
        class: Symbol,
        /// Object identity.
        id: ObjectId,
    },
    /// An exception object.
    Exception(Exception),
    /// A thread handle.
    Thread(ContextId),
    /// A fiber handle.
    Fiber(FiberId),
}

impl Value {
    /// A symbol value.
    pub fn sym(name: impl Into<Symbol>) -> Self {
        Value::Symbol(name.into())
    }

    /// A string value.
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    /// A fresh instance of `class`.
    pub fn object(class: impl Into<Symbol>) -> Self {
        Value::Object {
            class: class.into(),
            id: ObjectId::next(),
        }
    }

    /// Whether this is `nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Truthiness: everything except `nil` and `false`.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Name of the value's class.
    pub fn class_name(&self) -> &str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Integer(_) => "Integer",
            Value::Str(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Class(_) => "Class",
            Value::Object { class, .. } => class.as_str(),
            Value::Exception(exception) => exception.class.as_str(),
            Value::Thread(_) => "Thread",
            Value::Fiber(_) => "Fiber",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, ":{s}"),
            Value::Class(name) => write!(f, "{name}"),
            Value::Object { class, id } => write!(f, "#<{class}:{id}>"),
            Value::Exception(exception) => write!(f, "#<{}: {}>", exception.class, exception.message),
            Value::Thread(id) => write!(f, "#<Thread:{id}>"),
            Value::Fiber(id) => write!(f, "#<Fiber:{id}>"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Exception> for Value {
    fn from(value: Exception) -> Self {
        Value::Exception(value)
    }
}

static NEXT_EXCEPTION: AtomicU64 = AtomicU64::new(1);

/// A managed-language exception.
///
/// Equality is identity: two exceptions with the same class and message are
/// still distinct unless one is a clone of the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    /// Exception class name, e.g. `RuntimeError`.
    pub class: Symbol,
    /// Human-readable message.
    pub message: String,
    /// Identity of this exception object.
    pub id: u64,
}

impl Exception {
    /// Create a new exception object.
    pub fn new(class: impl Into<Symbol>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            id: NEXT_EXCEPTION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// A `RuntimeError`.
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    /// An `ArgumentError`.
    pub fn argument_error(message: impl Into<String>) -> Self {
        Self::new("ArgumentError", message)
    }

    /// A `FiberError`.
    pub fn fiber_error(message: impl Into<String>) -> Self {
        Self::new("FiberError", message)
    }

    /// A `NoMethodError`.
    pub fn no_method_error(message: impl Into<String>) -> Self {
        Self::new("NoMethodError", message)
    }

    /// A `LocalJumpError`.
    pub fn local_jump_error(message: impl Into<String>) -> Self {
        Self::new("LocalJumpError", message)
    }

    /// A `SystemStackError`.
    pub fn system_stack_error(message: impl Into<String>) -> Self {
        Self::new("SystemStackError", message)
    }

    /// Whether the exception's class is `class`.
    pub fn is(&self, class: &str) -> bool {
        self.class.as_str() == class
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

impl std::error::Error for Exception {}
