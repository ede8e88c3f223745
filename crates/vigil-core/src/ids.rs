//! Identifiers shared across the engine.

use std::borrow::{Borrow, Cow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An interned-style name: method names, class names, local variable names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(Cow<'static, str>);

impl Symbol {
    /// Create a symbol from a static string.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a symbol from any string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The symbol's text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Symbol {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for Symbol {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next identifier.
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// The raw numeric value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Identity of an execution context (one per host thread).
    ContextId,
    NEXT_CONTEXT,
    "thread-"
);

sequential_id!(
    /// Identity of a fiber. Every context starts on its own root fiber.
    FiberId,
    NEXT_FIBER,
    "fiber-"
);

sequential_id!(
    /// Identity of a compiled code body (method body, block body, script).
    CodeId,
    NEXT_CODE,
    "code-"
);

sequential_id!(
    /// Identity of a method definition. Aliases share the definition.
    DefId,
    NEXT_DEF,
    "def-"
);

sequential_id!(
    /// Identity of a single activation on an execution stack.
    FrameTag,
    NEXT_FRAME,
    "frame-"
);

sequential_id!(
    /// Identity of a host object.
    ObjectId,
    NEXT_OBJECT,
    "obj-"
);

/// Unique identifier of a trace session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
    path: Arc<str>,
    line: u32,
}

impl SourceLoc {
    /// Create a location.
    pub fn new(path: impl AsRef<str>, line: u32) -> Self {
        Self {
            path: Arc::from(path.as_ref()),
            line,
        }
    }

    /// Same file, different line.
    pub fn at_line(&self, line: u32) -> Self {
        Self {
            path: Arc::clone(&self.path),
            line,
        }
    }

    /// Source path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Shared handle on the source path.
    pub fn shared_path(&self) -> Arc<str> {
        Arc::clone(&self.path)
    }

    /// Line number, 1-based.
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids_are_unique() {
        let a = CodeId::next();
        let b = CodeId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_symbol_compares_with_str() {
        let sym = Symbol::new("foo");
        assert_eq!(sym, "foo");
        assert_eq!(sym, Symbol::from_static("foo"));
        assert_eq!(sym.to_string(), "foo");
    }

    #[test]
    fn test_symbol_keys_look_up_by_str() {
        let mut methods = std::collections::HashMap::new();
        methods.insert(Symbol::from_static("greet"), 1);
        methods.insert(Symbol::new(format!("{}_{}", "greet", "all")), 2);

        let name = String::from("greet_all");
        assert_eq!(methods.get(name.as_str()), Some(&2));
        assert_eq!(methods.get("greet"), Some(&1));
        assert_eq!(methods.remove("greet"), Some(1));
        assert!(!methods.contains_key("greet"));
    }

    #[test]
    fn test_source_loc_display() {
        let loc = SourceLoc::new("app.rb", 3);
        assert_eq!(loc.to_string(), "app.rb:3");
        assert_eq!(loc.at_line(9).line(), 9);
        assert_eq!(loc.at_line(9).path(), "app.rb");
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new();
        assert_eq!(id.to_string().len(), 36);
        assert_ne!(id, SessionId::default());
    }
}
