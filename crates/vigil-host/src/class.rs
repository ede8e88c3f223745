//! Classes and their method tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use vigil_core::{CodeBody, Parameter, Symbol, Value};
use vigil_hook::ExecutionContext;

use crate::control::Flow;
use crate::error::{HostError, HostResult};
use crate::method::{Block, Invocation, MethodDef, MethodEntry, MethodKind};

/// A class with a mutable method table.
///
/// Cloning is cheap; clones share the table.
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

struct ClassInner {
    name: Symbol,
    methods: RwLock<HashMap<Symbol, MethodEntry>>,
}

impl Class {
    /// Create an empty class.
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            inner: Arc::new(ClassInner {
                name: name.into(),
                methods: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Class name.
    pub fn name(&self) -> &Symbol {
        &self.inner.name
    }

    /// The class as a value.
    pub fn to_value(&self) -> Value {
        Value::Class(self.inner.name.clone())
    }

    /// A fresh instance.
    pub fn instance(&self) -> Value {
        Value::object(self.inner.name.clone())
    }

    /// Define a method written in the managed language.
    ///
    /// `code` supplies the source position, parameters and end line.
    pub fn define<F>(&self, name: impl Into<Symbol>, code: CodeBody, body: F) -> MethodEntry
    where
        F: Fn(&mut ExecutionContext, &Invocation) -> Flow + Send + Sync + 'static,
    {
        let code = code.shared();
        let parameters = code.parameters().to_vec();
        self.install(
            name.into(),
            parameters,
            MethodKind::Iseq {
                code,
                body: Arc::new(body),
            },
        )
    }

    /// Define a natively implemented method.
    pub fn define_native<F>(&self, name: impl Into<Symbol>, parameters: Vec<Parameter>, body: F) -> MethodEntry
    where
        F: Fn(&mut ExecutionContext, &Invocation) -> Flow + Send + Sync + 'static,
    {
        self.install(
            name.into(),
            parameters,
            MethodKind::Native {
                body: Arc::new(body),
            },
        )
    }

    /// Define a method whose body is `block`.
    pub fn define_bmethod(&self, name: impl Into<Symbol>, block: &Block) -> MethodEntry {
        let parameters = block.code().parameters().to_vec();
        self.install(
            name.into(),
            parameters,
            MethodKind::Bmethod {
                block: block.clone(),
            },
        )
    }

    /// Register `old`'s definition under `new` as well.
    pub fn alias(&self, new: impl Into<Symbol>, old: &str) -> HostResult<MethodEntry> {
        let new = new.into();
        let mut methods = self.inner.methods.write();
        let entry = methods
            .get(old)
            .ok_or_else(|| HostError::UndefinedMethod {
                class: self.inner.name.to_string(),
                method: old.to_string(),
            })?
            .aliased(new.clone());
        methods.insert(new.clone(), entry.clone());
        debug!(class = %self.inner.name, alias = %new, original = old, "Aliased method");
        Ok(entry)
    }

    /// Remove a method. Returns the removed entry.
    pub fn remove(&self, name: &str) -> Option<MethodEntry> {
        self.inner.methods.write().remove(name)
    }

    /// Find a method by the name it is registered under.
    pub fn lookup(&self, name: &str) -> Option<MethodEntry> {
        self.inner.methods.read().get(name).cloned()
    }

    /// Find a method or fail.
    pub fn method(&self, name: &str) -> HostResult<MethodEntry> {
        self.lookup(name).ok_or_else(|| HostError::UndefinedMethod {
            class: self.inner.name.to_string(),
            method: name.to_string(),
        })
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self.inner.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn install(&self, name: Symbol, parameters: Vec<Parameter>, kind: MethodKind) -> MethodEntry {
        let def = Arc::new(MethodDef::new(
            name.clone(),
            self.inner.name.clone(),
            parameters,
            kind,
        ));
        let entry = MethodEntry::new(def, name.clone());
        let replaced = self
            .inner
            .methods
            .write()
            .insert(name.clone(), entry.clone())
            .is_some();
        debug!(class = %self.inner.name, method = %name, replaced, "Defined method");
        entry
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.inner.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::SourceLoc;

    #[test]
    fn test_define_and_alias() {
        let class = Class::new("Greeter");
        let hello = class.define(
            "hello",
            CodeBody::new("hello", SourceLoc::new("greeter.rb", 2)),
            |_, _| Ok(Value::Nil),
        );
        let hi = class.alias("hi", "hello").unwrap();

        assert_eq!(hi.name(), &Symbol::from("hi"));
        assert_eq!(hi.original_name(), &Symbol::from("hello"));
        assert_eq!(hi.def_id(), hello.def_id());
        assert_eq!(class.method_names(), vec![Symbol::from("hello"), Symbol::from("hi")]);
    }

    #[test]
    fn test_alias_of_missing_method() {
        let class = Class::new("Empty");
        assert!(matches!(
            class.alias("x", "y"),
            Err(HostError::UndefinedMethod { .. })
        ));
        assert!(class.method("y").is_err());
    }

    #[test]
    fn test_native_methods_cannot_be_targeted() {
        let class = Class::new("Kernel");
        let puts = class.define_native("puts", Vec::new(), |_, _| Ok(Value::Nil));
        assert!(puts.target().is_err());
    }

    #[test]
    fn test_redefinition_creates_new_def() {
        let class = Class::new("C");
        let loc = SourceLoc::new("c.rb", 1);
        let first = class.define("m", CodeBody::new("m", loc.clone()), |_, _| Ok(Value::Nil));
        let second = class.define("m", CodeBody::new("m", loc), |_, _| Ok(Value::Nil));
        assert_ne!(first.def_id(), second.def_id());
        assert_eq!(class.lookup("m").unwrap().def_id(), second.def_id());
        assert!(class.remove("m").is_some());
        assert!(class.lookup("m").is_none());
    }
}
