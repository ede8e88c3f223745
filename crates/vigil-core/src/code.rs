//! Compiled code bodies and parameter descriptions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::{CodeId, SourceLoc, Symbol};

/// Kind of a formal parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Required positional.
    Req,
    /// Optional positional.
    Opt,
    /// Splat.
    Rest,
    /// Required keyword.
    Keyreq,
    /// Optional keyword.
    Key,
    /// Double splat.
    Keyrest,
    /// Block parameter.
    Block,
}

/// A formal parameter of a method or block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    /// The parameter kind.
    pub kind: ParamKind,
    /// The parameter name, absent for anonymous parameters.
    pub name: Option<Symbol>,
}

impl Parameter {
    /// A required positional parameter.
    pub fn req(name: impl Into<Symbol>) -> Self {
        Self {
            kind: ParamKind::Req,
            name: Some(name.into()),
        }
    }

    /// An optional positional parameter.
    pub fn opt(name: impl Into<Symbol>) -> Self {
        Self {
            kind: ParamKind::Opt,
            name: Some(name.into()),
        }
    }

    /// A parameter of any kind.
    pub fn new(kind: ParamKind, name: Option<Symbol>) -> Self {
        Self { kind, name }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = serde_name(self.kind);
        match &self.name {
            Some(name) => write!(f, "[:{kind}, :{name}]"),
            None => write!(f, "[:{kind}]"),
        }
    }
}

fn serde_name(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::Req => "req",
        ParamKind::Opt => "opt",
        ParamKind::Rest => "rest",
        ParamKind::Keyreq => "keyreq",
        ParamKind::Key => "key",
        ParamKind::Keyrest => "keyrest",
        ParamKind::Block => "block",
    }
}

/// A unit of compiled code: a method body, a block body or a script.
///
/// Bodies form a lexical tree through `parent`, which is what code-targeted
/// sessions use to decide whether a frame lies inside their target.
#[derive(Debug)]
pub struct CodeBody {
    id: CodeId,
    label: Symbol,
    loc: SourceLoc,
    end_line: Option<u32>,
    parameters: Vec<Parameter>,
    parent: Option<Arc<CodeBody>>,
}

impl CodeBody {
    /// Create a root body.
    pub fn new(label: impl Into<Symbol>, loc: SourceLoc) -> Self {
        Self {
            id: CodeId::next(),
            label: label.into(),
            loc,
            end_line: None,
            parameters: Vec::new(),
            parent: None,
        }
    }

    /// Nest this body inside `parent`.
    pub fn with_parent(mut self, parent: Option<Arc<CodeBody>>) -> Self {
        self.parent = parent;
        self
    }

    /// Set the formal parameters.
    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the line reported when the body finishes.
    pub fn with_end_line(mut self, line: u32) -> Self {
        self.end_line = Some(line);
        self
    }

    /// Wrap in an `Arc`.
    pub fn shared(self) -> Arc<CodeBody> {
        Arc::new(self)
    }

    /// Body identity.
    pub fn id(&self) -> CodeId {
        self.id
    }

    /// Descriptive label, e.g. `foo` or `block in foo`.
    pub fn label(&self) -> &Symbol {
        &self.label
    }

    /// Where the body starts.
    pub fn loc(&self) -> &SourceLoc {
        &self.loc
    }

    /// Line reported on exit, if one was recorded.
    pub fn end_line(&self) -> Option<u32> {
        self.end_line
    }

    /// Formal parameters.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Lexically enclosing body.
    pub fn parent(&self) -> Option<&Arc<CodeBody>> {
        self.parent.as_ref()
    }

    /// Whether this body is `ancestor` or nested anywhere inside it.
    pub fn descends_from(&self, ancestor: CodeId) -> bool {
        let mut current = Some(self);
        while let Some(body) = current {
            if body.id == ancestor {
                return true;
            }
            current = body.parent.as_deref();
        }
        false
    }
}

impl fmt::Display for CodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<code:{}@{}>", self.label, self.loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descends_from_walks_parents() {
        let method = CodeBody::new("foo", SourceLoc::new("a.rb", 1)).shared();
        let block = CodeBody::new("block in foo", SourceLoc::new("a.rb", 2))
            .with_parent(Some(Arc::clone(&method)))
            .shared();
        let inner = CodeBody::new("block (2 levels) in foo", SourceLoc::new("a.rb", 3))
            .with_parent(Some(Arc::clone(&block)))
            .shared();

        assert!(inner.descends_from(method.id()));
        assert!(inner.descends_from(block.id()));
        assert!(!method.descends_from(block.id()));
    }

    #[test]
    fn test_parameter_display() {
        assert_eq!(Parameter::req("a").to_string(), "[:req, :a]");
        assert_eq!(Parameter::new(ParamKind::Rest, None).to_string(), "[:rest]");
    }
}
