//! Methods, blocks and invocations.

use std::fmt;
use std::sync::Arc;

use vigil_core::{
    CodeBody, ConfigurationError, DefId, FrameTag, Parameter, Symbol, TraceResult, Value,
};
use vigil_hook::{ExecutionContext, Locals, TargetCallable};

use crate::control::Flow;

/// Body of a method: receives the running context and the call's arguments.
pub type MethodBody = Arc<dyn Fn(&mut ExecutionContext, &Invocation) -> Flow + Send + Sync>;

/// Body of a block: receives the running context and the yielded values.
pub type BlockBody = Arc<dyn Fn(&mut ExecutionContext, &[Value]) -> Flow + Send + Sync>;

/// Arguments of one method call.
#[derive(Clone)]
pub struct Invocation {
    /// The receiver.
    pub receiver: Value,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Block passed to the call.
    pub block: Option<Block>,
}

impl Invocation {
    /// Positional argument `index`, or `nil`.
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or_default()
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("receiver", &self.receiver)
            .field("args", &self.args)
            .field("block", &self.block.is_some())
            .finish()
    }
}

/// How a method is implemented.
#[derive(Clone)]
pub enum MethodKind {
    /// Managed code with its own body.
    Iseq {
        /// Compiled body.
        code: Arc<CodeBody>,
        /// Implementation.
        body: MethodBody,
    },
    /// A method whose body is a block (`define_method`).
    Bmethod {
        /// The block run as the method body.
        block: Block,
    },
    /// Native code.
    Native {
        /// Implementation.
        body: MethodBody,
    },
}

/// A method definition. Aliases share one definition.
pub struct MethodDef {
    id: DefId,
    name: Symbol,
    owner: Symbol,
    parameters: Vec<Parameter>,
    kind: MethodKind,
}

impl MethodDef {
    pub(crate) fn new(name: Symbol, owner: Symbol, parameters: Vec<Parameter>, kind: MethodKind) -> Self {
        Self {
            id: DefId::next(),
            name,
            owner,
            parameters,
            kind,
        }
    }

    /// Definition identity.
    pub fn id(&self) -> DefId {
        self.id
    }

    /// Original name.
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// Defining class.
    pub fn owner(&self) -> &Symbol {
        &self.owner
    }

    /// Formal parameters.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Implementation.
    pub fn kind(&self) -> &MethodKind {
        &self.kind
    }

    /// Whether the method is native.
    pub fn is_native(&self) -> bool {
        matches!(self.kind, MethodKind::Native { .. })
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MethodKind::Iseq { .. } => "iseq",
            MethodKind::Bmethod { .. } => "bmethod",
            MethodKind::Native { .. } => "native",
        };
        f.debug_struct("MethodDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("kind", &kind)
            .finish()
    }
}

/// A method as found in a class's method table, under the name it was
/// found by.
#[derive(Clone)]
pub struct MethodEntry {
    def: Arc<MethodDef>,
    called_as: Symbol,
}

impl MethodEntry {
    pub(crate) fn new(def: Arc<MethodDef>, called_as: Symbol) -> Self {
        Self { def, called_as }
    }

    /// Name the entry is registered under.
    pub fn name(&self) -> &Symbol {
        &self.called_as
    }

    /// Name of the underlying definition.
    pub fn original_name(&self) -> &Symbol {
        self.def.name()
    }

    /// The definition.
    pub fn def(&self) -> &Arc<MethodDef> {
        &self.def
    }

    /// Definition identity.
    pub fn def_id(&self) -> DefId {
        self.def.id()
    }

    /// Same definition, registered under another name.
    pub(crate) fn aliased(&self, name: Symbol) -> Self {
        Self::new(Arc::clone(&self.def), name)
    }

    /// Target for code-scoped sessions.
    ///
    /// Native methods have no compiled body and cannot be targeted.
    pub fn target(&self) -> TraceResult<TargetCallable> {
        if self.def.is_native() {
            return Err(ConfigurationError::UnsupportedTarget(format!(
                "{}#{}",
                self.def.owner(),
                self.def.name()
            ))
            .into());
        }
        Ok(TargetCallable::Method(self.def.id()))
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("called_as", &self.called_as)
            .field("def", &self.def)
            .finish()
    }
}

/// A block, proc or lambda: code closed over the activation that created it.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

pub(crate) struct BlockInner {
    pub(crate) code: Arc<CodeBody>,
    pub(crate) body: BlockBody,
    pub(crate) receiver: Value,
    pub(crate) method_id: Option<Symbol>,
    pub(crate) callee_id: Option<Symbol>,
    pub(crate) defined_class: Option<Symbol>,
    pub(crate) owner: Option<DefId>,
    pub(crate) home: Option<FrameTag>,
    pub(crate) locals: Locals,
    pub(crate) lambda: bool,
}

impl Block {
    pub(crate) fn new(inner: BlockInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &BlockInner {
        &self.inner
    }

    /// Compiled body.
    pub fn code(&self) -> &Arc<CodeBody> {
        &self.inner.code
    }

    /// Whether `return` and `break` leave only the block itself.
    pub fn is_lambda(&self) -> bool {
        self.inner.lambda
    }

    /// Target for code-scoped sessions.
    pub fn target(&self) -> TargetCallable {
        TargetCallable::Code(self.inner.code.id())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("code", &self.inner.code.label())
            .field("lambda", &self.inner.lambda)
            .finish()
    }
}
