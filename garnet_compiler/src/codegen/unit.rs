//! Compiled units.
//!
//! A unit is everything one compilation produced: the lowered functions
//! plus three side tables that the runtime materializes on load.
//!
//! ```text
//!   CompiledUnit
//!   ├── functions   HostFunction per scope
//!   ├── sites       one descriptor per call expression ──┐
//!   ├── helpers     shared dispatch helpers  ◄────────────┘ (many sites, one helper)
//!   └── literals    deduplicated literal slots
//! ```

use super::host::HostFunction;
use garnet_ir::{CallType, Literal};
use garnet_runtime::BinaryOp;
use std::sync::Arc;

/// How a call site dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    Normal,
    /// Receiverless call; private methods are visible.
    Functional,
    /// Bare identifier that might be a method call.
    Variable,
    /// Dispatch starting above the current method's owner.
    Super,
    /// Binary operator with a primitive fast path.
    Operator(BinaryOp),
    /// `respond_to?` with a constant method name.
    RespondTo(Arc<str>),
}

impl SiteKind {
    /// Call type used for the generic lookup.
    pub fn call_type(&self) -> CallType {
        match self {
            SiteKind::Functional => CallType::Functional,
            SiteKind::Variable => CallType::Variable,
            SiteKind::Super => CallType::Super,
            SiteKind::Normal | SiteKind::Operator(_) | SiteKind::RespondTo(_) => CallType::Normal,
        }
    }
}

/// One call expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDescriptor {
    pub name: Arc<str>,
    pub kind: SiteKind,
    pub arity: usize,
    pub has_closure: bool,
    /// Index into [`CompiledUnit::helpers`].
    pub helper: u32,
}

/// A shared dispatch helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperDescriptor {
    /// Unique across the process.
    pub symbol: Arc<str>,
    pub method: Arc<str>,
    pub arity: usize,
    pub has_closure: bool,
    pub call_type: CallType,
}

/// One literal slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralDescriptor {
    /// Structural key the slot was deduplicated by.
    pub key: String,
    pub value: Literal,
}

/// Output of compiling one unit.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: Arc<str>,
    pub functions: Vec<HostFunction>,
    pub sites: Vec<SiteDescriptor>,
    pub helpers: Vec<HelperDescriptor>,
    pub literals: Vec<LiteralDescriptor>,
}

impl CompiledUnit {
    /// Find a function by scope name.
    pub fn function(&self, name: &str) -> Option<&HostFunction> {
        self.functions.iter().find(|f| &*f.name == name)
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| &*f.name == name)
    }
}
