//! Compiler errors.
//!
//! Every variant is an internal precondition or invariant violation. None
//! of them is guest-recoverable; each aborts compilation of its unit.

use garnet_ir::{IrError, Label, TempId};

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Fatal compilation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("pass '{pass}' was already applied to scope '{scope}' and cannot be rerun")]
    PassAlreadyApplied { pass: &'static str, scope: String },

    #[error("global ensure block of '{scope}' ends with '{instr}', which does not transfer control")]
    MalformedEnsureBlock { scope: String, instr: String },

    #[error("entry block of closure '{scope}' has no fall-through successor")]
    MissingFallThrough { scope: String },

    #[error("call to '{name}' passes {arity} arguments; at most {max} are supported")]
    TooManyArguments { name: String, arity: usize, max: usize },

    #[error("label {label:?} in '{scope}' does not name a block")]
    UnknownLabel { scope: String, label: Label },

    #[error("temporary {temp:?} in '{scope}' may be read before it is written")]
    UndefinedTemp { scope: String, temp: TempId },

    #[error("local '{name}' in '{scope}' does not resolve to an enclosing scope")]
    UnresolvedLocal { scope: String, name: String },

    #[error("malformed graph: {0}")]
    Ir(#[from] IrError),
}
