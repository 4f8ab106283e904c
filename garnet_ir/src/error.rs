//! Structural errors in IR graphs.

use crate::instr::Label;

/// Result alias for IR construction and validation.
pub type IrResult<T> = Result<T, IrError>;

/// A malformed scope or control-flow graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("label {0:?} does not name a block")]
    UnknownLabel(Label),

    #[error("label {0:?} is bound to more than one block")]
    DuplicateLabel(Label),

    #[error("block {0:?} is not reachable from the entry block")]
    UnreachableBlock(Label),

    #[error("block {label:?} transfers control at instruction {index} before its end")]
    MisplacedControlTransfer { label: Label, index: usize },

    #[error("raising block {0:?} has no rescuer although a global ensure block exists")]
    MissingRescuer(Label),

    #[error("local variable '{name}' at depth {depth} has no enclosing scope")]
    UnresolvedLocal { name: String, depth: u32 },
}
