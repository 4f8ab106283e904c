//! Garnet intermediate representation.
//!
//! Scopes own control-flow graphs of basic blocks; blocks hold a closed set
//! of instructions. The crate also carries the two analyses the
//! call-protocol pass depends on:
//!
//! - **Scope flags**: does a scope need a binding, a frame, or only the
//!   backref slots of a frame
//! - **Liveness**: per-block live variables and the scope's exit blocks
//!
//! # Lifecycle
//!
//! ```text
//!   ScopeBuilder ──► ScopeTree ──► compute_scope_flags ──► (passes) ──► compute_liveness
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod builder;
pub mod cfg;
pub mod error;
pub mod flags;
pub mod instr;
pub mod liveness;
pub mod operand;
pub mod scope;

pub use builder::ScopeBuilder;
pub use cfg::{BasicBlock, BlockId, Cfg, Edge, EdgeKind};
pub use error::{IrError, IrResult};
pub use flags::compute_scope_flags;
pub use instr::{BlockArgsKind, CallInstr, CallType, FrameVisibility, Instr, Label};
pub use liveness::{compute_liveness, LivenessInfo};
pub use operand::{Literal, LocalVar, Operand, SpecialVar, TempId, Variable};
pub use scope::{CompilationRecord, Scope, ScopeFlags, ScopeId, ScopeKind, ScopeTree, Signature};
