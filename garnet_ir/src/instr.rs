//! Instruction vocabulary.
//!
//! Only the shape of the instruction stream that matters for call protocol
//! and dispatch is modelled. The enum is closed: passes and the code
//! generator match it exhaustively, so adding a kind forces every consumer
//! to decide what it means.

use crate::operand::{Literal, Operand, SpecialVar, TempId, Variable};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Labels
// =============================================================================

/// Names a basic block. Allocated per scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// =============================================================================
// Operand Groups
// =============================================================================

/// How a call names its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    /// `recv.foo(...)`: private methods are not visible.
    Normal,
    /// `foo(...)` with implicit self: private methods are visible.
    Functional,
    /// Bare identifier that might be a method call.
    Variable,
    /// `super(...)`: lookup starts above the defining class.
    Super,
}

/// Default visibility of a pushed method frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameVisibility {
    Public,
    Private,
}

/// Block-argument preparation chosen from a closure signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockArgsKind {
    /// The closure takes no parameters; incoming arguments are dropped.
    NoArgs,
    /// Exactly one required parameter.
    SingleArg,
    /// Anything else. `strict` closures (lambdas) reject a wrong count.
    General { required: u32, strict: bool },
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInstr {
    pub dst: Option<TempId>,
    pub receiver: Operand,
    pub name: Arc<str>,
    pub args: SmallVec<[Operand; 4]>,
    pub closure: Option<Operand>,
    pub call_type: CallType,
}

impl CallInstr {
    pub fn new(dst: Option<TempId>, receiver: Operand, name: &str, args: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            dst,
            receiver,
            name: Arc::from(name),
            args: args.into_iter().collect(),
            closure: None,
            call_type: CallType::Normal,
        }
    }

    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.call_type = call_type;
        self
    }

    pub fn with_closure(mut self, closure: Operand) -> Self {
        self.closure = Some(closure);
        self
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// One IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // --- data movement ---
    Copy { dst: Variable, src: Operand },
    LoadLiteral { dst: TempId, value: Literal },
    /// Read positional argument `index` of the current activation.
    ReceiveArg { dst: Variable, index: u32 },
    LoadSpecial { dst: TempId, var: SpecialVar },
    StoreSpecial { var: SpecialVar, src: Operand },

    // --- dispatch ---
    Call(CallInstr),

    // --- call protocol ---
    PushMethodFrame { name: Arc<str>, visibility: FrameVisibility },
    PushBackrefFrame,
    PopMethodFrame,
    PopBackrefFrame,
    SaveBindingVisibility { dst: TempId },
    RestoreBindingVisibility { src: TempId },
    /// Push a block frame, saving the previous frame depth into `dst`.
    PushBlockFrame { dst: TempId },
    /// Restore the frame depth saved by the matching push.
    PopBlockFrame { src: TempId },
    PushMethodBinding,
    PushBlockBinding,
    PopBinding,
    UpdateBlockState { block_self: Operand },
    PrepareBlockArgs { kind: BlockArgsKind },

    // --- control ---
    ReceiveException { dst: TempId },
    Throw { value: Operand },
    Return { value: Operand },
    Jump { target: Label },
    Branch { cond: Operand, if_true: Label, if_false: Label },
}

impl Instr {
    /// Whether control never falls through to the next instruction.
    #[inline]
    pub fn transfers_control(&self) -> bool {
        matches!(
            self,
            Instr::Throw { .. } | Instr::Return { .. } | Instr::Jump { .. } | Instr::Branch { .. }
        )
    }

    /// Whether executing this instruction may raise a guest exception.
    #[inline]
    pub fn can_raise(&self) -> bool {
        matches!(
            self,
            Instr::Call(_) | Instr::PrepareBlockArgs { .. } | Instr::Throw { .. }
        )
    }

    #[inline]
    pub fn is_return(&self) -> bool {
        matches!(self, Instr::Return { .. })
    }

    /// Whether this is one of the frame/binding bookkeeping instructions.
    pub fn is_call_protocol(&self) -> bool {
        matches!(
            self,
            Instr::PushMethodFrame { .. }
                | Instr::PushBackrefFrame
                | Instr::PopMethodFrame
                | Instr::PopBackrefFrame
                | Instr::SaveBindingVisibility { .. }
                | Instr::RestoreBindingVisibility { .. }
                | Instr::PushBlockFrame { .. }
                | Instr::PopBlockFrame { .. }
                | Instr::PushMethodBinding
                | Instr::PushBlockBinding
                | Instr::PopBinding
                | Instr::UpdateBlockState { .. }
                | Instr::PrepareBlockArgs { .. }
        )
    }

    /// The variable written by this instruction.
    pub fn defined(&self) -> Option<Variable> {
        match self {
            Instr::Copy { dst, .. } | Instr::ReceiveArg { dst, .. } => Some(dst.clone()),
            Instr::LoadLiteral { dst, .. }
            | Instr::LoadSpecial { dst, .. }
            | Instr::SaveBindingVisibility { dst }
            | Instr::PushBlockFrame { dst }
            | Instr::ReceiveException { dst } => Some(Variable::Temp(*dst)),
            Instr::Call(call) => call.dst.map(Variable::Temp),
            Instr::StoreSpecial { .. }
            | Instr::PushMethodFrame { .. }
            | Instr::PushBackrefFrame
            | Instr::PopMethodFrame
            | Instr::PopBackrefFrame
            | Instr::RestoreBindingVisibility { .. }
            | Instr::PopBlockFrame { .. }
            | Instr::PushMethodBinding
            | Instr::PushBlockBinding
            | Instr::PopBinding
            | Instr::UpdateBlockState { .. }
            | Instr::PrepareBlockArgs { .. }
            | Instr::Throw { .. }
            | Instr::Return { .. }
            | Instr::Jump { .. }
            | Instr::Branch { .. } => None,
        }
    }

    /// Every operand read by this instruction.
    pub fn operands(&self) -> SmallVec<[&Operand; 4]> {
        let mut out = SmallVec::new();
        match self {
            Instr::Copy { src, .. } | Instr::StoreSpecial { src, .. } => out.push(src),
            Instr::Call(call) => {
                out.push(&call.receiver);
                out.extend(call.args.iter());
                out.extend(call.closure.iter());
            }
            Instr::UpdateBlockState { block_self } => out.push(block_self),
            Instr::Throw { value } | Instr::Return { value } => out.push(value),
            Instr::Branch { cond, .. } => out.push(cond),
            Instr::LoadLiteral { .. }
            | Instr::ReceiveArg { .. }
            | Instr::LoadSpecial { .. }
            | Instr::PushMethodFrame { .. }
            | Instr::PushBackrefFrame
            | Instr::PopMethodFrame
            | Instr::PopBackrefFrame
            | Instr::SaveBindingVisibility { .. }
            | Instr::RestoreBindingVisibility { .. }
            | Instr::PushBlockFrame { .. }
            | Instr::PopBlockFrame { .. }
            | Instr::PushMethodBinding
            | Instr::PushBlockBinding
            | Instr::PopBinding
            | Instr::PrepareBlockArgs { .. }
            | Instr::ReceiveException { .. }
            | Instr::Jump { .. } => {}
        }
        out
    }

    /// Variables read by this instruction, including temporaries consumed
    /// by restore/pop instructions.
    pub fn used_variables(&self) -> SmallVec<[Variable; 4]> {
        let mut out: SmallVec<[Variable; 4]> =
            self.operands().into_iter().filter_map(Operand::as_variable).collect();
        match self {
            Instr::RestoreBindingVisibility { src } | Instr::PopBlockFrame { src } => {
                out.push(Variable::Temp(*src));
            }
            _ => {}
        }
        out
    }

    /// Branch targets named by this instruction.
    pub fn targets(&self) -> SmallVec<[Label; 2]> {
        match self {
            Instr::Jump { target } => smallvec::smallvec![*target],
            Instr::Branch { if_true, if_false, .. } => smallvec::smallvec![*if_true, *if_false],
            _ => SmallVec::new(),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Copy { dst, src } => write!(f, "{dst:?} = copy {src:?}"),
            Instr::LoadLiteral { dst, value } => write!(f, "{dst:?} = literal {value:?}"),
            Instr::ReceiveArg { dst, index } => write!(f, "{dst:?} = recv_arg {index}"),
            Instr::LoadSpecial { dst, var } => write!(f, "{dst:?} = load_special {var:?}"),
            Instr::StoreSpecial { var, src } => write!(f, "store_special {var:?}, {src:?}"),
            Instr::Call(call) => {
                if let Some(dst) = call.dst {
                    write!(f, "{dst:?} = ")?;
                }
                write!(f, "call[{:?}] {:?}.{}({:?})", call.call_type, call.receiver, call.name, call.args.as_slice())?;
                if let Some(closure) = &call.closure {
                    write!(f, " &{closure:?}")?;
                }
                Ok(())
            }
            Instr::PushMethodFrame { name, visibility } => write!(f, "push_method_frame {name}, {visibility:?}"),
            Instr::PushBackrefFrame => f.write_str("push_backref_frame"),
            Instr::PopMethodFrame => f.write_str("pop_method_frame"),
            Instr::PopBackrefFrame => f.write_str("pop_backref_frame"),
            Instr::SaveBindingVisibility { dst } => write!(f, "{dst:?} = save_binding_visibility"),
            Instr::RestoreBindingVisibility { src } => write!(f, "restore_binding_visibility {src:?}"),
            Instr::PushBlockFrame { dst } => write!(f, "{dst:?} = push_block_frame"),
            Instr::PopBlockFrame { src } => write!(f, "pop_block_frame {src:?}"),
            Instr::PushMethodBinding => f.write_str("push_method_binding"),
            Instr::PushBlockBinding => f.write_str("push_block_binding"),
            Instr::PopBinding => f.write_str("pop_binding"),
            Instr::UpdateBlockState { block_self } => write!(f, "update_block_state {block_self:?}"),
            Instr::PrepareBlockArgs { kind } => write!(f, "prepare_block_args {kind:?}"),
            Instr::ReceiveException { dst } => write!(f, "{dst:?} = recv_exception"),
            Instr::Throw { value } => write!(f, "throw {value:?}"),
            Instr::Return { value } => write!(f, "return {value:?}"),
            Instr::Jump { target } => write!(f, "jump {target:?}"),
            Instr::Branch { cond, if_true, if_false } => {
                write!(f, "branch {cond:?}, {if_true:?}, {if_false:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::LocalVar;

    #[test]
    fn test_control_transfer_kinds() {
        assert!(Instr::Return { value: Operand::SelfRef }.transfers_control());
        assert!(Instr::Jump { target: Label(1) }.transfers_control());
        assert!(Instr::Throw { value: Operand::SelfRef }.transfers_control());
        assert!(!Instr::PopBinding.transfers_control());
        assert!(!Instr::Call(CallInstr::new(None, Operand::SelfRef, "x", [])).transfers_control());
    }

    #[test]
    fn test_can_raise() {
        assert!(Instr::Call(CallInstr::new(None, Operand::SelfRef, "x", [])).can_raise());
        assert!(Instr::PrepareBlockArgs { kind: BlockArgsKind::NoArgs }.can_raise());
        assert!(!Instr::PushMethodBinding.can_raise());
        assert!(!Instr::Return { value: Operand::SelfRef }.can_raise());
    }

    #[test]
    fn test_uses_and_defs() {
        let call = Instr::Call(CallInstr::new(
            Some(TempId(2)),
            Operand::Temp(TempId(0)),
            "+",
            [Operand::local("x", 0)],
        ));
        assert_eq!(call.defined(), Some(Variable::Temp(TempId(2))));
        assert_eq!(
            call.used_variables().into_vec(),
            vec![Variable::Temp(TempId(0)), Variable::Local(LocalVar::new("x", 0))]
        );

        let pop = Instr::PopBlockFrame { src: TempId(7) };
        assert_eq!(pop.used_variables().into_vec(), vec![Variable::Temp(TempId(7))]);
    }

    #[test]
    fn test_targets() {
        let br = Instr::Branch { cond: Operand::SelfRef, if_true: Label(1), if_false: Label(2) };
        assert_eq!(br.targets().into_vec(), vec![Label(1), Label(2)]);
        assert!(Instr::PopBinding.targets().is_empty());
    }

    #[test]
    fn test_display() {
        let call = Instr::Call(CallInstr::new(Some(TempId(1)), Operand::SelfRef, "foo", [Operand::fixnum(1)]));
        assert_eq!(call.to_string(), "%t1 = call[Normal] self.foo([1])");
    }
}
