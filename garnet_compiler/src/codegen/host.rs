//! Host operations.
//!
//! A [`HostFunction`] is the lowered form of one instrumented scope: a flat
//! op list over a register file, with branch targets resolved to op
//! indices and a rescue table mapping op ranges to handlers.

use garnet_ir::{BlockArgsKind, ScopeKind, Signature, SpecialVar};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// A virtual register.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

impl Reg {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Values that need no literal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Immediate {
    Nil,
    True,
    False,
}

/// One host operation.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    // Data movement
    Move { dst: Reg, src: Reg },
    LoadSelf { dst: Reg },
    LoadImmediate { dst: Reg, imm: Immediate },
    LoadLiteral { dst: Reg, slot: u32 },
    LoadArg { dst: Reg, index: u32 },
    /// Read a slot of the binding `depth` links up from the current one.
    LoadLocal { dst: Reg, depth: u32, slot: u32 },
    StoreLocal { depth: u32, slot: u32, src: Reg },
    /// Read a slot through the binding a closure captured.
    LoadCaptured { dst: Reg, depth: u32, slot: u32 },
    StoreCaptured { depth: u32, slot: u32, src: Reg },
    LoadSpecial { dst: Reg, var: SpecialVar },
    StoreSpecial { var: SpecialVar, src: Reg },

    // Dispatch
    Invoke {
        dst: Reg,
        site: u32,
        receiver: Reg,
        args: SmallVec<[Reg; 4]>,
        block: Option<Reg>,
    },
    InvokeFixnum { dst: Reg, site: u32, receiver: Reg, imm: i64 },
    InvokeFloat { dst: Reg, site: u32, receiver: Reg, imm: f64 },
    Probe { dst: Reg, site: u32, receiver: Reg },

    // Call protocol
    PushMethodFrame { name: Arc<str>, private: bool },
    PushBackrefFrame,
    PopMethodFrame,
    PopBackrefFrame,
    SaveVisibility { dst: Reg },
    RestoreVisibility { src: Reg },
    PushBlockFrame { dst: Reg },
    PopBlockFrame { src: Reg },
    PushMethodBinding { slots: u32 },
    PushBlockBinding { slots: u32 },
    PopBinding,
    UpdateBlockState { block_self: Reg },
    PrepareBlockArgs { kind: BlockArgsKind },

    // Control
    ReceiveException { dst: Reg },
    Throw { src: Reg },
    Return { src: Reg },
    Jump { pc: u32 },
    Branch { cond: Reg, if_true: u32, if_false: u32 },
}

impl HostOp {
    /// Whether this op ends straight-line execution.
    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            HostOp::Throw { .. } | HostOp::Return { .. } | HostOp::Jump { .. } | HostOp::Branch { .. }
        )
    }

    /// Frame and binding bookkeeping ops.
    pub fn is_call_protocol(&self) -> bool {
        matches!(
            self,
            HostOp::PushMethodFrame { .. }
                | HostOp::PushBackrefFrame
                | HostOp::PopMethodFrame
                | HostOp::PopBackrefFrame
                | HostOp::SaveVisibility { .. }
                | HostOp::RestoreVisibility { .. }
                | HostOp::PushBlockFrame { .. }
                | HostOp::PopBlockFrame { .. }
                | HostOp::PushMethodBinding { .. }
                | HostOp::PushBlockBinding { .. }
                | HostOp::PopBinding
                | HostOp::UpdateBlockState { .. }
                | HostOp::PrepareBlockArgs { .. }
        )
    }
}

/// Ops in `start_pc..end_pc` that raise continue at `handler_pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescueEntry {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
}

impl RescueEntry {
    #[inline]
    pub fn covers(&self, pc: u32) -> bool {
        self.start_pc <= pc && pc < self.end_pc
    }
}

/// A lowered scope.
#[derive(Debug, Clone)]
pub struct HostFunction {
    pub name: Arc<str>,
    pub kind: ScopeKind,
    pub signature: Signature,
    /// Register file size.
    pub registers: u32,
    pub ops: Vec<HostOp>,
    pub rescue_table: Vec<RescueEntry>,
    /// Slots of the binding this function pushes, if any.
    pub binding_slots: u32,
    /// Whether frame and binding management is explicit in `ops`.
    pub explicit_call_protocol: bool,
}

impl HostFunction {
    /// Handler for a raise at `pc`; inner ranges win.
    pub fn handler_for(&self, pc: u32) -> Option<u32> {
        self.rescue_table
            .iter()
            .filter(|entry| entry.covers(pc))
            .min_by_key(|entry| entry.end_pc - entry.start_pc)
            .map(|entry| entry.handler_pc)
    }

    /// Number of ops of the given shape.
    pub fn count_ops(&self, pred: impl Fn(&HostOp) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    /// Human-readable listing.
    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "function {} ({:?}, {} registers, binding slots {})\n",
            self.name, self.kind, self.registers, self.binding_slots
        );
        for (pc, op) in self.ops.iter().enumerate() {
            out.push_str(&format!("{pc:5}  {op:?}\n"));
        }
        for entry in &self.rescue_table {
            out.push_str(&format!(
                "  rescue {}..{} -> {}\n",
                entry.start_pc, entry.end_pc, entry.handler_pc
            ));
        }
        out
    }
}
