//! Lowering of one instrumented scope to a [`HostFunction`].
//!
//! # Register layout
//!
//! ```text
//!   r0 .. rT          temporaries, %tN -> rN
//!   rT .. rT+L        locals of scopes that keep them out of a binding
//!   rT+L ..           scratch, one per materialized operand
//! ```
//!
//! # Locals
//!
//! A scope that pushes its own binding (or an eval body, which runs in its
//! caller's) reads locals through the binding chain. A closure without a
//! binding of its own reaches outer locals through the binding it
//! captured, one link shorter. Everything else lives in registers.

use super::emitter::{LiteralRef, UnitEmitter};
use super::host::{HostFunction, HostOp, Reg, RescueEntry};
use super::unit::SiteKind;
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use garnet_ir::{
    CallInstr, CallType, EdgeKind, FrameVisibility, Instr, Label, Literal, LocalVar, Operand, Scope, ScopeId,
    ScopeKind, ScopeTree, Variable,
};
use garnet_runtime::BinaryOp;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

const RESPOND_TO: &str = "respond_to?";

/// Where a local lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalHome {
    Register(Reg),
    Binding { depth: u32, slot: u32 },
    Captured { depth: u32, slot: u32 },
}

/// A branch whose target is not yet known.
#[derive(Debug)]
struct Fixup {
    pc: usize,
    label: Label,
}

struct FunctionLowerer<'a> {
    tree: &'a ScopeTree,
    id: ScopeId,
    scope: &'a Scope,
    emitter: &'a mut UnitEmitter,
    config: &'a CompilerConfig,
    ops: Vec<HostOp>,
    next_reg: u32,
    local_base: u32,
    locals_in_binding: bool,
    owns_binding: bool,
    block_pcs: FxHashMap<Label, u32>,
    fixups: Vec<Fixup>,
    pending_rescues: Vec<(u32, u32, Label)>,
}

/// Lower scope `id` of `tree`. The scope should already be instrumented.
pub fn lower_scope(
    tree: &ScopeTree,
    id: ScopeId,
    emitter: &mut UnitEmitter,
    config: &CompilerConfig,
) -> CompileResult<HostFunction> {
    let scope = tree.get(id);
    let temps = scope.temp_count();
    let locals = scope.locals().len() as u32;
    let owns_binding = scope.needs_binding() && scope.supports_explicit_call_protocol();
    let lowerer = FunctionLowerer {
        tree,
        id,
        scope,
        emitter,
        config,
        ops: Vec::new(),
        next_reg: temps + locals,
        local_base: temps,
        locals_in_binding: owns_binding || scope.kind() == ScopeKind::Eval,
        owns_binding,
        block_pcs: FxHashMap::default(),
        fixups: Vec::new(),
        pending_rescues: Vec::new(),
    };
    lowerer.lower()
}

impl<'a> FunctionLowerer<'a> {
    fn lower(mut self) -> CompileResult<HostFunction> {
        let scope: &'a Scope = self.scope;
        let cfg = scope.cfg();
        let layout = cfg.layout();

        for (position, &block) in layout.iter().enumerate() {
            let bb = cfg.block(block);
            let start = self.pc();
            self.block_pcs.insert(bb.label(), start);

            for instr in bb.instrs() {
                self.lower_instr(instr)?;
            }

            let falls_through = bb.last().map_or(true, |last| !last.transfers_control());
            if falls_through {
                if let Some(next) = cfg.outgoing_of_kind(block, EdgeKind::FallThrough) {
                    if layout.get(position + 1) != Some(&next) {
                        self.jump_to(cfg.block(next).label());
                    }
                }
            }

            if let Some(rescuer) = bb.rescuer() {
                let end = self.pc();
                if end > start {
                    self.pending_rescues.push((start, end, cfg.block(rescuer).label()));
                }
            }
        }

        self.resolve()
    }

    /// Patch branch targets and build the rescue table.
    fn resolve(mut self) -> CompileResult<HostFunction> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.label_pc(fixup.label)?;
            match &mut self.ops[fixup.pc] {
                HostOp::Jump { pc } => *pc = target,
                HostOp::Branch { if_true, if_false, .. } => {
                    // Both arms are fixed up separately; the placeholder is u32::MAX.
                    if *if_true == u32::MAX {
                        *if_true = target;
                    } else {
                        *if_false = target;
                    }
                }
                _ => {}
            }
        }

        let mut rescue_table = Vec::with_capacity(self.pending_rescues.len());
        for &(start_pc, end_pc, label) in &self.pending_rescues {
            rescue_table.push(RescueEntry {
                start_pc,
                end_pc,
                handler_pc: self.label_pc(label)?,
            });
        }

        Ok(HostFunction {
            name: self.scope.name_arc().clone(),
            kind: self.scope.kind(),
            signature: self.scope.signature(),
            registers: self.next_reg,
            ops: self.ops,
            rescue_table,
            binding_slots: if self.owns_binding {
                self.scope.locals().len() as u32
            } else {
                0
            },
            explicit_call_protocol: self.scope.uses_explicit_call_protocol(),
        })
    }

    #[inline]
    fn pc(&self) -> u32 {
        self.ops.len() as u32
    }

    fn label_pc(&self, label: Label) -> CompileResult<u32> {
        self.block_pcs
            .get(&label)
            .copied()
            .ok_or_else(|| CompileError::UnknownLabel {
                scope: self.scope.name().to_string(),
                label,
            })
    }

    fn scratch(&mut self) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        reg
    }

    fn jump_to(&mut self, label: Label) {
        self.fixups.push(Fixup {
            pc: self.ops.len(),
            label,
        });
        self.ops.push(HostOp::Jump { pc: u32::MAX });
    }

    // =========================================================================
    // Operands
    // =========================================================================

    fn home(&self, local: &LocalVar) -> CompileResult<LocalHome> {
        let unresolved = || CompileError::UnresolvedLocal {
            scope: self.scope.name().to_string(),
            name: local.name.to_string(),
        };
        let owner = self.tree.ancestor(self.id, local.depth).ok_or_else(unresolved)?;
        let slot = self.tree.get(owner).local_slot(&local.name).ok_or_else(unresolved)? as u32;

        Ok(if local.depth == 0 && !self.locals_in_binding {
            LocalHome::Register(Reg(self.local_base + slot))
        } else if self.locals_in_binding {
            LocalHome::Binding {
                depth: local.depth,
                slot,
            }
        } else {
            LocalHome::Captured {
                depth: local.depth - 1,
                slot,
            }
        })
    }

    /// Register holding `operand`, emitting a load if it is not already in one.
    fn read(&mut self, operand: &Operand) -> CompileResult<Reg> {
        match operand {
            Operand::Temp(t) => Ok(Reg(t.0)),
            Operand::Local(local) => match self.home(local)? {
                LocalHome::Register(reg) => Ok(reg),
                LocalHome::Binding { depth, slot } => {
                    let dst = self.scratch();
                    self.ops.push(HostOp::LoadLocal { dst, depth, slot });
                    Ok(dst)
                }
                LocalHome::Captured { depth, slot } => {
                    let dst = self.scratch();
                    self.ops.push(HostOp::LoadCaptured { dst, depth, slot });
                    Ok(dst)
                }
            },
            Operand::Literal(literal) => {
                let dst = self.scratch();
                self.load_literal(dst, literal);
                Ok(dst)
            }
            Operand::SelfRef => {
                let dst = self.scratch();
                self.ops.push(HostOp::LoadSelf { dst });
                Ok(dst)
            }
        }
    }

    fn load_literal(&mut self, dst: Reg, literal: &Literal) {
        match self.emitter.literal(literal) {
            LiteralRef::Immediate(imm) => self.ops.push(HostOp::LoadImmediate { dst, imm }),
            LiteralRef::Slot(slot) => self.ops.push(HostOp::LoadLiteral { dst, slot }),
        }
    }

    /// Register to write `var` into, plus the store that must follow.
    fn write(&mut self, var: &Variable) -> CompileResult<(Reg, Option<HostOp>)> {
        match var {
            Variable::Temp(t) => Ok((Reg(t.0), None)),
            Variable::Local(local) => match self.home(local)? {
                LocalHome::Register(reg) => Ok((reg, None)),
                LocalHome::Binding { depth, slot } => {
                    let src = self.scratch();
                    Ok((src, Some(HostOp::StoreLocal { depth, slot, src })))
                }
                LocalHome::Captured { depth, slot } => {
                    let src = self.scratch();
                    Ok((src, Some(HostOp::StoreCaptured { depth, slot, src })))
                }
            },
        }
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn lower_instr(&mut self, instr: &Instr) -> CompileResult<()> {
        match instr {
            Instr::Copy { dst, src } => {
                let src = self.read(src)?;
                let (dst, store) = self.write(dst)?;
                if dst != src {
                    self.ops.push(HostOp::Move { dst, src });
                }
                self.ops.extend(store);
            }
            Instr::LoadLiteral { dst, value } => self.load_literal(Reg(dst.0), value),
            Instr::ReceiveArg { dst, index } => {
                let (reg, store) = self.write(dst)?;
                self.ops.push(HostOp::LoadArg { dst: reg, index: *index });
                self.ops.extend(store);
            }
            Instr::LoadSpecial { dst, var } => self.ops.push(HostOp::LoadSpecial {
                dst: Reg(dst.0),
                var: *var,
            }),
            Instr::StoreSpecial { var, src } => {
                let src = self.read(src)?;
                self.ops.push(HostOp::StoreSpecial { var: *var, src });
            }
            Instr::Call(call) => self.lower_call(call)?,

            Instr::PushMethodFrame { name, visibility } => self.ops.push(HostOp::PushMethodFrame {
                name: name.clone(),
                private: *visibility == FrameVisibility::Private,
            }),
            Instr::PushBackrefFrame => self.ops.push(HostOp::PushBackrefFrame),
            Instr::PopMethodFrame => self.ops.push(HostOp::PopMethodFrame),
            Instr::PopBackrefFrame => self.ops.push(HostOp::PopBackrefFrame),
            Instr::SaveBindingVisibility { dst } => self.ops.push(HostOp::SaveVisibility { dst: Reg(dst.0) }),
            Instr::RestoreBindingVisibility { src } => {
                self.ops.push(HostOp::RestoreVisibility { src: Reg(src.0) })
            }
            Instr::PushBlockFrame { dst } => self.ops.push(HostOp::PushBlockFrame { dst: Reg(dst.0) }),
            Instr::PopBlockFrame { src } => self.ops.push(HostOp::PopBlockFrame { src: Reg(src.0) }),
            Instr::PushMethodBinding => self.ops.push(HostOp::PushMethodBinding {
                slots: self.scope.locals().len() as u32,
            }),
            Instr::PushBlockBinding => self.ops.push(HostOp::PushBlockBinding {
                slots: self.scope.locals().len() as u32,
            }),
            Instr::PopBinding => self.ops.push(HostOp::PopBinding),
            Instr::UpdateBlockState { block_self } => {
                let block_self = self.read(block_self)?;
                self.ops.push(HostOp::UpdateBlockState { block_self });
            }
            Instr::PrepareBlockArgs { kind } => self.ops.push(HostOp::PrepareBlockArgs { kind: *kind }),

            Instr::ReceiveException { dst } => self.ops.push(HostOp::ReceiveException { dst: Reg(dst.0) }),
            Instr::Throw { value } => {
                let src = self.read(value)?;
                self.ops.push(HostOp::Throw { src });
            }
            Instr::Return { value } => {
                let src = self.read(value)?;
                self.ops.push(HostOp::Return { src });
            }
            Instr::Jump { target } => self.jump_to(*target),
            Instr::Branch { cond, if_true, if_false } => {
                let cond = self.read(cond)?;
                let pc = self.ops.len();
                self.ops.push(HostOp::Branch {
                    cond,
                    if_true: u32::MAX,
                    if_false: u32::MAX,
                });
                self.fixups.push(Fixup { pc, label: *if_true });
                self.fixups.push(Fixup { pc, label: *if_false });
            }
        }
        Ok(())
    }

    fn lower_call(&mut self, call: &CallInstr) -> CompileResult<()> {
        let arity = call.args.len();
        if arity > self.config.max_arguments {
            return Err(CompileError::TooManyArguments {
                name: call.name.to_string(),
                arity,
                max: self.config.max_arguments,
            });
        }

        let receiver = self.read(&call.receiver)?;
        let dst = match call.dst {
            Some(t) => Reg(t.0),
            None => self.scratch(),
        };
        let has_closure = call.closure.is_some();
        let plain = call.call_type == CallType::Normal && !has_closure;

        // Predicate site: respond_to?(:literal)
        if call.name.as_ref() == RESPOND_TO && !has_closure && call.call_type != CallType::Super {
            if let [Operand::Literal(Literal::Symbol(queried))] = call.args.as_slice() {
                let site = self
                    .emitter
                    .site(&call.name, SiteKind::RespondTo(queried.clone()), arity, false);
                self.ops.push(HostOp::Probe { dst, site, receiver });
                return Ok(());
            }
        }

        // Operator site with an unboxed entry for literal numbers.
        if plain && arity == 1 {
            if let Some(op) = BinaryOp::from_name(&call.name) {
                let site = self.emitter.site(&call.name, SiteKind::Operator(op), 1, false);
                match &call.args[0] {
                    Operand::Literal(Literal::Fixnum(imm)) => {
                        self.ops.push(HostOp::InvokeFixnum {
                            dst,
                            site,
                            receiver,
                            imm: *imm,
                        });
                    }
                    Operand::Literal(Literal::Float(imm)) => {
                        self.ops.push(HostOp::InvokeFloat {
                            dst,
                            site,
                            receiver,
                            imm: *imm,
                        });
                    }
                    arg => {
                        let arg = self.read(arg)?;
                        self.ops.push(HostOp::Invoke {
                            dst,
                            site,
                            receiver,
                            args: SmallVec::from_slice(&[arg]),
                            block: None,
                        });
                    }
                }
                return Ok(());
            }
        }

        let kind = match call.call_type {
            CallType::Normal => SiteKind::Normal,
            CallType::Functional => SiteKind::Functional,
            CallType::Variable => SiteKind::Variable,
            CallType::Super => SiteKind::Super,
        };
        let mut args: SmallVec<[Reg; 4]> = SmallVec::with_capacity(arity);
        for arg in &call.args {
            args.push(self.read(arg)?);
        }
        let block = match &call.closure {
            Some(closure) => Some(self.read(closure)?),
            None => None,
        };
        let name: Arc<str> = call.name.clone();
        let site = self.emitter.site(&name, kind, arity, has_closure);
        self.ops.push(HostOp::Invoke {
            dst,
            site,
            receiver,
            args,
            block,
        });
        Ok(())
    }
}
