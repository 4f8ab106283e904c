//! Host-op interpreter.
//!
//! Executes the lowered functions of a [`LoadedUnit`]. Each op yields a
//! [`ControlFlow`]; a raising op consults the function's rescue table and
//! either resumes at the handler with the error pending or propagates it.
//!
//! ```text
//!   pc ──► execute(op) ──► Continue    pc + 1
//!                     ├──► Jump(t)     pc = t
//!                     ├──► Return(v)   done
//!                     └──► Err(e)      handler_for(pc) ? pc = h : return Err(e)
//! ```
//!
//! The interpreter performs no frame or binding bookkeeping of its own:
//! everything comes from the explicit call-protocol ops the compiler
//! inserted.

use crate::unit::LoadedUnit;
use garnet_compiler::codegen::{HostFunction, HostOp, Immediate, Reg};
use garnet_ir::{BlockArgsKind, SpecialVar};
use garnet_runtime::{
    native, Binding, BindingRef, ClassId, Frame, FrameKind, MethodEntry, MethodFlags, MethodRegistry, RuntimeError,
    RuntimeResult, ThreadContext, Value, Visibility,
};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::sync::Arc;

// =============================================================================
// Control Flow
// =============================================================================

/// Outcome of one op.
#[derive(Debug)]
enum ControlFlow {
    Continue,
    Jump(u32),
    Return(Value),
}

// =============================================================================
// Activation
// =============================================================================

/// State of one running function.
struct Activation<'a> {
    unit: &'a LoadedUnit,
    function: &'a HostFunction,
    receiver: Value,
    args: Cow<'a, [Value]>,
    captured: Option<BindingRef>,
    regs: Vec<Value>,
    /// Error being delivered to a rescue handler.
    pending: Option<RuntimeError>,
}

impl<'a> Activation<'a> {
    fn new(
        unit: &'a LoadedUnit,
        function: &'a HostFunction,
        receiver: Value,
        args: &'a [Value],
        captured: Option<BindingRef>,
    ) -> Self {
        Self {
            unit,
            function,
            receiver,
            args: Cow::Borrowed(args),
            captured,
            regs: vec![Value::Nil; function.registers as usize],
            pending: None,
        }
    }

    #[inline(always)]
    fn reg(&self, reg: Reg) -> &Value {
        // The lowering sizes the register file to cover every register it names.
        &self.regs[reg.index()]
    }

    #[inline(always)]
    fn set(&mut self, reg: Reg, value: Value) {
        self.regs[reg.index()] = value;
    }

    fn run(&mut self, ctx: &mut ThreadContext) -> RuntimeResult<Value> {
        let function: &'a HostFunction = self.function;
        let ops = &function.ops;
        let mut pc: u32 = 0;
        while let Some(op) = ops.get(pc as usize) {
            match self.execute(ctx, op) {
                Ok(ControlFlow::Continue) => pc += 1,
                Ok(ControlFlow::Jump(target)) => pc = target,
                Ok(ControlFlow::Return(value)) => return Ok(value),
                Err(err) => match function.handler_for(pc) {
                    Some(handler) => {
                        tracing::trace!(
                            function = %function.name,
                            pc,
                            handler,
                            kind = ?err.kind(),
                            "rescuing"
                        );
                        self.pending = Some(err);
                        pc = handler;
                    }
                    None => return Err(err),
                },
            }
        }
        Ok(Value::Nil)
    }

    fn execute(&mut self, ctx: &mut ThreadContext, op: &HostOp) -> RuntimeResult<ControlFlow> {
        match op {
            // -----------------------------------------------------------------
            // Data movement
            // -----------------------------------------------------------------
            HostOp::Move { dst, src } => {
                let value = self.reg(*src).clone();
                self.set(*dst, value);
            }
            HostOp::LoadSelf { dst } => {
                let value = self.receiver.clone();
                self.set(*dst, value);
            }
            HostOp::LoadImmediate { dst, imm } => {
                let value = match imm {
                    Immediate::Nil => Value::Nil,
                    Immediate::True => Value::Bool(true),
                    Immediate::False => Value::Bool(false),
                };
                self.set(*dst, value);
            }
            HostOp::LoadLiteral { dst, slot } => {
                let value = self.unit.literal(*slot)?;
                self.set(*dst, value);
            }
            HostOp::LoadArg { dst, index } => {
                let value = self.args.get(*index as usize).cloned().unwrap_or_default();
                self.set(*dst, value);
            }
            HostOp::LoadLocal { dst, depth, slot } => {
                let binding = ctx.binding_at(*depth as usize)?;
                let value = binding.lock().get(*slot as usize);
                self.set(*dst, value);
            }
            HostOp::StoreLocal { depth, slot, src } => {
                let binding = ctx.binding_at(*depth as usize)?;
                binding.lock().set(*slot as usize, self.reg(*src).clone());
            }
            HostOp::LoadCaptured { dst, depth, slot } => {
                let binding = self.captured_at(*depth)?;
                let value = binding.lock().get(*slot as usize);
                self.set(*dst, value);
            }
            HostOp::StoreCaptured { depth, slot, src } => {
                let binding = self.captured_at(*depth)?;
                binding.lock().set(*slot as usize, self.reg(*src).clone());
            }
            HostOp::LoadSpecial { dst, var } => {
                let value = match var {
                    SpecialVar::Backref => ctx.backref(),
                    SpecialVar::LastLine => ctx.last_line(),
                };
                self.set(*dst, value);
            }
            HostOp::StoreSpecial { var, src } => {
                let value = self.reg(*src).clone();
                match var {
                    SpecialVar::Backref => ctx.set_backref(value),
                    SpecialVar::LastLine => ctx.set_last_line(value),
                }
            }

            // -----------------------------------------------------------------
            // Dispatch
            // -----------------------------------------------------------------
            HostOp::Invoke {
                dst,
                site,
                receiver,
                args,
                block,
            } => {
                let registry = ctx.registry().clone();
                let unit = self.unit;
                let site = unit.site(*site, &registry)?;
                let receiver = self.reg(*receiver).clone();
                let args: SmallVec<[Value; 4]> = args.iter().map(|r| self.reg(*r).clone()).collect();
                let block = block.map(|r| self.reg(r).clone());
                let value = site.invoke_with_block(ctx, &receiver, &args, block.as_ref())?;
                self.set(*dst, value);
            }
            HostOp::InvokeFixnum { dst, site, receiver, imm } => {
                let registry = ctx.registry().clone();
                let unit = self.unit;
                let site = unit.site(*site, &registry)?;
                let receiver = self.reg(*receiver).clone();
                let value = site.invoke_fixnum(ctx, &receiver, *imm)?;
                self.set(*dst, value);
            }
            HostOp::InvokeFloat { dst, site, receiver, imm } => {
                let registry = ctx.registry().clone();
                let unit = self.unit;
                let site = unit.site(*site, &registry)?;
                let receiver = self.reg(*receiver).clone();
                let value = site.invoke_float(ctx, &receiver, *imm)?;
                self.set(*dst, value);
            }
            HostOp::Probe { dst, site, receiver } => {
                let registry = ctx.registry().clone();
                let unit = self.unit;
                let site = unit.site(*site, &registry)?;
                let receiver = self.reg(*receiver).clone();
                let answer = site.probe(ctx, &receiver)?;
                self.set(*dst, Value::Bool(answer));
            }

            // -----------------------------------------------------------------
            // Call protocol
            // -----------------------------------------------------------------
            HostOp::PushMethodFrame { name, private } => {
                let visibility = if *private {
                    Visibility::Private
                } else {
                    Visibility::Public
                };
                ctx.push_frame(Frame::method(name.clone(), visibility));
            }
            HostOp::PushBackrefFrame => ctx.push_frame(Frame::backref_only()),
            HostOp::PopMethodFrame => {
                ctx.pop_frame(FrameKind::Method)?;
            }
            HostOp::PopBackrefFrame => {
                ctx.pop_frame(FrameKind::Backref)?;
            }
            HostOp::SaveVisibility { dst } => {
                let code = ctx.visibility().code();
                self.set(*dst, Value::Fixnum(code));
            }
            HostOp::RestoreVisibility { src } => {
                let visibility = self
                    .reg(*src)
                    .as_fixnum()
                    .and_then(Visibility::from_code)
                    .ok_or_else(|| RuntimeError::internal("restore-visibility without a saved visibility"))?;
                ctx.set_visibility(visibility);
            }
            HostOp::PushBlockFrame { dst } => {
                self.set(*dst, Value::Fixnum(ctx.frame_depth() as i64));
                let visibility = ctx.visibility();
                ctx.push_frame(Frame::block(Some(self.function.name.clone()), visibility));
            }
            HostOp::PopBlockFrame { src } => {
                let depth = self
                    .reg(*src)
                    .as_fixnum()
                    .ok_or_else(|| RuntimeError::internal("pop-block-frame without a saved frame depth"))?;
                ctx.pop_frame(FrameKind::Block)?;
                let depth = depth as usize;
                if ctx.frame_depth() > depth {
                    ctx.truncate_frames(depth)?;
                }
            }
            HostOp::PushMethodBinding { slots } => {
                ctx.push_binding(Binding::new_ref(*slots as usize, None));
            }
            HostOp::PushBlockBinding { slots } => {
                ctx.push_binding(Binding::new_ref(*slots as usize, self.captured.clone()));
            }
            HostOp::PopBinding => {
                ctx.pop_binding()?;
            }
            HostOp::UpdateBlockState { block_self } => {
                let value = self.reg(*block_self).clone();
                if let Some(frame) = ctx.current_frame_mut().filter(|f| f.kind == FrameKind::Block) {
                    frame.block_self = Some(value);
                }
            }
            HostOp::PrepareBlockArgs { kind } => self.prepare_block_args(*kind)?,

            // -----------------------------------------------------------------
            // Control
            // -----------------------------------------------------------------
            HostOp::ReceiveException { dst } => {
                let value = match self.pending.take() {
                    Some(err) => Value::Exception(Arc::new(err)),
                    None => Value::Nil,
                };
                self.set(*dst, value);
            }
            HostOp::Throw { src } => {
                return Err(match self.reg(*src) {
                    Value::Exception(err) => RuntimeError::clone(err),
                    other => RuntimeError::raised(other.clone()),
                });
            }
            HostOp::Return { src } => return Ok(ControlFlow::Return(self.reg(*src).clone())),
            HostOp::Jump { pc } => return Ok(ControlFlow::Jump(*pc)),
            HostOp::Branch { cond, if_true, if_false } => {
                let target = if self.reg(*cond).is_truthy() {
                    *if_true
                } else {
                    *if_false
                };
                return Ok(ControlFlow::Jump(target));
            }
        }
        Ok(ControlFlow::Continue)
    }

    /// Binding `depth` links above the one this closure captured.
    fn captured_at(&self, depth: u32) -> RuntimeResult<BindingRef> {
        let mut binding = self
            .captured
            .clone()
            .ok_or_else(|| RuntimeError::internal("closure has no captured binding"))?;
        for _ in 0..depth {
            let parent = binding
                .lock()
                .parent()
                .cloned()
                .ok_or_else(|| RuntimeError::internal(format!("no captured binding at depth {depth}")))?;
            binding = parent;
        }
        Ok(binding)
    }

    /// Shape incoming block arguments to the closure's parameter list.
    fn prepare_block_args(&mut self, kind: BlockArgsKind) -> RuntimeResult<()> {
        match kind {
            BlockArgsKind::NoArgs => self.args = Cow::Owned(Vec::new()),
            BlockArgsKind::SingleArg => {
                let first = self.args.first().cloned().unwrap_or_default();
                self.args = Cow::Owned(vec![first]);
            }
            BlockArgsKind::General { required, strict } => {
                let required = required as usize;
                let given = self.args.len();
                if strict && given != required && !self.function.signature.rest && self.function.signature.optional == 0 {
                    return Err(RuntimeError::arity(given, required));
                }
                if given < required {
                    let mut padded = self.args.to_vec();
                    padded.resize(required, Value::Nil);
                    self.args = Cow::Owned(padded);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Entry Points
// =============================================================================

fn find_function<'a>(unit: &'a LoadedUnit, name: &str) -> RuntimeResult<&'a HostFunction> {
    unit.function(name)
        .ok_or_else(|| RuntimeError::internal(format!("unit {} has no function {name}", unit.name())))
}

/// Run a method, module body or top-level function of `unit`.
pub fn run_method(
    unit: &LoadedUnit,
    ctx: &mut ThreadContext,
    name: &str,
    receiver: Value,
    args: &[Value],
) -> RuntimeResult<Value> {
    let function = find_function(unit, name)?;
    Activation::new(unit, function, receiver, args, None).run(ctx)
}

/// Run a closure body with the binding it captured at creation.
pub fn run_closure(
    unit: &LoadedUnit,
    ctx: &mut ThreadContext,
    name: &str,
    block_self: Value,
    args: &[Value],
    captured: Option<BindingRef>,
) -> RuntimeResult<Value> {
    let function = find_function(unit, name)?;
    Activation::new(unit, function, block_self, args, captured).run(ctx)
}

/// Install compiled function `name` as a public guest method of `class`.
/// `arity` is checked by the method entry before the body runs.
pub fn define_compiled_method(
    unit: &Arc<LoadedUnit>,
    registry: &MethodRegistry,
    class: ClassId,
    name: &str,
    arity: Option<usize>,
) -> RuntimeResult<()> {
    find_function(unit, name)?;
    let unit = Arc::clone(unit);
    let function_name: Arc<str> = Arc::from(name);
    let body = native(move |ctx, receiver, args, _block| {
        let function = find_function(&unit, &function_name)?;
        ctx.enter_method(class);
        let result = Activation::new(&unit, function, receiver.clone(), args, None).run(ctx);
        ctx.leave_method();
        result
    });
    registry.define_method(
        class,
        MethodEntry::new(name, class, Visibility::Public, MethodFlags::empty(), arity, body),
    )
}
