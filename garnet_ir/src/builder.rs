//! Scope construction.
//!
//! Stands in for the front end: code is emitted block by block, and the
//! builder derives edges from block terminators when the scope is finished.
//! A block that would fall into the exit block gets an implicit
//! `return nil`, so scopes are only ever left through a return or a throw.
//!
//! # Example
//!
//! ```
//! use garnet_ir::{ScopeBuilder, ScopeTree, Operand};
//!
//! let mut tree = ScopeTree::new();
//! let mut b = ScopeBuilder::method("answer");
//! let t = b.call(Operand::fixnum(40), "+", [Operand::fixnum(2)]);
//! b.ret(Operand::Temp(t));
//! let id = b.finish(&mut tree, None).unwrap();
//! assert_eq!(tree.get(id).name(), "answer");
//! ```

use crate::cfg::{BlockId, EdgeKind};
use crate::error::{IrError, IrResult};
use crate::instr::{CallInstr, Instr, Label};
use crate::operand::{Literal, LocalVar, Operand, TempId, Variable};
use crate::scope::{Scope, ScopeFlags, ScopeId, ScopeKind, ScopeTree, Signature};

/// Incremental builder for one scope.
pub struct ScopeBuilder {
    scope: Scope,
    current: BlockId,
    rescue_stack: Vec<Label>,
    rescuers: Vec<(BlockId, Label)>,
    global_ensure: bool,
}

impl ScopeBuilder {
    /// Start a scope. Code emitted before the first [`block`](Self::block)
    /// call lands in a body block that the entry block falls through to.
    pub fn new(kind: ScopeKind, name: &str) -> Self {
        let mut scope = Scope::new(kind, name);
        let body_label = scope.new_label();
        // Fresh graph: the only possible failure is a duplicate label.
        let current = scope
            .cfg_mut()
            .add_block(body_label)
            .unwrap_or_else(|_| scope.cfg().entry());
        Self {
            scope,
            current,
            rescue_stack: Vec::new(),
            rescuers: Vec::new(),
            global_ensure: false,
        }
    }

    pub fn method(name: &str) -> Self {
        Self::new(ScopeKind::Method, name)
    }

    pub fn closure(name: &str, signature: Signature) -> Self {
        let mut builder = Self::new(ScopeKind::Closure, name);
        builder.scope.set_signature(signature);
        builder
    }

    pub fn top_level(name: &str) -> Self {
        Self::new(ScopeKind::TopLevel, name)
    }

    pub fn module_body(name: &str) -> Self {
        Self::new(ScopeKind::ModuleBody, name)
    }

    pub fn eval(name: &str) -> Self {
        Self::new(ScopeKind::Eval, name)
    }

    /// Declare flags the producer knows statically.
    pub fn declare_flags(&mut self, flags: ScopeFlags) -> &mut Self {
        self.scope.declare_flags(flags);
        self
    }

    /// Install a global ensure block when the scope is finished.
    pub fn with_global_ensure_block(&mut self) -> &mut Self {
        self.global_ensure = true;
        self
    }

    pub fn temp(&mut self) -> TempId {
        self.scope.new_temp()
    }

    pub fn label(&mut self) -> Label {
        self.scope.new_label()
    }

    /// A local of this scope.
    pub fn local(&mut self, name: &str) -> Operand {
        self.scope.declare_local(name);
        Operand::local(name, 0)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.scope.cfg_mut().block_mut(self.current).instrs_mut().push(instr);
        self
    }

    /// Start a new block labelled `label`. Blocks started inside a rescue
    /// region get that region's handler as rescuer.
    pub fn block(&mut self, label: Label) -> IrResult<&mut Self> {
        let id = self.scope.cfg_mut().add_block(label)?;
        if let Some(&handler) = self.rescue_stack.last() {
            self.rescuers.push((id, handler));
        }
        self.current = id;
        Ok(self)
    }

    /// Open a protected region handled by `handler` and start its first
    /// block. Returns that block's label.
    pub fn begin_rescue(&mut self, handler: Label) -> IrResult<Label> {
        self.rescue_stack.push(handler);
        let label = self.label();
        self.block(label)?;
        Ok(label)
    }

    /// Close the innermost protected region. Blocks started afterwards are
    /// unprotected.
    pub fn end_rescue(&mut self) -> &mut Self {
        self.rescue_stack.pop();
        self
    }

    /// `recv.name(args)` into a fresh temporary.
    pub fn call(&mut self, receiver: Operand, name: &str, args: impl IntoIterator<Item = Operand>) -> TempId {
        let dst = self.temp();
        self.emit(Instr::Call(CallInstr::new(Some(dst), receiver, name, args)));
        dst
    }

    pub fn call_instr(&mut self, call: CallInstr) -> &mut Self {
        self.emit(Instr::Call(call))
    }

    pub fn copy(&mut self, dst: impl Into<Variable>, src: Operand) -> &mut Self {
        self.emit(Instr::Copy { dst: dst.into(), src })
    }

    pub fn ret(&mut self, value: Operand) -> &mut Self {
        self.emit(Instr::Return { value })
    }

    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.emit(Instr::Jump { target })
    }

    pub fn throw(&mut self, value: Operand) -> &mut Self {
        self.emit(Instr::Throw { value })
    }

    // =========================================================================
    // Finish
    // =========================================================================

    /// Derive edges, resolve rescuers and enclosing locals, and add the
    /// scope to `tree`.
    pub fn finish(mut self, tree: &mut ScopeTree, parent: Option<ScopeId>) -> IrResult<ScopeId> {
        self.connect()?;
        let rescuers = std::mem::take(&mut self.rescuers);
        for (block, handler) in rescuers {
            let handler = self.scope.cfg().block_by_label(handler)?;
            if self.scope.cfg().block(block).can_raise() {
                self.scope.cfg_mut().set_rescuer(block, handler);
            }
        }
        if self.global_ensure {
            let label = self.scope.new_label();
            let exception = self.scope.new_temp();
            self.scope.cfg_mut().install_global_ensure_block(label, exception)?;
        }

        let outer = collect_outer_locals(&mut self.scope);
        let id = tree.insert(self.scope, parent);
        for local in outer {
            let owner = parent
                .and_then(|p| tree.ancestor(p, local.depth - 1))
                .ok_or_else(|| IrError::UnresolvedLocal {
                    name: local.name.to_string(),
                    depth: local.depth,
                })?;
            tree.get_mut(owner).declare_local(&local.name);
        }
        tree.get(id).cfg().validate()?;
        Ok(id)
    }

    /// Add fall-through, jump and exit edges from block terminators.
    fn connect(&mut self) -> IrResult<()> {
        let cfg = self.scope.cfg_mut();
        let layout = cfg.layout().to_vec();
        let exit = cfg.exit();
        for (i, &id) in layout.iter().enumerate() {
            if id == exit {
                continue;
            }
            let last = cfg.block(id).last().cloned();
            match last {
                Some(Instr::Return { .. }) => cfg.add_edge(id, exit, EdgeKind::Exit),
                Some(Instr::Throw { .. }) => {}
                Some(ref instr @ (Instr::Jump { .. } | Instr::Branch { .. })) => {
                    for target in instr.targets() {
                        let to = cfg.block_by_label(target)?;
                        cfg.add_edge(id, to, EdgeKind::Jump);
                    }
                }
                _ => match layout.get(i + 1) {
                    // Falling off the end of the body returns nil.
                    Some(&next) if next == exit && id != cfg.entry() => {
                        cfg.block_mut(id).instrs_mut().push(Instr::Return {
                            value: Operand::Literal(Literal::Nil),
                        });
                        cfg.add_edge(id, exit, EdgeKind::Exit);
                    }
                    Some(&next) => cfg.add_edge(id, next, EdgeKind::FallThrough),
                    None => {}
                },
            }
        }
        Ok(())
    }
}

/// Declare depth-0 locals on `scope` and return references to enclosing
/// scopes' locals.
fn collect_outer_locals(scope: &mut Scope) -> Vec<LocalVar> {
    let mut outer: Vec<LocalVar> = Vec::new();
    let mut own: Vec<LocalVar> = Vec::new();
    for &id in scope.cfg().layout() {
        for instr in scope.cfg().block(id).instrs() {
            let defined = instr.defined();
            let vars = instr.used_variables().into_iter().chain(defined);
            for var in vars {
                if let Variable::Local(local) = var {
                    let bucket = if local.depth == 0 { &mut own } else { &mut outer };
                    if !bucket.contains(&local) {
                        bucket.push(local);
                    }
                }
            }
        }
    }
    for local in own {
        scope.declare_local(&local.name);
    }
    outer
}
