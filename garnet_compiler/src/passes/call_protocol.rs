//! Explicit call-protocol instrumentation.
//!
//! Rewrites a scope so that frame and binding management is spelled out
//! in its own instruction stream instead of being done implicitly by the
//! caller. Every acquire at the top of the entry block is matched by
//! exactly one release on every way out of the scope.
//!
//! # Closures
//!
//! ```text
//!   entry:     %viz = save_binding_visibility      (needs frame)
//!              %frm = push_block_frame             (needs frame)
//!              push_block_binding                  (needs binding)
//!              update_block_state self
//!   prologue:  prepare_block_args <kind>           (may raise)
//!   body …
//!   return:    pop_binding; restore_binding_visibility %viz; pop_block_frame %frm
//! ```
//!
//! # Methods and other bodies
//!
//! ```text
//!   entry:     push_method_frame name, vis | push_backref_frame
//!              push_method_binding
//!   return:    pop_binding; pop_method_frame | pop_backref_frame
//! ```
//!
//! Exceptions leave through the global ensure block, which releases once
//! and rethrows. Returned values that live in the binding being popped are
//! first copied to a fresh temporary.

use super::{CompilerPass, PassOutcome};
use crate::error::{CompileError, CompileResult};
use garnet_ir::{
    compute_scope_flags, BlockId, EdgeKind, FrameVisibility, Instr, Operand, Scope, ScopeId, ScopeKind, ScopeTree,
    TempId, Variable,
};

/// Inserts explicit frame/binding push and pop instructions.
#[derive(Debug, Default)]
pub struct CallProtocolPass {
    _private: (),
}

/// What the scope acquires, and where closure state was saved.
#[derive(Debug, Clone, Copy)]
struct Protocol {
    closure: bool,
    binding: bool,
    frame: bool,
    only_backref: bool,
    saved_visibility: Option<TempId>,
    saved_frame: Option<TempId>,
}

impl Protocol {
    /// Instructions that undo the acquire sequence.
    fn release(&self) -> Vec<Instr> {
        let mut seq = Vec::with_capacity(3);
        if self.binding {
            seq.push(Instr::PopBinding);
        }
        if self.frame {
            if self.closure {
                if let (Some(viz), Some(frame)) = (self.saved_visibility, self.saved_frame) {
                    seq.push(Instr::RestoreBindingVisibility { src: viz });
                    seq.push(Instr::PopBlockFrame { src: frame });
                }
            } else if self.only_backref {
                seq.push(Instr::PopBackrefFrame);
            } else {
                seq.push(Instr::PopMethodFrame);
            }
        }
        seq
    }
}

impl CallProtocolPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire sequence for the entry block.
    fn acquire(scope: &mut Scope, protocol: &mut Protocol) -> Vec<Instr> {
        let mut seq = Vec::with_capacity(4);
        if protocol.closure {
            if protocol.frame {
                let viz = scope.new_temp();
                let frame = scope.new_temp();
                protocol.saved_visibility = Some(viz);
                protocol.saved_frame = Some(frame);
                seq.push(Instr::SaveBindingVisibility { dst: viz });
                seq.push(Instr::PushBlockFrame { dst: frame });
            }
            if protocol.binding {
                seq.push(Instr::PushBlockBinding);
            }
            seq.push(Instr::UpdateBlockState {
                block_self: Operand::SelfRef,
            });
        } else {
            if protocol.frame {
                if protocol.only_backref {
                    seq.push(Instr::PushBackrefFrame);
                } else {
                    let visibility = if scope.kind() == ScopeKind::TopLevel {
                        FrameVisibility::Private
                    } else {
                        FrameVisibility::Public
                    };
                    seq.push(Instr::PushMethodFrame {
                        name: scope.name_arc().clone(),
                        visibility,
                    });
                }
            }
            if protocol.binding {
                seq.push(Instr::PushMethodBinding);
            }
        }
        seq
    }

    /// Put argument preparation in its own block after the entry block.
    fn insert_prologue(scope: &mut Scope) -> CompileResult<BlockId> {
        let label = scope.new_label();
        let kind = scope.signature().block_args_kind();
        let name = scope.name().to_string();
        let cfg = scope.cfg_mut();
        let entry = cfg.entry();

        let first = cfg
            .outgoing_of_kind(entry, EdgeKind::FallThrough)
            .ok_or(CompileError::MissingFallThrough { scope: name })?;
        cfg.remove_edge(entry, first);

        let prologue = cfg.insert_block_after(entry, label)?;
        cfg.block_mut(prologue)
            .instrs_mut()
            .push(Instr::PrepareBlockArgs { kind });
        cfg.add_edge(entry, prologue, EdgeKind::FallThrough);
        cfg.add_edge(prologue, first, EdgeKind::FallThrough);
        if let Some(geb) = cfg.global_ensure_block() {
            cfg.set_rescuer(prologue, geb);
        }
        Ok(prologue)
    }

    /// Insert the release sequence before the control transfer at `index`
    /// of `block`. An operand the transfer reads is first copied into a
    /// fresh temporary when popping the binding would clobber it.
    fn release_before_transfer(scope: &mut Scope, block: BlockId, index: usize, release: &[Instr]) {
        let read = match &scope.cfg().block(block).instrs()[index] {
            Instr::Return { value } | Instr::Throw { value } => Some(value.clone()),
            Instr::Branch { cond, .. } => Some(cond.clone()),
            Instr::Jump { .. } => None,
            _ => return,
        };
        let mut insert = Vec::with_capacity(release.len() + 1);
        if let Some(value) = read.filter(|v| !v.survives_release()) {
            let temp = scope.new_temp();
            insert.push(Instr::Copy {
                dst: Variable::Temp(temp),
                src: value,
            });
            match &mut scope.cfg_mut().block_mut(block).instrs_mut()[index] {
                Instr::Return { value } | Instr::Throw { value } => *value = Operand::Temp(temp),
                Instr::Branch { cond, .. } => *cond = Operand::Temp(temp),
                _ => {}
            }
        }
        insert.extend_from_slice(release);
        let instrs = scope.cfg_mut().block_mut(block).instrs_mut();
        instrs.splice(index..index, insert);
    }
}

impl CompilerPass for CallProtocolPass {
    fn label(&self) -> &'static str {
        "Add Call Protocol Instructions"
    }

    fn short_label(&self) -> &'static str {
        "add_call_protocol"
    }

    fn already_applied(&self, scope: &Scope) -> bool {
        scope.uses_explicit_call_protocol()
    }

    /// Instrumentation cannot be undone.
    fn invalidate(&self, _scope: &mut Scope) -> bool {
        false
    }

    #[tracing::instrument(name = "call_protocol", skip_all, fields(scope = %tree.get(id).name()))]
    fn run(&mut self, tree: &mut ScopeTree, id: ScopeId) -> CompileResult<PassOutcome> {
        {
            let scope = tree.get(id);
            if !scope.supports_explicit_call_protocol() {
                tracing::trace!("scope kind manages no frame of its own, skipped");
                return Ok(PassOutcome::Skipped);
            }
            if scope.uses_explicit_call_protocol() {
                return Err(CompileError::PassAlreadyApplied {
                    pass: self.label(),
                    scope: scope.name().to_string(),
                });
            }
        }

        compute_scope_flags(tree, id);
        let scope = tree.get_mut(id);
        let mut protocol = Protocol {
            closure: scope.is_closure(),
            binding: scope.needs_binding(),
            frame: scope.needs_frame(),
            only_backref: scope.needs_only_backref(),
            saved_visibility: None,
            saved_frame: None,
        };

        if !(protocol.closure || protocol.binding || protocol.frame) {
            scope.mark_explicit_call_protocol();
            scope.invalidate_liveness();
            return Ok(PassOutcome::Unchanged);
        }

        // Acquire at the top of the entry block.
        let acquire = Self::acquire(scope, &mut protocol);
        let entry = scope.cfg().entry();
        scope.cfg_mut().block_mut(entry).instrs_mut().splice(0..0, acquire);

        if protocol.closure {
            Self::insert_prologue(scope)?;
        }

        let geb = match scope.cfg().global_ensure_block() {
            Some(geb) => geb,
            None => {
                let label = scope.new_label();
                let exception = scope.new_temp();
                scope.cfg_mut().install_global_ensure_block(label, exception)?
            }
        };

        let release = protocol.release();
        if !release.is_empty() {
            let worklist: Vec<BlockId> = scope.cfg().layout().to_vec();
            for block in worklist {
                if block == geb {
                    continue;
                }
                let (is_exit, len) = {
                    let bb = scope.cfg().block(block);
                    (bb.is_exit(), bb.instrs().len())
                };

                if is_exit {
                    if len == 0 {
                        continue;
                    }
                    let last = len - 1;
                    if scope.cfg().block(block).instrs()[last].transfers_control() {
                        Self::release_before_transfer(scope, block, last, &release);
                    } else {
                        scope
                            .cfg_mut()
                            .block_mut(block)
                            .instrs_mut()
                            .extend_from_slice(&release);
                    }
                    continue;
                }

                // Walk backwards so earlier indices stay valid after splicing.
                let returns: Vec<usize> = scope
                    .cfg()
                    .block(block)
                    .instrs()
                    .iter()
                    .enumerate()
                    .filter(|(_, instr)| instr.is_return())
                    .map(|(i, _)| i)
                    .rev()
                    .collect();
                for index in returns {
                    Self::release_before_transfer(scope, block, index, &release);
                }
            }

            let geb_block = scope.cfg().block(geb);
            let Some(terminal) = geb_block.last() else {
                return Err(CompileError::MalformedEnsureBlock {
                    scope: scope.name().to_string(),
                    instr: "<empty>".to_string(),
                });
            };
            if !terminal.transfers_control() {
                let err = CompileError::MalformedEnsureBlock {
                    scope: scope.name().to_string(),
                    instr: terminal.to_string(),
                };
                tracing::warn!(%err, "rejecting scope");
                return Err(err);
            }
            let at = geb_block.instrs().len() - 1;
            scope
                .cfg_mut()
                .block_mut(geb)
                .instrs_mut()
                .splice(at..at, release.iter().cloned());
        }

        scope.mark_explicit_call_protocol();
        scope.invalidate_liveness();
        tracing::debug!(
            binding = protocol.binding,
            frame = protocol.frame,
            only_backref = protocol.only_backref,
            "call protocol inserted"
        );
        Ok(PassOutcome::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_ir::{compute_liveness, Literal, LocalVar, ScopeBuilder, ScopeFlags, Signature};

    fn nil() -> Operand {
        Operand::Literal(Literal::Nil)
    }

    fn instrs_of(scope: &Scope, block: BlockId) -> Vec<Instr> {
        scope.cfg().block(block).instrs().to_vec()
    }

    fn run(tree: &mut ScopeTree, id: ScopeId) -> CompileResult<PassOutcome> {
        CallProtocolPass::new().run(tree, id)
    }

    #[test]
    fn test_method_with_binding_and_frame() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_BINDING | ScopeFlags::NEEDS_FRAME);
        let t = b.call(Operand::SelfRef, "foo", []);
        b.ret(Operand::Temp(t));
        let id = b.finish(&mut tree, None).unwrap();

        assert_eq!(run(&mut tree, id).unwrap(), PassOutcome::Changed);
        let scope = tree.get(id);
        let entry = instrs_of(scope, scope.cfg().entry());
        assert!(matches!(
            entry.as_slice(),
            [Instr::PushMethodFrame { visibility: FrameVisibility::Public, .. }, Instr::PushMethodBinding]
        ));

        let body = instrs_of(scope, scope.cfg().layout()[1]);
        let n = body.len();
        assert_eq!(body[n - 3], Instr::PopBinding);
        assert_eq!(body[n - 2], Instr::PopMethodFrame);
        assert_eq!(body[n - 1], Instr::Return { value: Operand::Temp(t) });

        let geb = scope.cfg().global_ensure_block().unwrap();
        let geb_instrs = instrs_of(scope, geb);
        assert!(matches!(
            geb_instrs.as_slice(),
            [Instr::ReceiveException { .. }, Instr::PopBinding, Instr::PopMethodFrame, Instr::Throw { .. }]
        ));
        assert!(scope.uses_explicit_call_protocol());
    }

    #[test]
    fn test_backref_only_frame_for_method() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        let t = b.temp();
        b.emit(Instr::LoadSpecial { dst: t, var: garnet_ir::SpecialVar::Backref });
        b.ret(Operand::Temp(t));
        let id = b.finish(&mut tree, None).unwrap();

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        assert_eq!(instrs_of(scope, scope.cfg().entry()), vec![Instr::PushBackrefFrame]);
        let body = instrs_of(scope, scope.cfg().layout()[1]);
        assert_eq!(body[body.len() - 2], Instr::PopBackrefFrame);
    }

    #[test]
    fn test_top_level_frame_is_private() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::top_level("main");
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        assert!(matches!(
            instrs_of(scope, scope.cfg().entry()).as_slice(),
            [Instr::PushMethodFrame { visibility: FrameVisibility::Private, .. }]
        ));
    }

    #[test]
    fn test_plain_method_is_only_marked() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.ret(Operand::fixnum(1));
        let id = b.finish(&mut tree, None).unwrap();
        let blocks_before = tree.get(id).cfg().block_count();

        assert_eq!(run(&mut tree, id).unwrap(), PassOutcome::Unchanged);
        let scope = tree.get(id);
        assert!(scope.uses_explicit_call_protocol());
        assert_eq!(scope.cfg().block_count(), blocks_before);
        assert!(scope.cfg().global_ensure_block().is_none());
    }

    #[test]
    fn test_closure_acquire_and_prologue() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::closure("blk", Signature::required(1));
        b.declare_flags(ScopeFlags::NEEDS_BINDING | ScopeFlags::NEEDS_FRAME);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        let cfg = scope.cfg();
        let entry = instrs_of(scope, cfg.entry());
        assert!(matches!(
            entry.as_slice(),
            [
                Instr::SaveBindingVisibility { .. },
                Instr::PushBlockFrame { .. },
                Instr::PushBlockBinding,
                Instr::UpdateBlockState { block_self: Operand::SelfRef },
            ]
        ));

        let prologue = cfg.outgoing_of_kind(cfg.entry(), EdgeKind::FallThrough).unwrap();
        assert_eq!(cfg.layout()[1], prologue);
        assert_eq!(
            instrs_of(scope, prologue),
            vec![Instr::PrepareBlockArgs { kind: garnet_ir::BlockArgsKind::SingleArg }]
        );
        let geb = cfg.global_ensure_block().unwrap();
        assert_eq!(cfg.block(prologue).rescuer(), Some(geb));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_closure_without_state_still_gets_prologue() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::closure("blk", Signature::NO_ARGS);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();

        assert_eq!(run(&mut tree, id).unwrap(), PassOutcome::Changed);
        let scope = tree.get(id);
        assert_eq!(
            instrs_of(scope, scope.cfg().entry()),
            vec![Instr::UpdateBlockState { block_self: Operand::SelfRef }]
        );
        let geb = scope.cfg().global_ensure_block().unwrap();
        assert_eq!(instrs_of(scope, geb).len(), 2);
    }

    #[test]
    fn test_closure_prologue_wired_to_existing_ensure_block() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::closure("blk", Signature::NO_ARGS);
        b.with_global_ensure_block();
        b.declare_flags(ScopeFlags::NEEDS_BINDING);
        let t = b.call(Operand::SelfRef, "foo", []);
        b.ret(Operand::Temp(t));
        let id = b.finish(&mut tree, None).unwrap();
        let geb_before = tree.get(id).cfg().global_ensure_block();

        run(&mut tree, id).unwrap();
        let cfg = tree.get(id).cfg();
        assert_eq!(cfg.global_ensure_block(), geb_before);
        let prologue = cfg.layout()[1];
        assert_eq!(cfg.outgoing_of_kind(prologue, EdgeKind::Exception), geb_before);
    }

    #[test]
    fn test_return_of_local_uses_fresh_temp() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_BINDING);
        let x = b.local("x");
        b.copy(LocalVar::new("x", 0), Operand::fixnum(3));
        b.ret(x.clone());
        let id = b.finish(&mut tree, None).unwrap();
        let temps_before = tree.get(id).temp_count();

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        let body = instrs_of(scope, scope.cfg().layout()[1]);
        let n = body.len();
        let Instr::Return { value: Operand::Temp(fresh) } = body[n - 1].clone() else {
            panic!("return should use a temporary: {:?}", body[n - 1]);
        };
        assert!(fresh.0 >= temps_before);
        assert_eq!(body[n - 3], Instr::Copy { dst: Variable::Temp(fresh), src: x });
        assert_eq!(body[n - 2], Instr::PopBinding);
    }

    #[test]
    fn test_return_of_immutable_literal_is_untouched() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_BINDING);
        b.ret(Operand::symbol("ok"));
        let id = b.finish(&mut tree, None).unwrap();

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        let body = instrs_of(scope, scope.cfg().layout()[1]);
        assert_eq!(body, vec![Instr::PopBinding, Instr::Return { value: Operand::symbol("ok") }]);
    }

    #[test]
    fn test_rerun_is_rejected() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_FRAME);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();

        run(&mut tree, id).unwrap();
        let snapshot = tree.get(id).cfg().dump();
        let err = run(&mut tree, id).unwrap_err();
        assert_eq!(
            err,
            CompileError::PassAlreadyApplied { pass: "Add Call Protocol Instructions", scope: "m".into() }
        );
        assert_eq!(tree.get(id).cfg().dump(), snapshot);
    }

    #[test]
    fn test_eval_scope_is_skipped() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::eval("(eval)");
        b.declare_flags(ScopeFlags::NEEDS_BINDING);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();

        assert_eq!(run(&mut tree, id).unwrap(), PassOutcome::Skipped);
        assert!(!tree.get(id).uses_explicit_call_protocol());
        assert_eq!(run(&mut tree, id).unwrap(), PassOutcome::Skipped);
    }

    #[test]
    fn test_malformed_ensure_block_is_rejected() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_FRAME);
        b.with_global_ensure_block();
        let t = b.call(Operand::SelfRef, "foo", []);
        b.ret(Operand::Temp(t));
        let id = b.finish(&mut tree, None).unwrap();

        let geb = tree.get(id).cfg().global_ensure_block().unwrap();
        let instrs = tree.get_mut(id).cfg_mut().block_mut(geb).instrs_mut();
        instrs.pop();
        let err = run(&mut tree, id).unwrap_err();
        assert!(matches!(err, CompileError::MalformedEnsureBlock { .. }));
    }

    #[test]
    fn test_liveness_is_invalidated() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_FRAME);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();
        let info = compute_liveness(tree.get(id).cfg());
        tree.get_mut(id).set_liveness(info);

        run(&mut tree, id).unwrap();
        assert!(tree.get(id).liveness().is_none());
    }

    #[test]
    fn test_non_empty_exit_block_gets_release() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_FRAME);
        let tail = b.label();
        b.jump(tail);
        b.block(tail).unwrap();
        b.ret(Operand::fixnum(1));
        let id = b.finish(&mut tree, None).unwrap();
        {
            let cfg = tree.get_mut(id).cfg_mut();
            let tail_id = cfg.block_by_label(tail).unwrap();
            cfg.mark_exit(tail_id);
        }

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        let tail_id = scope.cfg().block_by_label(tail).unwrap();
        assert_eq!(
            instrs_of(scope, tail_id),
            vec![Instr::PopMethodFrame, Instr::Return { value: Operand::fixnum(1) }]
        );
    }

    #[test]
    fn test_throwing_exit_block_releases_before_throw() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.declare_flags(ScopeFlags::NEEDS_FRAME);
        let symbol_tail = b.label();
        let self_tail = b.label();
        b.emit(Instr::Branch {
            cond: Operand::SelfRef,
            if_true: symbol_tail,
            if_false: self_tail,
        });
        b.block(symbol_tail).unwrap();
        b.throw(Operand::symbol("boom"));
        b.block(self_tail).unwrap();
        b.throw(Operand::SelfRef);
        let id = b.finish(&mut tree, None).unwrap();
        {
            let cfg = tree.get_mut(id).cfg_mut();
            for label in [symbol_tail, self_tail] {
                let block = cfg.block_by_label(label).unwrap();
                cfg.mark_exit(block);
            }
        }

        run(&mut tree, id).unwrap();
        let scope = tree.get(id);
        scope.cfg().validate().unwrap();

        let symbol_id = scope.cfg().block_by_label(symbol_tail).unwrap();
        assert_eq!(
            instrs_of(scope, symbol_id),
            vec![Instr::PopMethodFrame, Instr::Throw { value: Operand::symbol("boom") }]
        );

        let self_id = scope.cfg().block_by_label(self_tail).unwrap();
        match instrs_of(scope, self_id).as_slice() {
            [Instr::Copy { dst: Variable::Temp(copied), src: Operand::SelfRef }, Instr::PopMethodFrame, Instr::Throw { value: Operand::Temp(thrown) }] => {
                assert_eq!(copied, thrown)
            }
            other => panic!("unexpected exit block: {other:?}"),
        }
    }
}
