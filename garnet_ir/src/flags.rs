//! Scope flag analysis.
//!
//! Derives, per scope, whether it needs a binding, a frame, or only the
//! backref/last-line slots of a frame. The analysis is bottom-up: closures
//! are scanned first because their uses of enclosing locals and of `$~`
//! decide what their ancestors need.
//!
//! ```text
//!   NEEDS_BINDING      ◄── BINDING_HAS_ESCAPED | USES_EVAL | declared
//!   NEEDS_FRAME        ◄── REQUIRES_FRAME | USES_EVAL | USES_BACKREF_OR_LASTLINE
//!                          | module/top-level body | declared
//!   NEEDS_ONLY_BACKREF ◄── NEEDS_FRAME solely because of USES_BACKREF_OR_LASTLINE
//! ```

use crate::instr::Instr;
use crate::operand::Variable;
use crate::scope::{ScopeFlags, ScopeId, ScopeKind, ScopeTree};

/// Methods that capture or evaluate against the caller's binding.
pub const BINDING_METHODS: &[&str] = &[
    "binding",
    "eval",
    "local_variables",
    "instance_eval",
    "class_eval",
    "module_eval",
];

/// Methods that read or write the caller's frame.
pub const FRAME_AWARE_METHODS: &[&str] = &[
    "block_given?",
    "iterator?",
    "__method__",
    "__callee__",
    "private",
    "public",
    "protected",
    "module_function",
    "proc",
    "lambda",
    "caller",
];

/// Methods that set `$~` or `$_` in the caller's frame.
pub const BACKREF_METHODS: &[&str] = &[
    "=~", "match", "sub", "sub!", "gsub", "gsub!", "scan", "index", "rindex", "split", "slice",
    "slice!", "gets",
];

/// Bits recomputed on every run.
const ANALYZED: ScopeFlags = ScopeFlags::USES_BACKREF_OR_LASTLINE
    .union(ScopeFlags::REQUIRES_FRAME)
    .union(ScopeFlags::USES_EVAL)
    .union(ScopeFlags::BINDING_HAS_ESCAPED)
    .union(ScopeFlags::HAS_LOCAL_VARS)
    .union(ScopeFlags::ACCESSES_PARENT_LOCALS)
    .union(ScopeFlags::NEEDS_BINDING)
    .union(ScopeFlags::NEEDS_FRAME)
    .union(ScopeFlags::NEEDS_ONLY_BACKREF)
    .union(ScopeFlags::FLAGS_COMPUTED);

/// Compute flags for `root` and every scope nested in it.
#[tracing::instrument(level = "trace", skip(tree), fields(scope = %tree.get(root).name()))]
pub fn compute_scope_flags(tree: &mut ScopeTree, root: ScopeId) {
    let order = tree.post_order(root);

    // Reset to declared flags and scan each body.
    for &id in &order {
        let scope = tree.get(id);
        let mut flags = scope.declared_flags() | (scope.flags() & !ANALYZED);
        if !scope.locals().is_empty() {
            flags |= ScopeFlags::HAS_LOCAL_VARS;
        }
        flags |= scan_body(tree, id);
        tree.get_mut(id).set_flags(flags);
    }

    // Closures push requirements onto their ancestors.
    for &id in &order {
        if !tree.get(id).is_closure() {
            continue;
        }
        let max_depth = max_outer_depth(tree, id);
        for depth in 1..=max_depth {
            if let Some(ancestor) = tree.ancestor(id, depth) {
                let flags = tree.get(ancestor).flags() | ScopeFlags::BINDING_HAS_ESCAPED;
                tree.get_mut(ancestor).set_flags(flags);
            }
        }
        if tree.get(id).flags().contains(ScopeFlags::USES_BACKREF_OR_LASTLINE) {
            if let Some(method) = tree.method_ancestor(id) {
                let flags = tree.get(method).flags() | ScopeFlags::USES_BACKREF_OR_LASTLINE;
                tree.get_mut(method).set_flags(flags);
            }
        }
    }

    for &id in &order {
        let scope = tree.get(id);
        let flags = derive(scope.kind(), scope.declared_flags(), scope.flags());
        tracing::trace!(scope = scope.name(), ?flags, "scope flags computed");
        tree.get_mut(id).set_flags(flags | ScopeFlags::FLAGS_COMPUTED);
    }
}

/// Input flags contributed by the instructions of one scope.
fn scan_body(tree: &ScopeTree, id: ScopeId) -> ScopeFlags {
    let cfg = tree.get(id).cfg();
    let mut flags = ScopeFlags::empty();
    for &block in cfg.layout() {
        for instr in cfg.block(block).instrs() {
            match instr {
                Instr::LoadSpecial { .. } | Instr::StoreSpecial { .. } => {
                    flags |= ScopeFlags::USES_BACKREF_OR_LASTLINE;
                }
                Instr::Call(call) => {
                    let name = &*call.name;
                    if BINDING_METHODS.contains(&name) {
                        flags |= ScopeFlags::USES_EVAL;
                    }
                    if FRAME_AWARE_METHODS.contains(&name) {
                        flags |= ScopeFlags::REQUIRES_FRAME;
                    }
                    if BACKREF_METHODS.contains(&name) {
                        flags |= ScopeFlags::USES_BACKREF_OR_LASTLINE;
                    }
                }
                _ => {}
            }
            let defined = instr.defined();
            for var in instr.used_variables().into_iter().chain(defined) {
                if let Variable::Local(local) = var {
                    flags |= if local.depth == 0 {
                        ScopeFlags::HAS_LOCAL_VARS
                    } else {
                        ScopeFlags::ACCESSES_PARENT_LOCALS
                    };
                }
            }
        }
    }
    flags
}

/// Deepest enclosing-scope local referenced by `id`.
fn max_outer_depth(tree: &ScopeTree, id: ScopeId) -> u32 {
    let cfg = tree.get(id).cfg();
    let mut max = 0;
    for &block in cfg.layout() {
        for instr in cfg.block(block).instrs() {
            let defined = instr.defined();
            for var in instr.used_variables().into_iter().chain(defined) {
                if let Variable::Local(local) = var {
                    max = max.max(local.depth);
                }
            }
        }
    }
    max
}

fn derive(kind: ScopeKind, declared: ScopeFlags, flags: ScopeFlags) -> ScopeFlags {
    let mut out = flags & !(ScopeFlags::NEEDS_BINDING | ScopeFlags::NEEDS_FRAME | ScopeFlags::NEEDS_ONLY_BACKREF);

    let needs_binding = declared.contains(ScopeFlags::NEEDS_BINDING)
        || flags.intersects(ScopeFlags::BINDING_HAS_ESCAPED | ScopeFlags::USES_EVAL);

    let full_frame = declared.contains(ScopeFlags::NEEDS_FRAME)
        || flags.intersects(ScopeFlags::REQUIRES_FRAME | ScopeFlags::USES_EVAL)
        || matches!(kind, ScopeKind::ModuleBody | ScopeKind::TopLevel);
    let backref = declared.contains(ScopeFlags::NEEDS_ONLY_BACKREF)
        || (flags.contains(ScopeFlags::USES_BACKREF_OR_LASTLINE) && !kind.is_closure());

    if needs_binding {
        out |= ScopeFlags::NEEDS_BINDING;
    }
    if full_frame || backref {
        out |= ScopeFlags::NEEDS_FRAME;
    }
    if backref && !full_frame && !kind.is_closure() {
        out |= ScopeFlags::NEEDS_ONLY_BACKREF;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScopeBuilder;
    use crate::instr::CallInstr;
    use crate::operand::{Literal, Operand, SpecialVar};
    use crate::scope::Signature;

    fn nil() -> Operand {
        Operand::Literal(Literal::Nil)
    }

    #[test]
    fn test_plain_method_needs_nothing() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        let x = b.local("x");
        b.ret(x);
        let id = b.finish(&mut tree, None).unwrap();
        compute_scope_flags(&mut tree, id);

        let scope = tree.get(id);
        assert!(scope.flags_computed());
        assert!(!scope.needs_binding());
        assert!(!scope.needs_frame());
        assert!(scope.flags().contains(ScopeFlags::HAS_LOCAL_VARS));
    }

    #[test]
    fn test_backref_only_frame() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        let t = b.temp();
        b.emit(Instr::LoadSpecial { dst: t, var: SpecialVar::Backref });
        b.ret(Operand::Temp(t));
        let id = b.finish(&mut tree, None).unwrap();
        compute_scope_flags(&mut tree, id);

        let scope = tree.get(id);
        assert!(scope.needs_frame());
        assert!(scope.needs_only_backref());
    }

    #[test]
    fn test_frame_aware_call_needs_full_frame() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.call(Operand::SelfRef, "block_given?", []);
        b.call(Operand::Literal(Literal::string("s")), "=~", [nil()]);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();
        compute_scope_flags(&mut tree, id);

        let scope = tree.get(id);
        assert!(scope.needs_frame());
        assert!(!scope.needs_only_backref());
    }

    #[test]
    fn test_eval_needs_binding_and_frame() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.call_instr(CallInstr::new(None, Operand::SelfRef, "binding", []));
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();
        compute_scope_flags(&mut tree, id);
        assert!(tree.get(id).needs_binding());
        assert!(tree.get(id).needs_frame());
    }

    #[test]
    fn test_captured_locals_escape_binding() {
        let mut tree = ScopeTree::new();
        let mut m = ScopeBuilder::method("m");
        m.copy(crate::operand::LocalVar::new("x", 0), Operand::fixnum(1));
        m.ret(nil());
        let m_id = m.finish(&mut tree, None).unwrap();

        let mut outer = ScopeBuilder::closure("outer", Signature::NO_ARGS);
        outer.ret(nil());
        let outer_id = outer.finish(&mut tree, Some(m_id)).unwrap();

        let mut inner = ScopeBuilder::closure("inner", Signature::NO_ARGS);
        inner.ret(Operand::local("x", 2));
        let inner_id = inner.finish(&mut tree, Some(outer_id)).unwrap();

        compute_scope_flags(&mut tree, m_id);
        assert!(tree.get(m_id).needs_binding());
        assert!(tree.get(outer_id).needs_binding());
        assert!(!tree.get(inner_id).needs_binding());
        assert!(tree.get(inner_id).flags().contains(ScopeFlags::ACCESSES_PARENT_LOCALS));
    }

    #[test]
    fn test_closure_backref_marks_method() {
        let mut tree = ScopeTree::new();
        let mut m = ScopeBuilder::method("m");
        m.ret(nil());
        let m_id = m.finish(&mut tree, None).unwrap();

        let mut c = ScopeBuilder::closure("c", Signature::NO_ARGS);
        let t = c.temp();
        c.emit(Instr::LoadSpecial { dst: t, var: SpecialVar::LastLine });
        c.ret(Operand::Temp(t));
        let c_id = c.finish(&mut tree, Some(m_id)).unwrap();

        compute_scope_flags(&mut tree, m_id);
        assert!(tree.get(m_id).needs_only_backref());
        assert!(!tree.get(c_id).needs_frame());
    }

    #[test]
    fn test_declared_flags_survive_recompute() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::closure("c", Signature::NO_ARGS);
        b.declare_flags(ScopeFlags::NEEDS_BINDING);
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();
        compute_scope_flags(&mut tree, id);
        compute_scope_flags(&mut tree, id);
        assert!(tree.get(id).needs_binding());
        assert!(!tree.get(id).needs_frame());
    }

    #[test]
    fn test_top_level_always_has_frame() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::top_level("main");
        b.ret(nil());
        let id = b.finish(&mut tree, None).unwrap();
        compute_scope_flags(&mut tree, id);
        assert!(tree.get(id).needs_frame());
        assert!(!tree.get(id).needs_only_backref());
    }
}
