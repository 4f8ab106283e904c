//! Compilation scopes.
//!
//! A scope is one compilable body: a method, closure, module body,
//! top-level script or eval string. Scopes form a tree through their
//! lexical parent links; closures reach enclosing locals by depth.

use crate::arena::{Arena, Id};
use crate::cfg::Cfg;
use crate::instr::{BlockArgsKind, Label};
use crate::liveness::LivenessInfo;
use crate::operand::TempId;
use std::sync::Arc;

/// Scope identifier.
pub type ScopeId = Id<Scope>;

// =============================================================================
// Kinds and Signatures
// =============================================================================

/// What kind of body a scope compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Method,
    Closure,
    ModuleBody,
    TopLevel,
    /// Code evaluated from a string. Runs on its caller's frame and
    /// binding, so it never manages its own.
    Eval,
}

impl ScopeKind {
    #[inline]
    pub fn is_closure(self) -> bool {
        self == ScopeKind::Closure
    }
}

/// Parameter shape of a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    pub required: u32,
    pub optional: u32,
    pub rest: bool,
    /// Lambdas reject a wrong argument count instead of padding/dropping.
    pub lambda: bool,
}

impl Signature {
    pub const NO_ARGS: Signature = Signature {
        required: 0,
        optional: 0,
        rest: false,
        lambda: false,
    };

    pub const fn required(n: u32) -> Self {
        Signature {
            required: n,
            optional: 0,
            rest: false,
            lambda: false,
        }
    }

    /// Argument preparation this signature needs.
    pub fn block_args_kind(&self) -> BlockArgsKind {
        match (self.required, self.optional, self.rest, self.lambda) {
            (0, 0, false, false) => BlockArgsKind::NoArgs,
            (1, 0, false, false) => BlockArgsKind::SingleArg,
            _ => BlockArgsKind::General {
                required: self.required,
                strict: self.lambda,
            },
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    /// Static facts about a scope.
    ///
    /// The low bits are analysis inputs, the `NEEDS_*` bits are derived by
    /// the flag analyzer (or declared by the producer).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScopeFlags: u32 {
        /// Reads or writes `$~` / `$_`, or calls a method that does.
        const USES_BACKREF_OR_LASTLINE = 1 << 0;
        /// Calls a method that inspects the caller's frame.
        const REQUIRES_FRAME = 1 << 1;
        /// Calls `eval`/`binding`-like methods that capture the binding.
        const USES_EVAL = 1 << 2;
        /// A nested closure accesses this scope's locals.
        const BINDING_HAS_ESCAPED = 1 << 3;
        /// Has locals of its own.
        const HAS_LOCAL_VARS = 1 << 4;
        /// Accesses locals of an enclosing scope.
        const ACCESSES_PARENT_LOCALS = 1 << 5;

        const NEEDS_BINDING = 1 << 16;
        const NEEDS_FRAME = 1 << 17;
        const NEEDS_ONLY_BACKREF = 1 << 18;

        /// Set once the analyzer has run.
        const FLAGS_COMPUTED = 1 << 31;
    }
}

// =============================================================================
// Compilation Record
// =============================================================================

/// Per-scope compilation state written by passes.
#[derive(Debug, Clone, Default)]
pub struct CompilationRecord {
    explicit_call_protocol: bool,
    liveness: Option<Arc<LivenessInfo>>,
}

impl CompilationRecord {
    #[inline]
    pub fn explicit_call_protocol(&self) -> bool {
        self.explicit_call_protocol
    }
}

// =============================================================================
// Scope
// =============================================================================

/// A compilable body with its control-flow graph.
#[derive(Debug, Clone)]
pub struct Scope {
    name: Arc<str>,
    kind: ScopeKind,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    signature: Signature,
    cfg: Cfg,
    declared: ScopeFlags,
    flags: ScopeFlags,
    locals: Vec<Arc<str>>,
    next_temp: u32,
    next_label: u32,
    record: CompilationRecord,
}

impl Scope {
    /// Create a scope whose graph uses labels 0 (entry) and 1 (exit).
    pub fn new(kind: ScopeKind, name: &str) -> Self {
        Self {
            name: Arc::from(name),
            kind,
            parent: None,
            children: Vec::new(),
            signature: Signature::NO_ARGS,
            cfg: Cfg::new(Label(0), Label(1)),
            declared: ScopeFlags::empty(),
            flags: ScopeFlags::empty(),
            locals: Vec::new(),
            next_temp: 0,
            next_label: 2,
            record: CompilationRecord::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    #[inline]
    pub fn is_closure(&self) -> bool {
        self.kind.is_closure()
    }

    #[inline]
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[ScopeId] {
        &self.children
    }

    #[inline]
    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }

    #[inline]
    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    #[inline]
    pub fn cfg_mut(&mut self) -> &mut Cfg {
        &mut self.cfg
    }

    // -------------------------------------------------------------------------
    // Flags
    // -------------------------------------------------------------------------

    /// Effective flags (declared plus analyzed).
    #[inline]
    pub fn flags(&self) -> ScopeFlags {
        self.flags
    }

    /// Flags supplied by the producer; analysis never clears them.
    #[inline]
    pub fn declared_flags(&self) -> ScopeFlags {
        self.declared
    }

    pub fn declare_flags(&mut self, flags: ScopeFlags) {
        self.declared |= flags;
        self.flags |= flags;
    }

    pub(crate) fn set_flags(&mut self, flags: ScopeFlags) {
        self.flags = flags;
    }

    #[inline]
    pub fn needs_binding(&self) -> bool {
        self.flags.contains(ScopeFlags::NEEDS_BINDING)
    }

    #[inline]
    pub fn needs_frame(&self) -> bool {
        self.flags.contains(ScopeFlags::NEEDS_FRAME)
    }

    #[inline]
    pub fn needs_only_backref(&self) -> bool {
        self.flags.contains(ScopeFlags::NEEDS_ONLY_BACKREF)
    }

    #[inline]
    pub fn flags_computed(&self) -> bool {
        self.flags.contains(ScopeFlags::FLAGS_COMPUTED)
    }

    /// Whether this scope manages its own frame and binding.
    #[inline]
    pub fn supports_explicit_call_protocol(&self) -> bool {
        self.kind != ScopeKind::Eval
    }

    // -------------------------------------------------------------------------
    // Temporaries, labels, locals
    // -------------------------------------------------------------------------

    pub fn new_temp(&mut self) -> TempId {
        let temp = TempId(self.next_temp);
        self.next_temp += 1;
        temp
    }

    #[inline]
    pub fn temp_count(&self) -> u32 {
        self.next_temp
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Local names in slot order.
    #[inline]
    pub fn locals(&self) -> &[Arc<str>] {
        &self.locals
    }

    /// Slot of `name`, declaring it if new.
    pub fn declare_local(&mut self, name: &str) -> usize {
        if let Some(slot) = self.local_slot(name) {
            return slot;
        }
        self.locals.push(Arc::from(name));
        self.locals.len() - 1
    }

    pub fn local_slot(&self, name: &str) -> Option<usize> {
        self.locals.iter().position(|l| &**l == name)
    }

    // -------------------------------------------------------------------------
    // Compilation record
    // -------------------------------------------------------------------------

    #[inline]
    pub fn record(&self) -> &CompilationRecord {
        &self.record
    }

    #[inline]
    pub fn uses_explicit_call_protocol(&self) -> bool {
        self.record.explicit_call_protocol
    }

    /// One-way marker set by the call-protocol pass.
    pub fn mark_explicit_call_protocol(&mut self) {
        self.record.explicit_call_protocol = true;
    }

    #[inline]
    pub fn liveness(&self) -> Option<&Arc<LivenessInfo>> {
        self.record.liveness.as_ref()
    }

    pub fn set_liveness(&mut self, info: LivenessInfo) {
        self.record.liveness = Some(Arc::new(info));
    }

    pub fn invalidate_liveness(&mut self) {
        self.record.liveness = None;
    }
}

// =============================================================================
// Scope Tree
// =============================================================================

/// All scopes of a compilation unit.
#[derive(Debug, Clone, Default)]
pub struct ScopeTree {
    scopes: Arena<Scope>,
    roots: Vec<ScopeId>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `scope` under `parent` (or as a root).
    pub fn insert(&mut self, mut scope: Scope, parent: Option<ScopeId>) -> ScopeId {
        scope.parent = parent;
        let id = self.scopes.alloc(scope);
        match parent {
            Some(p) => self.scopes[p].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    #[inline]
    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id]
    }

    #[inline]
    pub fn roots(&self) -> &[ScopeId] {
        &self.roots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ScopeId> {
        self.scopes.ids()
    }

    /// The scope `depth` lexical levels above `id` (0 is `id` itself).
    pub fn ancestor(&self, id: ScopeId, depth: u32) -> Option<ScopeId> {
        let mut current = id;
        for _ in 0..depth {
            current = self.scopes[current].parent?;
        }
        Some(current)
    }

    /// Nearest enclosing scope that is not a closure.
    pub fn method_ancestor(&self, id: ScopeId) -> Option<ScopeId> {
        let mut current = Some(id);
        while let Some(cur) = current {
            if !self.scopes[cur].is_closure() {
                return Some(cur);
            }
            current = self.scopes[cur].parent;
        }
        None
    }

    /// `id` and its descendants, children before parents.
    pub fn post_order(&self, id: ScopeId) -> Vec<ScopeId> {
        let mut out = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((cur, expanded)) = stack.pop() {
            if expanded {
                out.push(cur);
                continue;
            }
            stack.push((cur, true));
            for &child in self.scopes[cur].children.iter().rev() {
                stack.push((child, false));
            }
        }
        out
    }
}
