//! Per-thread execution context.
//!
//! Holds the frame and binding stacks manipulated by the explicit
//! call-protocol instructions, plus the registry every call site resolves
//! against.
//!
//! ```text
//!   frames:    [ Method(foo) | Block | Backref ] ◄─ top
//!   bindings:  [ B0 ] ◄── [ B1 ] ◄── [ B2 ]       ◄─ top
//!                (parent links follow lexical nesting, not the stack)
//! ```

use crate::class::ClassId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::method::Visibility;
use crate::registry::MethodRegistry;
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

// =============================================================================
// Frames
// =============================================================================

/// Kind of a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Full method frame: name, visibility, backref and last line.
    Method,
    /// Reduced frame holding only the backref/last-line slots.
    Backref,
    /// Frame for a running closure body.
    Block,
}

/// Host-side bookkeeping for one activation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub name: Option<Arc<str>>,
    pub visibility: Visibility,
    pub backref: Value,
    pub last_line: Value,
    /// `self` recorded by update-block-state.
    pub block_self: Option<Value>,
}

impl Frame {
    pub fn method(name: Arc<str>, visibility: Visibility) -> Self {
        Self {
            kind: FrameKind::Method,
            name: Some(name),
            visibility,
            backref: Value::Nil,
            last_line: Value::Nil,
            block_self: None,
        }
    }

    pub fn backref_only() -> Self {
        Self {
            kind: FrameKind::Backref,
            name: None,
            visibility: Visibility::Public,
            backref: Value::Nil,
            last_line: Value::Nil,
            block_self: None,
        }
    }

    /// A block frame inherits the visibility of the frame below it.
    pub fn block(name: Option<Arc<str>>, visibility: Visibility) -> Self {
        Self {
            kind: FrameKind::Block,
            name,
            visibility,
            backref: Value::Nil,
            last_line: Value::Nil,
            block_self: None,
        }
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// Shared handle to a binding; closures keep their defining binding alive.
pub type BindingRef = Arc<Mutex<Binding>>;

/// A variable environment.
#[derive(Debug, Default)]
pub struct Binding {
    slots: Vec<Value>,
    parent: Option<BindingRef>,
}

impl Binding {
    pub fn new(slot_count: usize, parent: Option<BindingRef>) -> Self {
        Self {
            slots: vec![Value::Nil; slot_count],
            parent,
        }
    }

    pub fn new_ref(slot_count: usize, parent: Option<BindingRef>) -> BindingRef {
        Arc::new(Mutex::new(Self::new(slot_count, parent)))
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Value {
        self.slots.get(slot).cloned().unwrap_or(Value::Nil)
    }

    /// Store into `slot`, growing the binding if needed.
    pub fn set(&mut self, slot: usize, value: Value) {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, Value::Nil);
        }
        self.slots[slot] = value;
    }

    #[inline]
    pub fn parent(&self) -> Option<&BindingRef> {
        self.parent.as_ref()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// =============================================================================
// Thread Context
// =============================================================================

/// Execution state for one guest thread.
pub struct ThreadContext {
    registry: Arc<MethodRegistry>,
    frames: Vec<Frame>,
    bindings: Vec<BindingRef>,
    /// Defining class of each running guest method, for `super`.
    owners: Vec<ClassId>,
}

impl ThreadContext {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            frames: Vec::with_capacity(16),
            bindings: Vec::with_capacity(16),
            owners: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // Frame stack
    // -------------------------------------------------------------------------

    #[inline]
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop the top frame, which must be of `kind`.
    pub fn pop_frame(&mut self, kind: FrameKind) -> RuntimeResult<Frame> {
        match self.frames.last().map(|f| f.kind) {
            Some(top) if top != kind => Err(RuntimeError::internal(format!(
                "frame stack mismatch: expected {kind:?}, found {top:?}"
            ))),
            _ => self
                .frames
                .pop()
                .ok_or_else(|| RuntimeError::internal("frame stack underflow")),
        }
    }

    #[inline]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Drop frames above `depth`.
    pub fn truncate_frames(&mut self, depth: usize) -> RuntimeResult<()> {
        if depth > self.frames.len() {
            return Err(RuntimeError::internal(format!(
                "cannot restore frame depth {depth} above current {}",
                self.frames.len()
            )));
        }
        self.frames.truncate(depth);
        Ok(())
    }

    #[inline]
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    #[inline]
    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Visibility of the current frame; public when no frame is active.
    #[inline]
    pub fn visibility(&self) -> Visibility {
        self.frames.last().map(|f| f.visibility).unwrap_or_default()
    }

    pub fn set_visibility(&mut self, visibility: Visibility) {
        if let Some(frame) = self.frames.last_mut() {
            frame.visibility = visibility;
        }
    }

    /// Nearest frame owning backref/last-line slots. Block frames share
    /// their method's slots.
    fn special_frame(&mut self) -> Option<&mut Frame> {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| f.kind != FrameKind::Block)
    }

    pub fn backref(&mut self) -> Value {
        self.special_frame().map(|f| f.backref.clone()).unwrap_or_default()
    }

    pub fn set_backref(&mut self, value: Value) {
        if let Some(frame) = self.special_frame() {
            frame.backref = value;
        }
    }

    pub fn last_line(&mut self) -> Value {
        self.special_frame().map(|f| f.last_line.clone()).unwrap_or_default()
    }

    pub fn set_last_line(&mut self, value: Value) {
        if let Some(frame) = self.special_frame() {
            frame.last_line = value;
        }
    }

    // -------------------------------------------------------------------------
    // Binding stack
    // -------------------------------------------------------------------------

    #[inline]
    pub fn push_binding(&mut self, binding: BindingRef) {
        self.bindings.push(binding);
    }

    pub fn pop_binding(&mut self) -> RuntimeResult<BindingRef> {
        self.bindings
            .pop()
            .ok_or_else(|| RuntimeError::internal("binding stack underflow"))
    }

    #[inline]
    pub fn binding_depth(&self) -> usize {
        self.bindings.len()
    }

    #[inline]
    pub fn current_binding(&self) -> Option<&BindingRef> {
        self.bindings.last()
    }

    /// Binding `depth` lexical levels above the current one.
    pub fn binding_at(&self, depth: usize) -> RuntimeResult<BindingRef> {
        let mut binding = self
            .bindings
            .last()
            .cloned()
            .ok_or_else(|| RuntimeError::internal("no active binding"))?;
        for _ in 0..depth {
            let parent = binding
                .lock()
                .parent()
                .cloned()
                .ok_or_else(|| RuntimeError::internal(format!("no binding at depth {depth}")))?;
            binding = parent;
        }
        Ok(binding)
    }

    // -------------------------------------------------------------------------
    // Method owners
    // -------------------------------------------------------------------------

    #[inline]
    pub fn enter_method(&mut self, owner: ClassId) {
        self.owners.push(owner);
    }

    #[inline]
    pub fn leave_method(&mut self) {
        self.owners.pop();
    }

    /// Defining class of the innermost running guest method.
    #[inline]
    pub fn current_owner(&self) -> Option<ClassId> {
        self.owners.last().copied()
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("frames", &self.frames.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}
