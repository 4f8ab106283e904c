//! Class identities and per-class method tables.
//!
//! A class owns a concurrent method table and a redefinition mask recording
//! which fast-path operators have been replaced by guest code. The mask is
//! what operator call sites consult on every call, so it is a single atomic
//! load on the hot path.

use crate::method::MethodEntry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// =============================================================================
// Class Identity
// =============================================================================

/// Unique identifier for a class. Built-in classes have fixed ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    pub const BASIC_OBJECT: ClassId = ClassId(0);
    pub const OBJECT: ClassId = ClassId(1);
    pub const NIL: ClassId = ClassId(2);
    pub const TRUE: ClassId = ClassId(3);
    pub const FALSE: ClassId = ClassId(4);
    pub const NUMERIC: ClassId = ClassId(5);
    pub const INTEGER: ClassId = ClassId(6);
    pub const FLOAT: ClassId = ClassId(7);
    pub const SYMBOL: ClassId = ClassId(8);
    pub const STRING: ClassId = ClassId(9);
    pub const REGEXP: ClassId = ClassId(10);
    pub const EXCEPTION: ClassId = ClassId(11);

    /// First id handed out to guest-defined classes.
    pub const FIRST_USER_CLASS: u32 = 64;

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        ClassId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_builtin(self) -> bool {
        self.0 < Self::FIRST_USER_CLASS
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

// =============================================================================
// Class Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags describing class capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// Class is provided by the runtime.
        const BUILTIN = 1 << 0;
        /// Instances are immediates (nil, booleans, numbers, symbols).
        const IMMEDIATE = 1 << 1;
        /// Guest code may not create instances with `new`.
        const NO_ALLOCATE = 1 << 2;
    }
}

// =============================================================================
// Class
// =============================================================================

/// Method table keyed by method name.
pub type MethodTable = DashMap<Arc<str>, Arc<MethodEntry>, FxBuildHasher>;

/// A guest class.
pub struct RClass {
    id: ClassId,
    name: Arc<str>,
    superclass: Option<ClassId>,
    flags: ClassFlags,
    methods: MethodTable,
    /// Bit set of `BinaryOp::bit()` for operators defined by guest code on
    /// this class or an ancestor after creation.
    redefined_ops: AtomicU32,
}

impl RClass {
    pub fn new(id: ClassId, name: impl Into<Arc<str>>, superclass: Option<ClassId>, flags: ClassFlags) -> Self {
        Self {
            id,
            name: name.into(),
            superclass,
            flags,
            methods: DashMap::with_hasher(FxBuildHasher),
            redefined_ops: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn superclass(&self) -> Option<ClassId> {
        self.superclass
    }

    #[inline]
    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// Find a method defined directly on this class.
    #[inline]
    pub fn own_method(&self, name: &str) -> Option<Arc<MethodEntry>> {
        self.methods.get(name).map(|entry| entry.value().clone())
    }

    /// Insert or replace a method, returning the previous definition.
    pub(crate) fn insert_method(&self, entry: Arc<MethodEntry>) -> Option<Arc<MethodEntry>> {
        self.methods.insert(entry.name_arc().clone(), entry)
    }

    /// Names of methods defined directly on this class.
    pub fn method_names(&self) -> Vec<Arc<str>> {
        self.methods.iter().map(|e| e.key().clone()).collect()
    }

    /// Current operator redefinition mask.
    #[inline(always)]
    pub fn redefined_ops(&self) -> u32 {
        self.redefined_ops.load(Ordering::Acquire)
    }

    /// Record that the operators in `bits` no longer have built-in behavior.
    ///
    /// Bits are never cleared.
    #[inline]
    pub(crate) fn mark_redefined(&self, bits: u32) {
        self.redefined_ops.fetch_or(bits, Ordering::AcqRel);
    }
}

impl fmt::Debug for RClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("superclass", &self.superclass)
            .field("methods", &self.methods.len())
            .field("redefined_ops", &format_args!("{:#x}", self.redefined_ops()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids() {
        assert!(ClassId::INTEGER.is_builtin());
        assert!(!ClassId::from_raw(ClassId::FIRST_USER_CLASS).is_builtin());
    }

    #[test]
    fn test_redefinition_mask_is_sticky() {
        let class = RClass::new(ClassId::INTEGER, "Integer", Some(ClassId::NUMERIC), ClassFlags::BUILTIN);
        assert_eq!(class.redefined_ops(), 0);
        class.mark_redefined(0b10);
        class.mark_redefined(0b01);
        assert_eq!(class.redefined_ops(), 0b11);
    }
}
