//! Method registry.
//!
//! The registry owns every class and resolves `(name, class)` pairs by
//! walking the superclass chain. It also owns the global redefinition
//! version: any change to any method table bumps it, and every inline cache
//! guard compares the version it captured against the current one.
//!
//! # Resolution
//!
//! ```text
//!   lookup(name, class)
//!        │
//!        ├─ found on class or ancestor ──────────► found, target, hook?
//!        │
//!        ├─ not found, guest method_missing ─────► !found, method_missing, overridable
//!        │
//!        └─ not found, built-in method_missing ──► !found, no target
//! ```

use crate::builtins;
use crate::class::{ClassFlags, ClassId, RClass};
use crate::error::{RuntimeError, RuntimeResult};
use crate::method::{MethodEntry, NativeMethod};
use crate::ops::BinaryOp;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Name of the fallback hook consulted when lookup fails.
pub const METHOD_MISSING: &str = "method_missing";

/// Upper bound on superclass chain length; guards against cycles.
const MAX_ANCESTRY_DEPTH: usize = 256;

// =============================================================================
// Resolution
// =============================================================================

/// Outcome of a method lookup.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// A method with the requested name exists.
    pub found: bool,
    /// Method to call: the found method, or the `method_missing` hook.
    pub target: Option<Arc<MethodEntry>>,
    /// The target is a hook guest code may override; never cache it.
    pub overridable_builtin: bool,
    /// Registry version read before the lookup started.
    pub version: u64,
}

impl Resolution {
    /// Whether an inline cache may remember this resolution.
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        self.found && !self.overridable_builtin && self.target.is_some()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of classes and their method tables.
pub struct MethodRegistry {
    classes: RwLock<FxHashMap<ClassId, Arc<RClass>>>,
    next_id: AtomicU32,
    version: AtomicU64,
    lookups: AtomicU64,
}

impl MethodRegistry {
    /// Create a registry holding the built-in classes and methods.
    pub fn new() -> Self {
        let registry = Self::empty();
        builtins::install(&registry);
        registry
    }

    /// Create a registry with the built-in class hierarchy but no methods.
    pub fn empty() -> Self {
        let registry = Self {
            classes: RwLock::new(FxHashMap::default()),
            next_id: AtomicU32::new(ClassId::FIRST_USER_CLASS),
            version: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        };
        let immediate = ClassFlags::BUILTIN | ClassFlags::IMMEDIATE | ClassFlags::NO_ALLOCATE;
        let builtin_classes = [
            (ClassId::BASIC_OBJECT, "BasicObject", None, ClassFlags::BUILTIN),
            (ClassId::OBJECT, "Object", Some(ClassId::BASIC_OBJECT), ClassFlags::BUILTIN),
            (ClassId::NIL, "NilClass", Some(ClassId::OBJECT), immediate),
            (ClassId::TRUE, "TrueClass", Some(ClassId::OBJECT), immediate),
            (ClassId::FALSE, "FalseClass", Some(ClassId::OBJECT), immediate),
            (ClassId::NUMERIC, "Numeric", Some(ClassId::OBJECT), ClassFlags::BUILTIN),
            (ClassId::INTEGER, "Integer", Some(ClassId::NUMERIC), immediate),
            (ClassId::FLOAT, "Float", Some(ClassId::NUMERIC), immediate),
            (ClassId::SYMBOL, "Symbol", Some(ClassId::OBJECT), immediate),
            (ClassId::STRING, "String", Some(ClassId::OBJECT), ClassFlags::BUILTIN),
            (ClassId::REGEXP, "Regexp", Some(ClassId::OBJECT), ClassFlags::BUILTIN),
            (ClassId::EXCEPTION, "Exception", Some(ClassId::OBJECT), ClassFlags::BUILTIN),
        ];
        {
            let mut classes = registry.classes.write();
            for (id, name, superclass, flags) in builtin_classes {
                classes.insert(id, Arc::new(RClass::new(id, name, superclass, flags)));
            }
        }
        registry
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Define a guest class.
    pub fn define_class(&self, name: &str, superclass: ClassId) -> RuntimeResult<ClassId> {
        let id = ClassId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut classes = self.classes.write();
        let parent = classes
            .get(&superclass)
            .ok_or_else(|| RuntimeError::type_error(format!("superclass {superclass:?} is not a class")))?
            .clone();
        let class = RClass::new(id, name, Some(superclass), ClassFlags::empty());
        // Inherit operator redefinitions already visible through the parent.
        class.mark_redefined(parent.redefined_ops());
        classes.insert(id, Arc::new(class));
        tracing::debug!(class = name, id = id.raw(), "defined class");
        Ok(id)
    }

    #[inline]
    pub fn class(&self, id: ClassId) -> Option<Arc<RClass>> {
        self.classes.read().get(&id).cloned()
    }

    /// Guest-facing name of a class.
    pub fn class_name(&self, id: ClassId) -> String {
        self.class(id)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| format!("#<Class:{}>", id.raw()))
    }

    /// Whether `class` is `ancestor` or inherits from it.
    pub fn is_kind_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let classes = self.classes.read();
        Self::chain_contains(&classes, class, ancestor)
    }

    fn chain_contains(classes: &FxHashMap<ClassId, Arc<RClass>>, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        for _ in 0..MAX_ANCESTRY_DEPTH {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = classes.get(&id).and_then(|c| c.superclass()),
                None => return false,
            }
        }
        false
    }

    // =========================================================================
    // Method Definition
    // =========================================================================

    /// Publish a method on `class`, replacing any previous definition.
    ///
    /// Bumps the redefinition version. Defining a fast-path operator from
    /// guest code disables the operator fast path on `class` and every
    /// class inheriting from it.
    pub fn define_method(&self, class: ClassId, entry: MethodEntry) -> RuntimeResult<()> {
        let entry = Arc::new(entry);
        let classes = self.classes.read();
        let target = classes
            .get(&class)
            .ok_or_else(|| RuntimeError::type_error(format!("no class {class:?}")))?;

        if !entry.is_builtin() {
            if let Some(op) = BinaryOp::from_name(entry.name()) {
                for candidate in classes.values() {
                    if Self::chain_contains(&classes, candidate.id(), class) {
                        candidate.mark_redefined(op.bit());
                    }
                }
                tracing::debug!(
                    class = target.name(),
                    op = op.name(),
                    "operator redefined, fast path disabled"
                );
            }
        }

        let name = entry.name().to_string();
        target.insert_method(entry);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(class = target.name(), method = %name, version, "method defined");
        Ok(())
    }

    /// Convenience for defining a guest method from a closure.
    pub fn define_native(
        &self,
        class: ClassId,
        name: &str,
        arity: Option<usize>,
        body: NativeMethod,
    ) -> RuntimeResult<()> {
        self.define_method(class, MethodEntry::guest(name, class, arity, body))
    }

    /// Hide an inherited method from lookups through `class`.
    pub fn undef_method(&self, class: ClassId, name: &str) -> RuntimeResult<()> {
        self.define_method(class, MethodEntry::undefined(name, class))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Current redefinition version. Lock-free.
    #[inline(always)]
    pub fn redefinition_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of full lookups performed so far.
    #[inline]
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Whether guest code has redefined `op` for instances of `class`.
    #[inline]
    pub fn operator_redefined(&self, class: ClassId, op: BinaryOp) -> bool {
        self.class(class)
            .map(|c| c.redefined_ops() & op.bit() != 0)
            .unwrap_or(true)
    }

    /// Walk the superclass chain starting at `start`.
    fn find_from(&self, name: &str, start: Option<ClassId>) -> Option<Arc<MethodEntry>> {
        let classes = self.classes.read();
        let mut current = start;
        for _ in 0..MAX_ANCESTRY_DEPTH {
            let class = classes.get(&current?)?;
            if let Some(entry) = class.own_method(name) {
                return (!entry.is_undefined()).then_some(entry);
            }
            current = class.superclass();
        }
        None
    }

    /// Find a method without the `method_missing` fallback.
    #[inline]
    pub fn find_method(&self, name: &str, class: ClassId) -> Option<Arc<MethodEntry>> {
        self.find_from(name, Some(class))
    }

    /// Resolve `name` for a receiver of `class`.
    pub fn lookup(&self, name: &str, class: ClassId) -> Resolution {
        self.resolve(name, class, Some(class))
    }

    /// Resolve `name` starting above `owner`, for `super` calls from a
    /// method defined on `owner` with a receiver of `class`.
    pub fn lookup_super(&self, name: &str, owner: ClassId, class: ClassId) -> Resolution {
        let start = self.class(owner).and_then(|c| c.superclass());
        self.resolve(name, class, start)
    }

    fn resolve(&self, name: &str, class: ClassId, start: Option<ClassId>) -> Resolution {
        let version = self.redefinition_version();
        self.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.find_from(name, start) {
            let overridable_builtin = entry.is_hook();
            return Resolution {
                found: true,
                target: Some(entry),
                overridable_builtin,
                version,
            };
        }

        let hook = self
            .find_method(METHOD_MISSING, class)
            .filter(|entry| !entry.is_builtin());
        Resolution {
            found: false,
            overridable_builtin: hook.is_some(),
            target: hook,
            version,
        }
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("classes", &self.classes.read().len())
            .field("version", &self.redefinition_version())
            .field("lookups", &self.lookup_count())
            .finish()
    }
}
