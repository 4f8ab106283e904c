//! Method entries.
//!
//! A `MethodEntry` is immutable once published into a method table.
//! Redefinition replaces the entry and bumps the registry version; caches
//! that captured the old entry keep a valid `Arc` to it until their guard
//! notices the version change.

use crate::class::ClassId;
use crate::context::ThreadContext;
use crate::error::RuntimeResult;
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Host implementation of a method body.
///
/// Arguments: thread context, receiver, positional arguments, optional block.
pub type NativeMethod =
    Arc<dyn Fn(&mut ThreadContext, &Value, &[Value], Option<&Value>) -> RuntimeResult<Value> + Send + Sync>;

/// Wrap a closure as a [`NativeMethod`].
#[inline]
pub fn native<F>(body: F) -> NativeMethod
where
    F: Fn(&mut ThreadContext, &Value, &[Value], Option<&Value>) -> RuntimeResult<Value> + Send + Sync + 'static,
{
    Arc::new(body)
}

// =============================================================================
// Visibility
// =============================================================================

/// Method visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Visibility {
    #[default]
    Public = 0,
    Protected = 1,
    Private = 2,
}

impl Visibility {
    /// Encode for storage in a register.
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }

    #[inline]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Visibility::Public),
            1 => Some(Visibility::Protected),
            2 => Some(Visibility::Private),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Properties of a method entry that affect caching.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u8 {
        /// Implemented by the runtime.
        const BUILTIN = 1 << 0;
        /// A hook guest code is expected to override (`method_missing`,
        /// `respond_to_missing?`). Resolutions to hooks are never cached.
        const HOOK = 1 << 1;
        /// Removes an inherited definition (`undef_method`).
        const UNDEFINED = 1 << 2;
    }
}

// =============================================================================
// Method Entry
// =============================================================================

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A resolved method.
pub struct MethodEntry {
    name: Arc<str>,
    owner: ClassId,
    visibility: Visibility,
    flags: MethodFlags,
    /// Expected positional argument count; `None` accepts any.
    arity: Option<usize>,
    serial: u64,
    body: NativeMethod,
}

impl MethodEntry {
    pub fn new(
        name: impl Into<Arc<str>>,
        owner: ClassId,
        visibility: Visibility,
        flags: MethodFlags,
        arity: Option<usize>,
        body: NativeMethod,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            visibility,
            flags,
            arity,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            body,
        }
    }

    /// A public, guest-defined method.
    pub fn guest(
        name: impl Into<Arc<str>>,
        owner: ClassId,
        arity: Option<usize>,
        body: NativeMethod,
    ) -> Self {
        Self::new(name, owner, Visibility::Public, MethodFlags::empty(), arity, body)
    }

    /// An `undef_method` tombstone.
    pub fn undefined(name: impl Into<Arc<str>>, owner: ClassId) -> Self {
        let body = native(|_, _, _, _| Ok(Value::Nil));
        Self::new(name, owner, Visibility::Public, MethodFlags::UNDEFINED, None, body)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn owner(&self) -> ClassId {
        self.owner
    }

    #[inline]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[inline]
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.flags.contains(MethodFlags::BUILTIN)
    }

    #[inline]
    pub fn is_hook(&self) -> bool {
        self.flags.contains(MethodFlags::HOOK)
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.flags.contains(MethodFlags::UNDEFINED)
    }

    /// Unique serial, distinct for every entry ever created.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Invoke the body after checking arity.
    #[inline]
    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if let Some(expected) = self.arity {
            if args.len() != expected {
                return Err(crate::error::RuntimeError::arity(args.len(), expected));
            }
        }
        (self.body)(ctx, receiver, args, block)
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("visibility", &self.visibility)
            .field("flags", &self.flags)
            .field("serial", &self.serial)
            .finish()
    }
}
