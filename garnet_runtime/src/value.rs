//! Guest values.
//!
//! Immediate values (nil, booleans, fixnums, floats) are stored inline;
//! everything else is reference counted so that values can be cloned into
//! registers, bindings and literal slots without copying payloads.

use crate::class::ClassId;
use crate::error::RuntimeError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Symbol
// =============================================================================

/// An interned-by-content method or variable name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    #[inline]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Symbol(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_arc(&self) -> &Arc<str> {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol(Arc::from(s))
    }
}

// =============================================================================
// Heap values
// =============================================================================

/// A compiled regular expression literal.
///
/// Matching is out of scope; the value only records its source and options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Regexp {
    pub source: Arc<str>,
    pub options: u32,
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A plain guest object. Attribute storage is not modelled.
#[derive(Debug)]
pub struct Object {
    class: ClassId,
    id: u64,
}

impl Object {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn class(&self) -> ClassId {
        self.class
    }

    #[inline]
    pub fn object_id(&self) -> u64 {
        self.id
    }
}

// =============================================================================
// Value
// =============================================================================

/// A guest value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Fixnum(i64),
    Float(f64),
    Symbol(Symbol),
    Str(Arc<str>),
    Regexp(Arc<Regexp>),
    Object(Arc<Object>),
    /// A rescued exception.
    Exception(Arc<RuntimeError>),
}

impl Value {
    #[inline]
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    #[inline]
    pub fn symbol(s: &str) -> Self {
        Value::Symbol(Symbol::from(s))
    }

    /// Allocate a fresh instance of `class`.
    pub fn new_object(class: ClassId) -> Self {
        Value::Object(Arc::new(Object::new(class)))
    }

    /// The exact runtime class of this value.
    #[inline]
    pub fn class_id(&self) -> ClassId {
        match self {
            Value::Nil => ClassId::NIL,
            Value::Bool(true) => ClassId::TRUE,
            Value::Bool(false) => ClassId::FALSE,
            Value::Fixnum(_) => ClassId::INTEGER,
            Value::Float(_) => ClassId::FLOAT,
            Value::Symbol(_) => ClassId::SYMBOL,
            Value::Str(_) => ClassId::STRING,
            Value::Regexp(_) => ClassId::REGEXP,
            Value::Object(obj) => obj.class(),
            Value::Exception(_) => ClassId::EXCEPTION,
        }
    }

    /// Guest truthiness: only `nil` and `false` are falsy.
    #[inline(always)]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Identity-or-value equality as used by the default `==` and by tests.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Fixnum(a), Value::Float(b)) | (Value::Float(b), Value::Fixnum(a)) => {
                (*a as f64) == *b
            }
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Regexp(a), Value::Regexp(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Debug-ish rendering used in error messages.
    pub fn inspect(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Fixnum(n) => n.to_string(),
            Value::Float(f) => format!("{f:?}"),
            Value::Symbol(s) => format!(":{}", s.as_str()),
            Value::Str(s) => format!("{s:?}"),
            Value::Regexp(r) => format!("/{}/", r.source),
            Value::Object(o) => format!("#<Object:{}>", o.object_id()),
            Value::Exception(e) => format!("#<{}: {}>", e.kind(), e.message()),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Fixnum(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Fixnum(0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn test_class_ids() {
        assert_eq!(Value::Fixnum(1).class_id(), ClassId::INTEGER);
        assert_eq!(Value::Float(1.5).class_id(), ClassId::FLOAT);
        assert_eq!(Value::Nil.class_id(), ClassId::NIL);
        assert_eq!(Value::Bool(true).class_id(), ClassId::TRUE);
        assert_eq!(Value::symbol("a").class_id(), ClassId::SYMBOL);
    }

    #[test]
    fn test_object_identity() {
        let a = Value::new_object(ClassId::OBJECT);
        let b = Value::new_object(ClassId::OBJECT);
        assert!(a.same_value(&a.clone()));
        assert!(!a.same_value(&b));
    }

    #[test]
    fn test_mixed_numeric_equality() {
        assert!(Value::Fixnum(2).same_value(&Value::Float(2.0)));
        assert!(!Value::Fixnum(2).same_value(&Value::Float(2.5)));
    }
}
