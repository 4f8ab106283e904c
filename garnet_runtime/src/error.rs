//! Guest-visible runtime errors.
//!
//! A `RuntimeError` is data, not a host failure: it travels through the
//! interpreter's rescue table like any guest exception and can be rescued,
//! inspected and re-raised by guest code.

use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Result alias for every fallible runtime operation.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Classification of a guest-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    /// Dispatch found no method and no `method_missing` hook.
    NoMethod,
    /// Wrong number of arguments.
    Argument,
    /// Operand of an unexpected class.
    Type,
    /// Integer division or modulo by zero.
    ZeroDivision,
    /// Integer arithmetic left the fixnum range.
    Range,
    /// An arbitrary guest value was thrown.
    Raised,
    /// Runtime bookkeeping was violated (unbalanced frame or binding stack).
    Internal,
}

impl RuntimeErrorKind {
    /// Guest-facing class name for this kind.
    pub const fn class_name(self) -> &'static str {
        match self {
            RuntimeErrorKind::NoMethod => "NoMethodError",
            RuntimeErrorKind::Argument => "ArgumentError",
            RuntimeErrorKind::Type => "TypeError",
            RuntimeErrorKind::ZeroDivision => "ZeroDivisionError",
            RuntimeErrorKind::Range => "RangeError",
            RuntimeErrorKind::Raised => "RuntimeError",
            RuntimeErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// A guest exception.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
    message: Arc<str>,
    /// Payload for `Raised` errors.
    payload: Option<Value>,
}

impl RuntimeError {
    /// Create an error with a message.
    pub fn new(kind: RuntimeErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
        }
    }

    /// `undefined method 'name' for an instance of Class`.
    #[cold]
    pub fn no_method(name: &str, class_name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NoMethod,
            format!("undefined method '{name}' for an instance of {class_name}"),
        )
    }

    /// `private method 'name' called for an instance of Class`.
    #[cold]
    pub fn private_method(name: &str, class_name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NoMethod,
            format!("private method '{name}' called for an instance of {class_name}"),
        )
    }

    /// `super called outside of method` for `super` with no enclosing method.
    #[cold]
    pub fn super_outside_method(name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NoMethod,
            format!("super: no superclass method '{name}' (super called outside of method)"),
        )
    }

    /// `wrong number of arguments (given N, expected M)`.
    #[cold]
    pub fn arity(given: usize, expected: usize) -> Self {
        Self::new(
            RuntimeErrorKind::Argument,
            format!("wrong number of arguments (given {given}, expected {expected})"),
        )
    }

    #[cold]
    pub fn type_error(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::Type, message)
    }

    #[cold]
    pub fn divided_by_zero() -> Self {
        Self::new(RuntimeErrorKind::ZeroDivision, "divided by 0")
    }

    #[cold]
    pub fn fixnum_overflow(op: &str) -> Self {
        Self::new(
            RuntimeErrorKind::Range,
            format!("integer overflow in '{op}'"),
        )
    }

    #[cold]
    pub fn internal(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::Internal, message)
    }

    /// Wrap an arbitrary thrown guest value.
    pub fn raised(value: Value) -> Self {
        let message: Arc<str> = match &value {
            Value::Str(s) => s.clone(),
            other => Arc::from(other.inspect()),
        };
        Self {
            kind: RuntimeErrorKind::Raised,
            message,
            payload: Some(value),
        }
    }

    #[inline]
    pub fn kind(&self) -> RuntimeErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The thrown value for `Raised` errors.
    #[inline]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}
