//! Primitive numeric operators.
//!
//! These are the bodies shared by the built-in `Integer`/`Float` methods and
//! by the operator fast path of call sites, so the fast path can never
//! disagree with generic dispatch on an untouched class.
//!
//! Integer arithmetic is checked: leaving the 64-bit range raises a
//! `RangeError` instead of promoting to a big integer.

use crate::error::{RuntimeError, RuntimeResult};
use crate::value::Value;

// =============================================================================
// Operator Set
// =============================================================================

/// Binary operators eligible for the built-in fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Lt = 5,
    Le = 6,
    Gt = 7,
    Ge = 8,
    Eq = 9,
    BitAnd = 10,
    BitOr = 11,
    BitXor = 12,
    Shl = 13,
    Shr = 14,
}

impl BinaryOp {
    /// Every operator, in bit order.
    pub const ALL: [BinaryOp; 15] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Mod,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::Eq,
        BinaryOp::BitAnd,
        BinaryOp::BitOr,
        BinaryOp::BitXor,
        BinaryOp::Shl,
        BinaryOp::Shr,
    ];

    /// Resolve a method name to an operator.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "&" => BinaryOp::BitAnd,
            "|" => BinaryOp::BitOr,
            "^" => BinaryOp::BitXor,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }

    /// Bit used in per-class redefinition masks.
    #[inline(always)]
    pub const fn bit(self) -> u32 {
        1 << (self as u8)
    }

    /// Bitwise operators have no `Float` implementation.
    #[inline]
    pub const fn is_integer_only(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }
}

// =============================================================================
// Fixnum Primitives
// =============================================================================

#[inline]
fn overflow(op: BinaryOp) -> RuntimeError {
    RuntimeError::fixnum_overflow(op.name())
}

/// Floored integer division, matching the guest's rounding toward -inf.
#[inline]
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

/// Modulo whose sign follows the divisor.
#[inline]
fn floor_mod(a: i64, b: i64) -> Option<i64> {
    if b == -1 {
        return Some(0);
    }
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

/// Apply `op` to two fixnums.
pub fn fixnum_op(op: BinaryOp, a: i64, b: i64) -> RuntimeResult<Value> {
    Ok(match op {
        BinaryOp::Add => Value::Fixnum(a.checked_add(b).ok_or_else(|| overflow(op))?),
        BinaryOp::Sub => Value::Fixnum(a.checked_sub(b).ok_or_else(|| overflow(op))?),
        BinaryOp::Mul => Value::Fixnum(a.checked_mul(b).ok_or_else(|| overflow(op))?),
        BinaryOp::Div => {
            if b == 0 {
                return Err(RuntimeError::divided_by_zero());
            }
            Value::Fixnum(floor_div(a, b).ok_or_else(|| overflow(op))?)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(RuntimeError::divided_by_zero());
            }
            Value::Fixnum(floor_mod(a, b).ok_or_else(|| overflow(op))?)
        }
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::Eq => Value::Bool(a == b),
        BinaryOp::BitAnd => Value::Fixnum(a & b),
        BinaryOp::BitOr => Value::Fixnum(a | b),
        BinaryOp::BitXor => Value::Fixnum(a ^ b),
        BinaryOp::Shl => Value::Fixnum(shift_left(a, b).ok_or_else(|| overflow(op))?),
        BinaryOp::Shr => Value::Fixnum(shift_right(a, b).ok_or_else(|| overflow(op))?),
    })
}

/// Shift left by `n` bits; negative `n` shifts right arithmetically.
fn shift_left(a: i64, n: i64) -> Option<i64> {
    if n < 0 {
        Some(shift_right_by(a, n.unsigned_abs()))
    } else {
        shift_left_by(a, n.unsigned_abs())
    }
}

/// Shift right by `n` bits; negative `n` shifts left.
fn shift_right(a: i64, n: i64) -> Option<i64> {
    if n < 0 {
        shift_left_by(a, n.unsigned_abs())
    } else {
        Some(shift_right_by(a, n.unsigned_abs()))
    }
}

#[inline]
fn shift_right_by(a: i64, n: u64) -> i64 {
    if n >= 64 {
        if a < 0 { -1 } else { 0 }
    } else {
        a >> n
    }
}

#[inline]
fn shift_left_by(a: i64, n: u64) -> Option<i64> {
    if a == 0 {
        return Some(0);
    }
    if n >= 64 {
        return None;
    }
    let shifted = a.checked_shl(n as u32)?;
    (shifted >> n == a).then_some(shifted)
}

// =============================================================================
// Float Primitives
// =============================================================================

/// Apply `op` to two floats. Bitwise operators are a `NoMethod` error.
pub fn float_op(op: BinaryOp, a: f64, b: f64) -> RuntimeResult<Value> {
    Ok(match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::Mod => {
            let r = a % b;
            Value::Float(if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r })
        }
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::Eq => Value::Bool(a == b),
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
            return Err(RuntimeError::no_method(op.name(), "Float"));
        }
    })
}

// =============================================================================
// Mixed Operands
// =============================================================================

/// Apply `op` with a fixnum receiver and an arbitrary argument.
///
/// Returns `Ok(None)` when the argument is not numeric so the caller can
/// raise a `TypeError` naming the argument.
pub fn fixnum_binary(op: BinaryOp, a: i64, arg: &Value) -> RuntimeResult<Option<Value>> {
    match arg {
        Value::Fixnum(b) => fixnum_op(op, a, *b).map(Some),
        Value::Float(b) if !op.is_integer_only() => float_op(op, a as f64, *b).map(Some),
        _ if op == BinaryOp::Eq => Ok(Some(Value::Bool(false))),
        _ => Ok(None),
    }
}

/// Apply `op` with a float receiver and an arbitrary argument.
pub fn float_binary(op: BinaryOp, a: f64, arg: &Value) -> RuntimeResult<Option<Value>> {
    match arg {
        Value::Float(b) => float_op(op, a, *b).map(Some),
        Value::Fixnum(b) => float_op(op, a, *b as f64).map(Some),
        _ if op == BinaryOp::Eq => Ok(Some(Value::Bool(false))),
        _ if op.is_integer_only() => Err(RuntimeError::no_method(op.name(), "Float")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;

    #[test]
    fn test_from_name_round_trips_every_op() {
        for op in BinaryOp::ALL {
            assert_eq!(BinaryOp::from_name(op.name()), Some(op));
        }
        assert_eq!(BinaryOp::from_name("<=>"), None);
    }

    #[test]
    fn test_bits_are_distinct() {
        let mask = BinaryOp::ALL.iter().fold(0u32, |acc, op| {
            assert_eq!(acc & op.bit(), 0);
            acc | op.bit()
        });
        assert_eq!(mask.count_ones(), 15);
    }

    #[test]
    fn test_floored_division() {
        assert!(matches!(fixnum_op(BinaryOp::Div, 7, 2), Ok(Value::Fixnum(3))));
        assert!(matches!(fixnum_op(BinaryOp::Div, -7, 2), Ok(Value::Fixnum(-4))));
        assert!(matches!(fixnum_op(BinaryOp::Mod, -7, 2), Ok(Value::Fixnum(1))));
        assert!(matches!(fixnum_op(BinaryOp::Mod, 7, -2), Ok(Value::Fixnum(-1))));
    }

    #[test]
    fn test_division_by_zero() {
        let err = fixnum_op(BinaryOp::Div, 1, 0).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::ZeroDivision);
        let err = fixnum_op(BinaryOp::Mod, 1, 0).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::ZeroDivision);
    }

    #[test]
    fn test_overflow_is_range_error() {
        let err = fixnum_op(BinaryOp::Add, i64::MAX, 1).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::Range);
        let err = fixnum_op(BinaryOp::Shl, 1, 64).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::Range);
    }

    #[test]
    fn test_shifts() {
        assert!(matches!(fixnum_op(BinaryOp::Shl, 1, 4), Ok(Value::Fixnum(16))));
        assert!(matches!(fixnum_op(BinaryOp::Shr, 16, 4), Ok(Value::Fixnum(1))));
        assert!(matches!(fixnum_op(BinaryOp::Shr, -1, 100), Ok(Value::Fixnum(-1))));
        assert!(matches!(fixnum_op(BinaryOp::Shl, 8, -2), Ok(Value::Fixnum(2))));
        assert!(matches!(fixnum_op(BinaryOp::Shr, 8, -2), Ok(Value::Fixnum(32))));
    }

    #[test]
    fn test_extreme_operands() {
        assert!(matches!(fixnum_op(BinaryOp::Mod, i64::MIN, -1), Ok(Value::Fixnum(0))));
        assert!(matches!(fixnum_op(BinaryOp::Mod, 5, -1), Ok(Value::Fixnum(0))));
        assert!(matches!(fixnum_op(BinaryOp::Shr, 0, i64::MIN), Ok(Value::Fixnum(0))));
        assert!(matches!(fixnum_op(BinaryOp::Shl, -5, i64::MIN), Ok(Value::Fixnum(-1))));
        assert!(matches!(fixnum_op(BinaryOp::Shl, 5, i64::MIN), Ok(Value::Fixnum(0))));
        // A right shift by i64::MIN is a left shift by 2^63.
        let err = fixnum_op(BinaryOp::Shr, 1, i64::MIN).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::Range);
        let err = fixnum_op(BinaryOp::Div, i64::MIN, -1).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::Range);
    }

    #[test]
    fn test_mixed_operands() {
        let v = fixnum_binary(BinaryOp::Add, 1, &Value::Float(0.5)).unwrap();
        assert!(matches!(v, Some(Value::Float(f)) if f == 1.5));
        let v = fixnum_binary(BinaryOp::Add, 1, &Value::Nil).unwrap();
        assert!(v.is_none());
        let v = float_binary(BinaryOp::Lt, 1.0, &Value::Fixnum(2)).unwrap();
        assert!(matches!(v, Some(Value::Bool(true))));
    }

    #[test]
    fn test_float_bitwise_is_no_method() {
        let err = float_op(BinaryOp::BitAnd, 1.0, 2.0).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::NoMethod);
    }
}
