//! Operator call sites.
//!
//! `Integer` and `Float` receivers skip dispatch entirely while the
//! operator is enabled and the receiver's class has not redefined it.
//! The redefinition mask is read on every call, so a redefinition takes
//! effect on the very next call and stays in effect.

use super::caching::CachingCallSite;
use super::helper::DispatchHelper;
use super::stats::{SiteClassification, SiteStatsSnapshot};
use crate::config::DispatchConfig;
use garnet_runtime::builtins;
use garnet_runtime::ops::{fixnum_op, float_op};
use garnet_runtime::{BinaryOp, ClassId, MethodRegistry, RClass, RuntimeResult, ThreadContext, Value};
use std::sync::Arc;

/// Binary operator site with a primitive fast path.
#[derive(Debug)]
pub struct OperatorCallSite {
    op: BinaryOp,
    enabled: bool,
    integer: Option<Arc<RClass>>,
    float: Option<Arc<RClass>>,
    generic: CachingCallSite,
}

impl OperatorCallSite {
    pub fn new(op: BinaryOp, helper: Arc<DispatchHelper>, registry: &MethodRegistry, config: &DispatchConfig) -> Self {
        Self {
            op,
            enabled: config.fast_ops.contains_op(op),
            integer: registry.class(ClassId::INTEGER),
            float: registry.class(ClassId::FLOAT),
            generic: CachingCallSite::new(helper, config),
        }
    }

    #[inline]
    pub fn op(&self) -> BinaryOp {
        self.op
    }

    #[inline(always)]
    fn untouched(&self, class: &Option<Arc<RClass>>) -> bool {
        self.enabled
            && class
                .as_ref()
                .is_some_and(|c| c.redefined_ops() & self.op.bit() == 0)
    }

    #[inline(always)]
    fn integer_fast(&self) -> bool {
        self.untouched(&self.integer)
    }

    #[inline(always)]
    fn float_fast(&self) -> bool {
        !self.op.is_integer_only() && self.untouched(&self.float)
    }

    pub fn invoke(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if let ([arg], None) = (args, block) {
            match receiver {
                Value::Fixnum(a) if self.integer_fast() => {
                    self.generic.stats().fast_path();
                    return builtins::integer_binary(ctx, self.op, *a, arg);
                }
                Value::Float(a) if self.float_fast() => {
                    self.generic.stats().fast_path();
                    return builtins::float_binary(ctx, self.op, *a, arg);
                }
                _ => {}
            }
        }
        self.generic.invoke(ctx, receiver, args, block)
    }

    /// Unboxed entry for a literal integer argument.
    #[inline]
    pub fn invoke_fixnum(&self, ctx: &mut ThreadContext, receiver: &Value, imm: i64) -> RuntimeResult<Value> {
        match receiver {
            Value::Fixnum(a) if self.integer_fast() => {
                self.generic.stats().fast_path();
                fixnum_op(self.op, *a, imm)
            }
            Value::Float(a) if self.float_fast() => {
                self.generic.stats().fast_path();
                float_op(self.op, *a, imm as f64)
            }
            _ => self.generic.invoke(ctx, receiver, &[Value::Fixnum(imm)], None),
        }
    }

    /// Unboxed entry for a literal float argument.
    #[inline]
    pub fn invoke_float(&self, ctx: &mut ThreadContext, receiver: &Value, imm: f64) -> RuntimeResult<Value> {
        match receiver {
            Value::Float(a) if self.float_fast() => {
                self.generic.stats().fast_path();
                float_op(self.op, *a, imm)
            }
            Value::Fixnum(a) if self.integer_fast() => {
                self.generic.stats().fast_path();
                builtins::integer_binary(ctx, self.op, *a, &Value::Float(imm))
            }
            _ => self.generic.invoke(ctx, receiver, &[Value::Float(imm)], None),
        }
    }

    pub fn classification(&self) -> SiteClassification {
        self.generic.classification()
    }

    pub fn stats_snapshot(&self) -> SiteStatsSnapshot {
        self.generic.stats_snapshot()
    }
}
