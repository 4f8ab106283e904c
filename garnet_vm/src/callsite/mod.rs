//! Call sites.
//!
//! One [`CallSite`] per lexical call expression, built from the unit's
//! [`SiteDescriptor`] the first time the expression runs.
//!
//! | Descriptor kind            | Site                  |
//! |----------------------------|-----------------------|
//! | normal, functional, variable, super | [`CachingCallSite`] |
//! | binary operator            | [`OperatorCallSite`]  |
//! | `respond_to?(:literal)`    | [`RespondToCallSite`] |

mod cache;
mod caching;
mod helper;
mod operator;
mod respond_to;
mod stats;

pub use cache::{CacheEntry, CacheLookup, InlineCache, MissKind, SiteState};
pub use caching::CachingCallSite;
pub use helper::DispatchHelper;
pub use operator::OperatorCallSite;
pub use respond_to::RespondToCallSite;
pub use stats::{SiteClassification, SiteStats, SiteStatsSnapshot, UnitStats};

use crate::config::DispatchConfig;
use garnet_compiler::codegen::{SiteDescriptor, SiteKind};
use garnet_runtime::{MethodRegistry, RuntimeResult, ThreadContext, Value};
use std::sync::Arc;

/// Runtime dispatch record for one call expression.
#[derive(Debug)]
pub enum CallSite {
    Caching(CachingCallSite),
    Operator(OperatorCallSite),
    RespondTo(RespondToCallSite),
}

impl CallSite {
    /// Build the site a descriptor asks for.
    pub fn from_descriptor(
        descriptor: &SiteDescriptor,
        helper: Arc<DispatchHelper>,
        registry: &MethodRegistry,
        config: &DispatchConfig,
    ) -> Self {
        match &descriptor.kind {
            SiteKind::Operator(op) => CallSite::Operator(OperatorCallSite::new(*op, helper, registry, config)),
            SiteKind::RespondTo(name) => CallSite::RespondTo(RespondToCallSite::new(name.clone(), helper, config)),
            SiteKind::Normal | SiteKind::Functional | SiteKind::Variable | SiteKind::Super => {
                CallSite::Caching(CachingCallSite::new(helper, config))
            }
        }
    }

    /// A standalone caching site for `name`.
    pub fn caching(name: &str, call_type: garnet_ir::CallType, config: &DispatchConfig) -> Self {
        CallSite::Caching(CachingCallSite::new(Arc::new(DispatchHelper::new(name, call_type)), config))
    }

    /// Call the site's method on `receiver`.
    #[inline]
    pub fn invoke(&self, ctx: &mut ThreadContext, receiver: &Value, args: &[Value]) -> RuntimeResult<Value> {
        self.invoke_with_block(ctx, receiver, args, None)
    }

    pub fn invoke_with_block(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        match self {
            CallSite::Caching(site) => site.invoke(ctx, receiver, args, block),
            CallSite::Operator(site) => site.invoke(ctx, receiver, args, block),
            CallSite::RespondTo(site) => site.invoke(ctx, receiver, args, block),
        }
    }

    /// Unboxed integer argument; boxes it for non-operator sites.
    #[inline]
    pub fn invoke_fixnum(&self, ctx: &mut ThreadContext, receiver: &Value, imm: i64) -> RuntimeResult<Value> {
        match self {
            CallSite::Operator(site) => site.invoke_fixnum(ctx, receiver, imm),
            _ => self.invoke(ctx, receiver, &[Value::Fixnum(imm)]),
        }
    }

    /// Unboxed float argument; boxes it for non-operator sites.
    #[inline]
    pub fn invoke_float(&self, ctx: &mut ThreadContext, receiver: &Value, imm: f64) -> RuntimeResult<Value> {
        match self {
            CallSite::Operator(site) => site.invoke_float(ctx, receiver, imm),
            _ => self.invoke(ctx, receiver, &[Value::Float(imm)]),
        }
    }

    /// Truthiness of a zero-argument call; predicate sites answer from
    /// their cache.
    pub fn probe(&self, ctx: &mut ThreadContext, receiver: &Value) -> RuntimeResult<bool> {
        match self {
            CallSite::RespondTo(site) => site.probe(ctx, receiver),
            _ => self.invoke(ctx, receiver, &[]).map(|v| v.is_truthy()),
        }
    }

    pub fn classification(&self) -> SiteClassification {
        match self {
            CallSite::Caching(site) => site.classification(),
            CallSite::Operator(site) => site.classification(),
            CallSite::RespondTo(site) => site.classification(),
        }
    }

    pub fn stats(&self) -> SiteStatsSnapshot {
        match self {
            CallSite::Caching(site) => site.stats_snapshot(),
            CallSite::Operator(site) => site.stats_snapshot(),
            CallSite::RespondTo(site) => site.stats_snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_ir::CallType;
    use garnet_runtime::{native, ClassId, RuntimeErrorKind, Visibility};
    use garnet_runtime::{MethodEntry, MethodFlags};

    fn setup() -> (Arc<MethodRegistry>, ThreadContext) {
        let registry = Arc::new(MethodRegistry::new());
        let ctx = ThreadContext::new(registry.clone());
        (registry, ctx)
    }

    #[test]
    fn test_monomorphic_site_looks_up_once() {
        let (registry, mut ctx) = setup();
        let class = registry.define_class("Point", ClassId::OBJECT).unwrap();
        registry
            .define_native(class, "x", Some(0), native(|_, _, _, _| Ok(Value::Fixnum(3))))
            .unwrap();
        let site = CallSite::caching("x", CallType::Normal, &DispatchConfig::default());
        let receiver = Value::new_object(class);

        let before = registry.lookup_count();
        for _ in 0..100 {
            let v = site.invoke(&mut ctx, &receiver, &[]).unwrap();
            assert_eq!(v.as_fixnum(), Some(3));
        }
        assert!(registry.lookup_count() - before <= 1);
        assert_eq!(site.classification(), SiteClassification::Monomorphic);
        assert_eq!(site.stats().hits, 99);
    }

    #[test]
    fn test_missing_method_is_no_method_error() {
        let (_, mut ctx) = setup();
        let site = CallSite::caching("ghost", CallType::Normal, &DispatchConfig::default());
        let err = site.invoke(&mut ctx, &Value::Nil, &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::NoMethod);
        assert_eq!(site.classification(), SiteClassification::Empty);
    }

    #[test]
    fn test_method_missing_hook_receives_name() {
        let (registry, mut ctx) = setup();
        let class = registry.define_class("Ghostly", ClassId::OBJECT).unwrap();
        registry
            .define_native(
                class,
                garnet_runtime::METHOD_MISSING,
                None,
                native(|_, _, args, _| Ok(args[0].clone())),
            )
            .unwrap();
        let site = CallSite::caching("boo", CallType::Normal, &DispatchConfig::default());
        let v = site.invoke(&mut ctx, &Value::new_object(class), &[]).unwrap();
        assert_eq!(v.as_symbol().map(|s| s.as_str().to_string()), Some("boo".to_string()));
        // Hook targets stay uncached.
        assert_eq!(site.classification(), SiteClassification::Empty);
    }

    #[test]
    fn test_private_method_needs_functional_call() {
        let (registry, mut ctx) = setup();
        let class = registry.define_class("Secretive", ClassId::OBJECT).unwrap();
        let body = native(|_, _, _, _| Ok(Value::Bool(true)));
        registry
            .define_method(
                class,
                MethodEntry::new("secret", class, Visibility::Private, MethodFlags::empty(), Some(0), body),
            )
            .unwrap();
        let receiver = Value::new_object(class);
        let config = DispatchConfig::default();

        let normal = CallSite::caching("secret", CallType::Normal, &config);
        let err = normal.invoke(&mut ctx, &receiver, &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::NoMethod);

        let functional = CallSite::caching("secret", CallType::Functional, &config);
        assert!(functional.probe(&mut ctx, &receiver).unwrap());
    }

    #[test]
    fn test_redefinition_reresolves() {
        let (registry, mut ctx) = setup();
        let class = registry.define_class("Counter", ClassId::OBJECT).unwrap();
        registry
            .define_native(class, "value", Some(0), native(|_, _, _, _| Ok(Value::Fixnum(1))))
            .unwrap();
        let site = CallSite::caching("value", CallType::Normal, &DispatchConfig::default());
        let receiver = Value::new_object(class);
        assert_eq!(site.invoke(&mut ctx, &receiver, &[]).unwrap().as_fixnum(), Some(1));

        registry
            .define_native(class, "value", Some(0), native(|_, _, _, _| Ok(Value::Fixnum(2))))
            .unwrap();
        assert_eq!(site.invoke(&mut ctx, &receiver, &[]).unwrap().as_fixnum(), Some(2));
        assert_eq!(site.classification(), SiteClassification::Monomorphic);
    }

    #[test]
    fn test_super_outside_method_raises() {
        let (registry, mut ctx) = setup();
        let parent = registry.define_class("Parent", ClassId::OBJECT).unwrap();
        let child = registry.define_class("Child", parent).unwrap();
        registry
            .define_native(parent, "greet", Some(0), native(|_, _, _, _| Ok(Value::Fixnum(1))))
            .unwrap();
        registry
            .define_native(child, "greet", Some(0), native(|_, _, _, _| Ok(Value::Fixnum(7))))
            .unwrap();
        registry
            .define_native(
                child,
                garnet_runtime::METHOD_MISSING,
                None,
                native(|_, _, _, _| Ok(Value::Fixnum(99))),
            )
            .unwrap();
        let site = CallSite::caching("greet", CallType::Super, &DispatchConfig::default());
        let receiver = Value::new_object(child);

        let err = site.invoke(&mut ctx, &receiver, &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::NoMethod);
        assert!(err.message().contains("outside of method"));

        ctx.enter_method(child);
        assert_eq!(site.invoke(&mut ctx, &receiver, &[]).unwrap().as_fixnum(), Some(1));
        ctx.leave_method();
        assert_eq!(site.classification(), SiteClassification::Empty);
    }
}
