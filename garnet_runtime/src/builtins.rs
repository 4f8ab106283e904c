//! Built-in methods.
//!
//! Installs the numeric operators backed by [`crate::ops`], the default
//! `respond_to?` / `respond_to_missing?` pair and a handful of `Object`
//! basics. Every entry is flagged `BUILTIN` so call sites can tell them
//! apart from guest redefinitions.

use crate::class::ClassId;
use crate::context::ThreadContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::method::{native, MethodEntry, MethodFlags, NativeMethod, Visibility};
use crate::ops::{self, BinaryOp};
use crate::registry::{MethodRegistry, METHOD_MISSING};
use crate::value::Value;
use std::sync::Arc;

pub const RESPOND_TO: &str = "respond_to?";
pub const RESPOND_TO_MISSING: &str = "respond_to_missing?";

/// Install every built-in method into `registry`.
pub fn install(registry: &MethodRegistry) {
    install_basic_object(registry);
    install_integer(registry);
    install_float(registry);
    tracing::trace!(version = registry.redefinition_version(), "built-ins installed");
}

fn define(registry: &MethodRegistry, class: ClassId, name: &str, arity: Option<usize>, flags: MethodFlags, body: NativeMethod) {
    let entry = MethodEntry::new(name, class, Visibility::Public, flags | MethodFlags::BUILTIN, arity, body);
    // Built-in classes always exist in a fresh registry.
    if let Err(err) = registry.define_method(class, entry) {
        tracing::warn!(%err, method = name, "failed to install built-in");
    }
}

// =============================================================================
// BasicObject / Object
// =============================================================================

fn install_basic_object(registry: &MethodRegistry) {
    let object = ClassId::BASIC_OBJECT;

    define(registry, object, METHOD_MISSING, None, MethodFlags::HOOK, native(|ctx, recv, args, _| {
        let name = args
            .first()
            .and_then(Value::as_symbol)
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        Err(RuntimeError::no_method(&name, &ctx.registry().class_name(recv.class_id())))
    }));

    define(registry, object, RESPOND_TO, None, MethodFlags::empty(), native(|ctx, recv, args, _| {
        let name = args
            .first()
            .and_then(Value::as_symbol)
            .ok_or_else(|| RuntimeError::type_error("respond_to? expects a symbol"))?
            .clone();
        let include_all = args.get(1).is_some_and(Value::is_truthy);
        respond_to(ctx, recv, name.as_str(), include_all).map(Value::Bool)
    }));

    define(registry, object, RESPOND_TO_MISSING, Some(2), MethodFlags::HOOK, native(|_, _, _, _| {
        Ok(Value::Bool(false))
    }));

    define(registry, object, "==", Some(1), MethodFlags::empty(), native(|_, recv, args, _| {
        Ok(Value::Bool(recv.same_value(&args[0])))
    }));

    define(registry, object, "!", Some(0), MethodFlags::empty(), native(|_, recv, _, _| {
        Ok(Value::Bool(!recv.is_truthy()))
    }));

    define(registry, object, "nil?", Some(0), MethodFlags::empty(), native(|_, recv, _, _| {
        Ok(Value::Bool(recv.is_nil()))
    }));

    define(registry, object, "inspect", Some(0), MethodFlags::empty(), native(|_, recv, _, _| {
        Ok(Value::Str(Arc::from(recv.inspect())))
    }));
}

/// Whether `receiver` responds to `name` under the built-in rules: a
/// defined method that is public (or any method when `include_all`), else
/// whatever `respond_to_missing?` answers.
pub fn respond_to(ctx: &mut ThreadContext, receiver: &Value, name: &str, include_all: bool) -> RuntimeResult<bool> {
    let class = receiver.class_id();
    if let Some(entry) = ctx.registry().find_method(name, class) {
        return Ok(include_all || entry.visibility() == Visibility::Public);
    }
    let missing = ctx.registry().find_method(RESPOND_TO_MISSING, class);
    match missing {
        Some(entry) if !entry.is_builtin() => {
            let args = [Value::symbol(name), Value::Bool(include_all)];
            Ok(entry.call(ctx, receiver, &args, None)?.is_truthy())
        }
        _ => Ok(false),
    }
}

// =============================================================================
// Numeric
// =============================================================================

fn install_integer(registry: &MethodRegistry) {
    for op in BinaryOp::ALL {
        define(registry, ClassId::INTEGER, op.name(), Some(1), MethodFlags::empty(), native(move |ctx, recv, args, _| {
            let a = recv
                .as_fixnum()
                .ok_or_else(|| RuntimeError::type_error("Integer method called on non-Integer"))?;
            integer_binary(ctx, op, a, &args[0])
        }));
    }
    define(registry, ClassId::INTEGER, "zero?", Some(0), MethodFlags::empty(), native(|_, recv, _, _| {
        Ok(Value::Bool(recv.as_fixnum() == Some(0)))
    }));
}

fn install_float(registry: &MethodRegistry) {
    for op in BinaryOp::ALL.into_iter().filter(|op| !op.is_integer_only()) {
        define(registry, ClassId::FLOAT, op.name(), Some(1), MethodFlags::empty(), native(move |ctx, recv, args, _| {
            let a = recv
                .as_float()
                .ok_or_else(|| RuntimeError::type_error("Float method called on non-Float"))?;
            float_binary(ctx, op, a, &args[0])
        }));
    }
}

/// Built-in `Integer#op` with a boxed argument.
pub fn integer_binary(ctx: &ThreadContext, op: BinaryOp, a: i64, arg: &Value) -> RuntimeResult<Value> {
    ops::fixnum_binary(op, a, arg)?.ok_or_else(|| coercion_error(ctx, arg, "Integer"))
}

/// Built-in `Float#op` with a boxed argument.
pub fn float_binary(ctx: &ThreadContext, op: BinaryOp, a: f64, arg: &Value) -> RuntimeResult<Value> {
    ops::float_binary(op, a, arg)?.ok_or_else(|| coercion_error(ctx, arg, "Float"))
}

#[cold]
fn coercion_error(ctx: &ThreadContext, arg: &Value, target: &str) -> RuntimeError {
    let class = ctx.registry().class_name(arg.class_id());
    RuntimeError::type_error(format!("{class} can't be coerced into {target}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;

    fn ctx() -> ThreadContext {
        ThreadContext::new(Arc::new(MethodRegistry::new()))
    }

    fn call(ctx: &mut ThreadContext, recv: &Value, name: &str, args: &[Value]) -> RuntimeResult<Value> {
        let res = ctx.registry().lookup(name, recv.class_id());
        let target = res.target.ok_or_else(|| RuntimeError::no_method(name, "?"))?;
        target.call(ctx, recv, args, None)
    }

    #[test]
    fn test_integer_add() {
        let mut ctx = ctx();
        let v = call(&mut ctx, &Value::Fixnum(2), "+", &[Value::Fixnum(3)]).unwrap();
        assert!(matches!(v, Value::Fixnum(5)));
    }

    #[test]
    fn test_integer_coercion_error() {
        let mut ctx = ctx();
        let err = call(&mut ctx, &Value::Fixnum(2), "+", &[Value::str("x")]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::Type);
        assert_eq!(err.message(), "String can't be coerced into Integer");
    }

    #[test]
    fn test_builtin_arity_check() {
        let mut ctx = ctx();
        let err = call(&mut ctx, &Value::Fixnum(2), "+", &[]).unwrap_err();
        assert_eq!(err.kind(), RuntimeErrorKind::Argument);
    }

    #[test]
    fn test_float_has_no_bitwise_ops() {
        let ctx = ctx();
        assert!(!ctx.registry().lookup("&", ClassId::FLOAT).found);
        assert!(ctx.registry().lookup("<", ClassId::FLOAT).found);
    }

    #[test]
    fn test_respond_to_builtin() {
        let mut ctx = ctx();
        let recv = Value::Fixnum(1);
        let yes = call(&mut ctx, &recv, RESPOND_TO, &[Value::symbol("+")]).unwrap();
        let no = call(&mut ctx, &recv, RESPOND_TO, &[Value::symbol("frob")]).unwrap();
        assert!(yes.is_truthy());
        assert!(!no.is_truthy());
    }

    #[test]
    fn test_respond_to_consults_guest_missing_hook() {
        let mut ctx = ctx();
        let registry = ctx.registry().clone();
        let class = registry.define_class("Dyn", ClassId::OBJECT).unwrap();
        registry
            .define_native(class, RESPOND_TO_MISSING, Some(2), native(|_, _, args, _| {
                Ok(Value::Bool(args[0].as_symbol().is_some_and(|s| s.as_str().starts_with("dyn_"))))
            }))
            .unwrap();
        let obj = Value::new_object(class);
        assert!(respond_to(&mut ctx, &obj, "dyn_x", false).unwrap());
        assert!(!respond_to(&mut ctx, &obj, "other", false).unwrap());
    }

    #[test]
    fn test_respond_to_hides_private_methods() {
        let mut ctx = ctx();
        let registry = ctx.registry().clone();
        let class = registry.define_class("Secretive", ClassId::OBJECT).unwrap();
        let body = native(|_, _, _, _| Ok(Value::Nil));
        registry
            .define_method(class, MethodEntry::new("hidden", class, Visibility::Private, MethodFlags::empty(), None, body))
            .unwrap();
        let obj = Value::new_object(class);
        assert!(!respond_to(&mut ctx, &obj, "hidden", false).unwrap());
        assert!(respond_to(&mut ctx, &obj, "hidden", true).unwrap());
    }
}
