//! Shared dispatch helpers.
//!
//! A helper is the generic, uncached path for one call shape: name, arity,
//! closure presence and call type. Every site of that shape in a unit
//! shares the same helper.

use garnet_compiler::codegen::HelperDescriptor;
use garnet_ir::CallType;
use garnet_runtime::{ClassId, MethodEntry, Resolution, RuntimeError, RuntimeResult, ThreadContext, Value, Visibility};
use smallvec::SmallVec;
use std::sync::Arc;

/// Full lookup and invocation for one call shape.
#[derive(Debug)]
pub struct DispatchHelper {
    symbol: Arc<str>,
    method: Arc<str>,
    call_type: CallType,
}

impl DispatchHelper {
    pub fn new(method: &str, call_type: CallType) -> Self {
        Self {
            symbol: Arc::from(format!("dispatch:{method}:{call_type:?}")),
            method: Arc::from(method),
            call_type,
        }
    }

    pub fn from_descriptor(descriptor: &HelperDescriptor) -> Self {
        Self {
            symbol: descriptor.symbol.clone(),
            method: descriptor.method.clone(),
            call_type: descriptor.call_type,
        }
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[inline]
    pub fn method_name(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Resolve the method for a receiver of `class`.
    pub fn resolve(&self, ctx: &ThreadContext, class: ClassId) -> Resolution {
        let registry = ctx.registry();
        match (self.call_type, ctx.current_owner()) {
            (CallType::Super, Some(owner)) => registry.lookup_super(&self.method, owner, class),
            // No method to start above; the call raises in `dispatch`.
            (CallType::Super, None) => Resolution {
                found: false,
                target: None,
                overridable_builtin: false,
                version: registry.redefinition_version(),
            },
            _ => registry.lookup(&self.method, class),
        }
    }

    /// Invoke a resolved method, honouring visibility.
    #[inline]
    pub fn call_method(
        &self,
        ctx: &mut ThreadContext,
        method: &MethodEntry,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if self.call_type == CallType::Normal && method.visibility() == Visibility::Private {
            return Err(self.private_error(ctx, receiver));
        }
        method.call(ctx, receiver, args, block)
    }

    /// Invoke the target of a full resolution, falling back to
    /// `method_missing` with the method name prepended.
    pub fn call_resolved(
        &self,
        ctx: &mut ThreadContext,
        resolution: &Resolution,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        match &resolution.target {
            Some(method) if resolution.found => self.call_method(ctx, method, receiver, args, block),
            Some(hook) => {
                let mut with_name: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len() + 1);
                with_name.push(Value::symbol(&self.method));
                with_name.extend(args.iter().cloned());
                hook.call(ctx, receiver, &with_name, block)
            }
            None => Err(self.no_method_error(ctx, receiver)),
        }
    }

    /// Resolve and call without any cache.
    pub fn dispatch(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if self.call_type == CallType::Super && ctx.current_owner().is_none() {
            return Err(RuntimeError::super_outside_method(&self.method));
        }
        let resolution = self.resolve(ctx, receiver.class_id());
        self.call_resolved(ctx, &resolution, receiver, args, block)
    }

    #[cold]
    fn no_method_error(&self, ctx: &ThreadContext, receiver: &Value) -> RuntimeError {
        RuntimeError::no_method(&self.method, &ctx.registry().class_name(receiver.class_id()))
    }

    #[cold]
    fn private_error(&self, ctx: &ThreadContext, receiver: &Value) -> RuntimeError {
        RuntimeError::private_method(&self.method, &ctx.registry().class_name(receiver.class_id()))
    }
}
