//! Observable dispatch behaviour of call sites against a live registry.

use garnet_compiler::codegen::{SiteDescriptor, SiteKind};
use garnet_runtime::{native, BinaryOp, ClassId, MethodRegistry, ThreadContext, Value};
use garnet_vm::{CallSite, DispatchConfig, DispatchHelper, FastOps, SiteClassification};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn setup() -> (Arc<MethodRegistry>, ThreadContext) {
    let registry = Arc::new(MethodRegistry::new());
    let ctx = ThreadContext::new(registry.clone());
    (registry, ctx)
}

fn site(name: &str, kind: SiteKind, registry: &MethodRegistry, config: &DispatchConfig) -> CallSite {
    let descriptor = SiteDescriptor {
        name: Arc::from(name),
        kind,
        arity: 1,
        has_closure: false,
        helper: 0,
    };
    let helper = Arc::new(DispatchHelper::new(name, descriptor.kind.call_type()));
    CallSite::from_descriptor(&descriptor, helper, registry, config)
}

fn class_with_name_method(registry: &MethodRegistry, class_name: &str, answer: i64) -> ClassId {
    let class = registry.define_class(class_name, ClassId::OBJECT).unwrap();
    registry
        .define_native(class, "name", Some(0), native(move |_, _, _, _| Ok(Value::Fixnum(answer))))
        .unwrap();
    class
}

// =============================================================================
// Monomorphic / Megamorphic
// =============================================================================

#[test]
fn test_same_class_calls_look_up_at_most_once() {
    let (registry, mut ctx) = setup();
    let class = class_with_name_method(&registry, "Person", 7);
    let site = site("name", SiteKind::Normal, &registry, &DispatchConfig::default());
    let receiver = Value::new_object(class);

    let before = registry.lookup_count();
    for _ in 0..1_000 {
        assert_eq!(site.invoke(&mut ctx, &receiver, &[]).unwrap().as_fixnum(), Some(7));
    }
    assert!(registry.lookup_count() - before <= 1);
    assert_eq!(site.classification(), SiteClassification::Monomorphic);
}

#[test]
fn test_fresh_instances_of_one_class_share_the_entry() {
    let (registry, mut ctx) = setup();
    let class = class_with_name_method(&registry, "Person", 1);
    let site = site("name", SiteKind::Normal, &registry, &DispatchConfig::default());

    let before = registry.lookup_count();
    for _ in 0..50 {
        site.invoke(&mut ctx, &Value::new_object(class), &[]).unwrap();
    }
    assert_eq!(registry.lookup_count() - before, 1);
}

#[test]
fn test_alternating_classes_go_megamorphic() {
    let (registry, mut ctx) = setup();
    let config = DispatchConfig::default().with_miss_tolerance(4);
    let classes: Vec<ClassId> = (0..6)
        .map(|i| class_with_name_method(&registry, &format!("Shape{i}"), i))
        .collect();
    let site = site("name", SiteKind::Normal, &registry, &config);

    // One empty miss, then a class miss per call until the tolerance is spent.
    for (i, &class) in classes.iter().cycle().take(5).enumerate() {
        let v = site.invoke(&mut ctx, &Value::new_object(class), &[]).unwrap();
        assert_eq!(v.as_fixnum(), Some(i as i64));
    }
    assert_eq!(site.classification(), SiteClassification::Megamorphic);

    let before = registry.lookup_count();
    for &class in classes.iter().cycle().take(60) {
        site.invoke(&mut ctx, &Value::new_object(class), &[]).unwrap();
    }
    assert_eq!(registry.lookup_count() - before, 60);

    // Sticky even for a class the site has already seen.
    for _ in 0..10 {
        site.invoke(&mut ctx, &Value::new_object(classes[0]), &[]).unwrap();
    }
    assert_eq!(site.classification(), SiteClassification::Megamorphic);
}

#[test]
fn test_redefinition_invalidates_and_recaptures() {
    let (registry, mut ctx) = setup();
    let class = class_with_name_method(&registry, "Person", 1);
    let site = site("name", SiteKind::Normal, &registry, &DispatchConfig::default());
    let receiver = Value::new_object(class);
    site.invoke(&mut ctx, &receiver, &[]).unwrap();

    // Unrelated definitions bump the global version too.
    let other = registry.define_class("Other", ClassId::OBJECT).unwrap();
    registry
        .define_native(other, "unrelated", Some(0), native(|_, _, _, _| Ok(Value::Nil)))
        .unwrap();
    let before = registry.lookup_count();
    site.invoke(&mut ctx, &receiver, &[]).unwrap();
    site.invoke(&mut ctx, &receiver, &[]).unwrap();
    assert_eq!(registry.lookup_count() - before, 1);
    // Stale misses never count toward the tolerance.
    assert_eq!(site.classification(), SiteClassification::Monomorphic);
}

#[test]
fn test_undef_method_raises_no_method_on_next_call() {
    let (registry, mut ctx) = setup();
    let parent = class_with_name_method(&registry, "Base", 1);
    let child = registry.define_class("Derived", parent).unwrap();
    let site = site("name", SiteKind::Normal, &registry, &DispatchConfig::default());
    let receiver = Value::new_object(child);
    assert_eq!(site.invoke(&mut ctx, &receiver, &[]).unwrap().as_fixnum(), Some(1));

    registry.undef_method(child, "name").unwrap();
    let err = site.invoke(&mut ctx, &receiver, &[]).unwrap_err();
    assert_eq!(err.kind(), garnet_runtime::RuntimeErrorKind::NoMethod);
}

// =============================================================================
// Operator Fast Path
// =============================================================================

#[test]
fn test_integer_add_bypasses_dispatch() {
    let (registry, mut ctx) = setup();
    let site = site("+", SiteKind::Operator(BinaryOp::Add), &registry, &DispatchConfig::default());

    let before = registry.lookup_count();
    for i in 0..100 {
        let v = site.invoke(&mut ctx, &Value::Fixnum(i), &[Value::Fixnum(1)]).unwrap();
        assert_eq!(v.as_fixnum(), Some(i + 1));
        let v = site.invoke_fixnum(&mut ctx, &Value::Fixnum(i), 2).unwrap();
        assert_eq!(v.as_fixnum(), Some(i + 2));
    }
    assert_eq!(registry.lookup_count(), before);
    assert_eq!(site.stats().fast_path_hits, 200);
}

#[test]
fn test_redefined_integer_add_uses_generic_dispatch() {
    let (registry, mut ctx) = setup();
    let site = site("+", SiteKind::Operator(BinaryOp::Add), &registry, &DispatchConfig::default());
    assert_eq!(site.invoke_fixnum(&mut ctx, &Value::Fixnum(1), 1).unwrap().as_fixnum(), Some(2));

    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    registry
        .define_native(
            ClassId::INTEGER,
            "+",
            Some(1),
            native(move |_, _, _, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(Value::Fixnum(-1))
            }),
        )
        .unwrap();

    for _ in 0..5 {
        assert_eq!(site.invoke_fixnum(&mut ctx, &Value::Fixnum(1), 1).unwrap().as_fixnum(), Some(-1));
        assert_eq!(
            site.invoke(&mut ctx, &Value::Fixnum(1), &[Value::Fixnum(1)]).unwrap().as_fixnum(),
            Some(-1)
        );
    }
    assert_eq!(calls.load(Ordering::Relaxed), 10);
    assert_eq!(site.stats().fast_path_hits, 1);
}

#[test]
fn test_disabled_operator_takes_generic_path() {
    let (registry, mut ctx) = setup();
    let config = DispatchConfig::default().with_fast_ops(FastOps::all() - FastOps::MUL);
    let site = site("*", SiteKind::Operator(BinaryOp::Mul), &registry, &config);

    let before = registry.lookup_count();
    let v = site.invoke_fixnum(&mut ctx, &Value::Fixnum(6), 7).unwrap();
    assert_eq!(v.as_fixnum(), Some(42));
    assert_eq!(registry.lookup_count() - before, 1);
    assert_eq!(site.stats().fast_path_hits, 0);
}

#[test]
fn test_float_fast_path_and_mixed_operands() {
    let (registry, mut ctx) = setup();
    let site = site("*", SiteKind::Operator(BinaryOp::Mul), &registry, &DispatchConfig::default());
    let v = site.invoke_float(&mut ctx, &Value::Float(1.5), 2.0).unwrap();
    assert_eq!(v.as_float(), Some(3.0));
    let v = site.invoke_float(&mut ctx, &Value::Fixnum(2), 0.25).unwrap();
    assert_eq!(v.as_float(), Some(0.5));
    assert_eq!(site.stats().fast_path_hits, 2);
}

#[test]
fn test_fixnum_overflow_raises_range_error() {
    let (registry, mut ctx) = setup();
    let site = site("+", SiteKind::Operator(BinaryOp::Add), &registry, &DispatchConfig::default());
    let err = site.invoke_fixnum(&mut ctx, &Value::Fixnum(i64::MAX), 1).unwrap_err();
    assert_eq!(err.kind(), garnet_runtime::RuntimeErrorKind::Range);
}

#[test]
fn test_operator_on_guest_object_dispatches() {
    let (registry, mut ctx) = setup();
    let class = registry.define_class("Vector", ClassId::OBJECT).unwrap();
    registry
        .define_native(class, "+", Some(1), native(|_, _, args, _| Ok(args[0].clone())))
        .unwrap();
    let site = site("+", SiteKind::Operator(BinaryOp::Add), &registry, &DispatchConfig::default());
    let v = site.invoke_fixnum(&mut ctx, &Value::new_object(class), 9).unwrap();
    assert_eq!(v.as_fixnum(), Some(9));
    // Integer stays fast.
    assert!(!registry.operator_redefined(ClassId::INTEGER, BinaryOp::Add));
}

// =============================================================================
// respond_to? Predicate Cache
// =============================================================================

#[test]
fn test_respond_to_answer_is_cached_until_redefinition() {
    let (registry, mut ctx) = setup();
    let class = registry.define_class("Duck", ClassId::OBJECT).unwrap();
    let site = site("respond_to?", SiteKind::RespondTo(Arc::from("foo")), &registry, &DispatchConfig::default());
    let duck = Value::new_object(class);

    assert!(!site.probe(&mut ctx, &duck).unwrap());
    let before = registry.lookup_count();
    for _ in 0..20 {
        assert!(!site.probe(&mut ctx, &duck).unwrap());
    }
    assert_eq!(registry.lookup_count(), before);

    registry
        .define_native(class, "foo", Some(0), native(|_, _, _, _| Ok(Value::Nil)))
        .unwrap();
    assert!(site.probe(&mut ctx, &duck).unwrap());
    assert_eq!(registry.lookup_count() - before, 1);
}

#[test]
fn test_guest_respond_to_missing_disables_negative_caching() {
    let (registry, mut ctx) = setup();
    let class = registry.define_class("Proxy", ClassId::OBJECT).unwrap();
    let asked = Arc::new(AtomicU64::new(0));
    let counter = asked.clone();
    registry
        .define_native(
            class,
            garnet_runtime::builtins::RESPOND_TO_MISSING,
            Some(2),
            native(move |_, _, _, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(Value::Bool(false))
            }),
        )
        .unwrap();
    let site = site("respond_to?", SiteKind::RespondTo(Arc::from("foo")), &registry, &DispatchConfig::default());
    let proxy = Value::new_object(class);
    for _ in 0..3 {
        assert!(!site.probe(&mut ctx, &proxy).unwrap());
    }
    assert_eq!(asked.load(Ordering::Relaxed), 3);
}

#[test]
fn test_guest_respond_to_is_called_every_time() {
    let (registry, mut ctx) = setup();
    let class = registry.define_class("Liar", ClassId::OBJECT).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    registry
        .define_native(
            class,
            garnet_runtime::builtins::RESPOND_TO,
            None,
            native(move |_, _, _, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(Value::Bool(true))
            }),
        )
        .unwrap();
    let site = site("respond_to?", SiteKind::RespondTo(Arc::from("foo")), &registry, &DispatchConfig::default());
    let liar = Value::new_object(class);
    for _ in 0..4 {
        assert!(site.probe(&mut ctx, &liar).unwrap());
    }
    assert_eq!(calls.load(Ordering::Relaxed), 4);
}

#[test]
fn test_private_method_answer_depends_on_include_all() {
    let (registry, mut ctx) = setup();
    let class = registry.define_class("Vault", ClassId::OBJECT).unwrap();
    registry
        .define_method(
            class,
            garnet_runtime::MethodEntry::new(
                "foo",
                class,
                garnet_runtime::Visibility::Private,
                garnet_runtime::MethodFlags::empty(),
                Some(0),
                native(|_, _, _, _| Ok(Value::Nil)),
            ),
        )
        .unwrap();
    let site = site("respond_to?", SiteKind::RespondTo(Arc::from("foo")), &registry, &DispatchConfig::default());
    let vault = Value::new_object(class);

    let public_only = site.invoke(&mut ctx, &vault, &[Value::symbol("foo")]).unwrap();
    assert!(!public_only.is_truthy());
    let all = site
        .invoke(&mut ctx, &vault, &[Value::symbol("foo"), Value::Bool(true)])
        .unwrap();
    assert!(all.is_truthy());
}

#[test]
fn test_disabled_predicate_cache_always_resolves() {
    let (registry, mut ctx) = setup();
    let config = DispatchConfig {
        cache_respond_to: false,
        ..DispatchConfig::default()
    };
    let site = site("respond_to?", SiteKind::RespondTo(Arc::from("zero?")), &registry, &config);
    let before = registry.lookup_count();
    for _ in 0..5 {
        assert!(site.probe(&mut ctx, &Value::Fixnum(0)).unwrap());
    }
    assert_eq!(registry.lookup_count() - before, 5);
}
