//! Compiling independent units on the rayon pool.

use garnet_compiler::{compile_units, CompilerConfig, HostOp, SiteKind, UnitSource};
use garnet_ir::{Literal, Operand, ScopeBuilder, ScopeFlags, ScopeTree, Signature};
use rustc_hash::FxHashSet;

fn unit_source(index: usize) -> UnitSource {
    let mut tree = ScopeTree::new();

    let mut m = ScopeBuilder::method(&format!("method_{index}"));
    m.declare_flags(ScopeFlags::NEEDS_FRAME);
    let sum = m.call(Operand::SelfRef, "+", [Operand::fixnum(index as i64)]);
    let again = m.call(Operand::Temp(sum), "+", [Operand::fixnum(index as i64)]);
    m.call(Operand::SelfRef, "log", [Operand::Literal(Literal::string("done"))]);
    m.call(Operand::SelfRef, "log", [Operand::Literal(Literal::string("done"))]);
    m.ret(Operand::Temp(again));
    let method = m.finish(&mut tree, None).unwrap();

    let mut c = ScopeBuilder::closure(&format!("block_{index}"), Signature::required(1));
    c.ret(Operand::local("acc", 1));
    c.finish(&mut tree, Some(method)).unwrap();

    UnitSource::new(format!("unit_{index}"), tree)
}

#[test]
fn test_parallel_units_compile_independently() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sources: Vec<UnitSource> = (0..32).map(unit_source).collect();
    let results = compile_units(sources, &CompilerConfig::strict());
    assert_eq!(results.len(), 32);

    let mut symbols = FxHashSet::default();
    for (index, result) in results.into_iter().enumerate() {
        let unit = result.unwrap();
        assert_eq!(&*unit.name, format!("unit_{index}"));
        assert_eq!(unit.functions.len(), 2);

        // Two `+` sites share one helper; two `log` sites share another.
        assert_eq!(unit.sites.len(), 4);
        assert_eq!(unit.helpers.len(), 2);
        assert!(matches!(unit.sites[0].kind, SiteKind::Operator(_)));
        assert_eq!(unit.sites[2].helper, unit.sites[3].helper);

        // One shared literal slot for the repeated string.
        assert_eq!(unit.literals.len(), 1);

        let method = unit.function(&format!("method_{index}")).unwrap();
        assert_eq!(method.count_ops(|op| matches!(op, HostOp::InvokeFixnum { .. })), 2);

        for helper in &unit.helpers {
            assert!(symbols.insert(helper.symbol.clone()), "duplicate helper {}", helper.symbol);
        }
    }
}

#[test]
fn test_failed_unit_does_not_affect_others() {
    let good = unit_source(0);

    let mut tree = ScopeTree::new();
    let mut b = ScopeBuilder::method("wide");
    let args: Vec<Operand> = (0..300).map(Operand::fixnum).collect();
    let t = b.call(Operand::SelfRef, "many", args);
    b.ret(Operand::Temp(t));
    b.finish(&mut tree, None).unwrap();
    let bad = UnitSource::new("bad", tree);

    let results = compile_units(vec![good, bad], &CompilerConfig::default());
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}
