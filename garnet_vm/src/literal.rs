//! Per-unit literal slots.
//!
//! Each slot materializes its value the first time any thread reads it.
//! Initialization is racy double-checked: readers that find the slot empty
//! build the value themselves and try to publish it. Losers of the race
//! drop their copy and return the winner's, so every reader of a slot sees
//! the same value and nobody ever sees a partial one.

use garnet_compiler::codegen::LiteralDescriptor;
use garnet_ir::Literal;
use garnet_runtime::{Regexp, RuntimeError, RuntimeResult, Symbol, Value};
use std::sync::{Arc, OnceLock};

/// Build the runtime value for a literal.
pub fn materialize(literal: &Literal) -> Value {
    match literal {
        Literal::Nil => Value::Nil,
        Literal::True => Value::Bool(true),
        Literal::False => Value::Bool(false),
        Literal::Fixnum(n) => Value::Fixnum(*n),
        Literal::Float(x) => Value::Float(*x),
        Literal::Symbol(name) => Value::Symbol(Symbol::new(name.clone())),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Regexp { source, options } => Value::Regexp(Arc::new(Regexp {
            source: source.clone(),
            options: *options,
        })),
    }
}

/// One lazily materialized literal.
#[derive(Debug)]
pub struct LiteralSlot {
    literal: Literal,
    cell: OnceLock<Value>,
}

impl LiteralSlot {
    pub fn new(literal: Literal) -> Self {
        Self {
            literal,
            cell: OnceLock::new(),
        }
    }

    #[inline]
    pub fn literal(&self) -> &Literal {
        &self.literal
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Read the slot, materializing it on first use.
    #[inline]
    pub fn get(&self) -> Value {
        if let Some(value) = self.cell.get() {
            return value.clone();
        }
        self.init_slow()
    }

    #[cold]
    fn init_slow(&self) -> Value {
        let fresh = materialize(&self.literal);
        match self.cell.set(fresh) {
            Ok(()) => tracing::trace!(literal = ?self.literal, "literal slot initialized"),
            Err(_) => tracing::trace!(literal = ?self.literal, "literal slot init lost race"),
        }
        // The cell is set by now, by us or by the racer that beat us.
        match self.cell.get() {
            Some(value) => value.clone(),
            None => materialize(&self.literal),
        }
    }
}

/// All literal slots of a loaded unit, indexed as the compiler numbered them.
#[derive(Debug, Default)]
pub struct LiteralTable {
    slots: Box<[LiteralSlot]>,
}

impl LiteralTable {
    pub fn from_descriptors(descriptors: &[LiteralDescriptor]) -> Self {
        Self {
            slots: descriptors
                .iter()
                .map(|d| LiteralSlot::new(d.value.clone()))
                .collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Value of slot `index`.
    #[inline]
    pub fn get(&self, index: u32) -> RuntimeResult<Value> {
        self.slots
            .get(index as usize)
            .map(LiteralSlot::get)
            .ok_or_else(|| RuntimeError::internal(format!("literal slot {index} out of range")))
    }

    /// Number of slots that have been materialized.
    pub fn initialized(&self) -> usize {
        self.slots.iter().filter(|s| s.is_initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(key: &str, value: Literal) -> LiteralDescriptor {
        LiteralDescriptor {
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_slot_is_lazy() {
        let slot = LiteralSlot::new(Literal::string("hello"));
        assert!(!slot.is_initialized());
        let v = slot.get();
        assert!(slot.is_initialized());
        assert!(matches!(v, Value::Str(ref s) if &**s == "hello"));
    }

    #[test]
    fn test_slot_returns_same_value_every_time() {
        let slot = LiteralSlot::new(Literal::Regexp {
            source: Arc::from("a+b"),
            options: 2,
        });
        let (a, b) = (slot.get(), slot.get());
        match (a, b) {
            (Value::Regexp(a), Value::Regexp(b)) => {
                assert!(Arc::ptr_eq(&a, &b));
                assert_eq!(&*a.source, "a+b");
                assert_eq!(a.options, 2);
            }
            other => panic!("expected regexps, got {other:?}"),
        }
    }

    #[test]
    fn test_racing_readers_agree() {
        let slot = LiteralSlot::new(Literal::string("shared"));
        let values: Vec<Value> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| slot.get())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let first = match &values[0] {
            Value::Str(s) => s.clone(),
            other => panic!("expected string, got {other:?}"),
        };
        for v in &values {
            match v {
                Value::Str(s) => assert!(Arc::ptr_eq(s, &first)),
                other => panic!("expected string, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_table_indexing() {
        let table = LiteralTable::from_descriptors(&[
            descriptor("fixnum:7", Literal::Fixnum(7)),
            descriptor("symbol:3:foo", Literal::symbol("foo")),
        ]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.initialized(), 0);
        assert_eq!(table.get(0).unwrap().as_fixnum(), Some(7));
        assert_eq!(table.get(1).unwrap().as_symbol().map(|s| s.as_str()), Some("foo"));
        assert_eq!(table.initialized(), 2);
        assert!(table.get(2).is_err());
    }
}
