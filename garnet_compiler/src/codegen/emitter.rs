//! Unit-level emission state.
//!
//! Owns the side tables shared by every function of a unit: call-site
//! descriptors, deduplicated dispatch helpers and literal slots.

use super::host::Immediate;
use super::unit::{CompiledUnit, HelperDescriptor, LiteralDescriptor, SiteDescriptor, SiteKind};
use super::HostFunction;
use garnet_ir::{CallType, Literal};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide helper serial. Units compiled in parallel never collide.
static NEXT_HELPER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HelperKey {
    method: Arc<str>,
    arity: usize,
    has_closure: bool,
    call_type: CallType,
}

/// How a literal is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralRef {
    Immediate(Immediate),
    Slot(u32),
}

/// Side tables for one unit under construction.
#[derive(Debug)]
pub struct UnitEmitter {
    name: Arc<str>,
    functions: Vec<HostFunction>,
    sites: Vec<SiteDescriptor>,
    helpers: Vec<HelperDescriptor>,
    helper_map: FxHashMap<HelperKey, u32>,
    literals: Vec<LiteralDescriptor>,
    literal_map: FxHashMap<String, u32>,
}

impl UnitEmitter {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            functions: Vec::new(),
            sites: Vec::new(),
            helpers: Vec::new(),
            helper_map: FxHashMap::default(),
            literals: Vec::new(),
            literal_map: FxHashMap::default(),
        }
    }

    // =========================================================================
    // Helpers and sites
    // =========================================================================

    /// The helper for `(method, arity, has_closure, call_type)`, created on
    /// first use.
    pub fn helper(&mut self, method: &Arc<str>, arity: usize, has_closure: bool, call_type: CallType) -> u32 {
        let key = HelperKey {
            method: method.clone(),
            arity,
            has_closure,
            call_type,
        };
        if let Some(&index) = self.helper_map.get(&key) {
            return index;
        }
        let serial = NEXT_HELPER.fetch_add(1, Ordering::Relaxed);
        let symbol = format!(
            "dispatch:{method}:{arity}:{}:{call_type:?}#{serial}",
            if has_closure { "b" } else { "-" }
        );
        let index = self.helpers.len() as u32;
        self.helpers.push(HelperDescriptor {
            symbol: Arc::from(symbol),
            method: method.clone(),
            arity,
            has_closure,
            call_type,
        });
        self.helper_map.insert(key, index);
        index
    }

    /// Register a call site. Every call expression gets its own site.
    pub fn site(&mut self, name: &Arc<str>, kind: SiteKind, arity: usize, has_closure: bool) -> u32 {
        let helper = self.helper(name, arity, has_closure, kind.call_type());
        let index = self.sites.len() as u32;
        self.sites.push(SiteDescriptor {
            name: name.clone(),
            kind,
            arity,
            has_closure,
            helper,
        });
        index
    }

    // =========================================================================
    // Literals
    // =========================================================================

    /// Slot (or immediate) for `literal`. Equal literals share a slot;
    /// slots are numbered in first-seen order.
    pub fn literal(&mut self, literal: &Literal) -> LiteralRef {
        let key = match literal_key(literal) {
            Ok(key) => key,
            Err(imm) => return LiteralRef::Immediate(imm),
        };
        if let Some(&slot) = self.literal_map.get(&key) {
            return LiteralRef::Slot(slot);
        }
        let slot = self.literals.len() as u32;
        self.literals.push(LiteralDescriptor {
            key: key.clone(),
            value: literal.clone(),
        });
        self.literal_map.insert(key, slot);
        LiteralRef::Slot(slot)
    }

    pub fn add_function(&mut self, function: HostFunction) {
        self.functions.push(function);
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    pub fn finish(self) -> CompiledUnit {
        CompiledUnit {
            name: self.name,
            functions: self.functions,
            sites: self.sites,
            helpers: self.helpers,
            literals: self.literals,
        }
    }
}

/// Structural key of a literal, or the immediate it lowers to.
///
/// Variable-length payloads are length-prefixed so that no two distinct
/// literals share a key.
fn literal_key(literal: &Literal) -> Result<String, Immediate> {
    let mut key = String::new();
    // Writing to a String cannot fail.
    let _ = match literal {
        Literal::Nil => return Err(Immediate::Nil),
        Literal::True => return Err(Immediate::True),
        Literal::False => return Err(Immediate::False),
        Literal::Fixnum(n) => write!(key, "fixnum:{n}"),
        Literal::Float(x) => write!(key, "float:{:016x}", x.to_bits()),
        Literal::Symbol(s) => write!(key, "symbol:{}:{s}", s.len()),
        Literal::Str(s) => write!(key, "string:{}:{s}", s.len()),
        Literal::Regexp { source, options } => write!(key, "regexp:{}:{source}:{options}", source.len()),
    };
    Ok(key)
}
