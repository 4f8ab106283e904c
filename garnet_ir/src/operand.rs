//! Operands.
//!
//! An operand is a temporary, a named local at some lexical depth, a
//! literal, or `self`. Temporaries are scope-private and never captured by
//! closures, which is what makes them safe to return across the release
//! sequence.

use std::fmt;
use std::sync::Arc;

// =============================================================================
// Variables
// =============================================================================

/// A compiler temporary, numbered per scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(pub u32);

impl fmt::Debug for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%t{}", self.0)
    }
}

/// A guest local variable. `depth` counts enclosing closure levels: 0 is
/// the current scope, 1 the scope the closure was defined in, and so on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LocalVar {
    pub name: Arc<str>,
    pub depth: u32,
}

impl LocalVar {
    pub fn new(name: &str, depth: u32) -> Self {
        Self {
            name: Arc::from(name),
            depth,
        }
    }
}

impl fmt::Debug for LocalVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.depth == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}(^{})", self.name, self.depth)
        }
    }
}

/// A storage location that can be defined by an instruction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Variable {
    Temp(TempId),
    Local(LocalVar),
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Temp(t) => t.fmt(f),
            Variable::Local(l) => l.fmt(f),
        }
    }
}

impl From<TempId> for Variable {
    fn from(t: TempId) -> Self {
        Variable::Temp(t)
    }
}

impl From<LocalVar> for Variable {
    fn from(l: LocalVar) -> Self {
        Variable::Local(l)
    }
}

/// Frame-resident special variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialVar {
    /// Last regexp match (`$~`).
    Backref,
    /// Last line read (`$_`).
    LastLine,
}

// =============================================================================
// Literals
// =============================================================================

/// A literal value embedded in the instruction stream.
#[derive(Clone, PartialEq)]
pub enum Literal {
    Nil,
    True,
    False,
    Fixnum(i64),
    Float(f64),
    Symbol(Arc<str>),
    Str(Arc<str>),
    Regexp { source: Arc<str>, options: u32 },
}

impl Literal {
    /// Whether the materialized value cannot be mutated by guest code.
    /// Strings and regexps are fresh mutable objects.
    #[inline]
    pub fn is_immutable(&self) -> bool {
        !matches!(self, Literal::Str(_) | Literal::Regexp { .. })
    }

    pub fn symbol(name: &str) -> Self {
        Literal::Symbol(Arc::from(name))
    }

    pub fn string(s: &str) -> Self {
        Literal::Str(Arc::from(s))
    }
}

impl fmt::Debug for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => f.write_str("nil"),
            Literal::True => f.write_str("true"),
            Literal::False => f.write_str("false"),
            Literal::Fixnum(n) => write!(f, "{n}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Symbol(s) => write!(f, ":{s}"),
            Literal::Str(s) => write!(f, "{s:?}"),
            Literal::Regexp { source, options } => write!(f, "/{source}/{options}"),
        }
    }
}

// =============================================================================
// Operand
// =============================================================================

/// An instruction input.
#[derive(Clone, PartialEq)]
pub enum Operand {
    Temp(TempId),
    Local(LocalVar),
    Literal(Literal),
    SelfRef,
}

impl Operand {
    #[inline]
    pub fn local(name: &str, depth: u32) -> Self {
        Operand::Local(LocalVar::new(name, depth))
    }

    #[inline]
    pub fn fixnum(n: i64) -> Self {
        Operand::Literal(Literal::Fixnum(n))
    }

    #[inline]
    pub fn symbol(name: &str) -> Self {
        Operand::Literal(Literal::symbol(name))
    }

    /// The variable read by this operand, if any.
    #[inline]
    pub fn as_variable(&self) -> Option<Variable> {
        match self {
            Operand::Temp(t) => Some(Variable::Temp(*t)),
            Operand::Local(l) => Some(Variable::Local(l.clone())),
            Operand::Literal(_) | Operand::SelfRef => None,
        }
    }

    #[inline]
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Operand::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Whether this operand keeps its value across the release sequence.
    ///
    /// Temporaries and immutable literals do. Locals live in the binding
    /// being popped, and `self` or mutable literals are re-evaluated.
    #[inline]
    pub fn survives_release(&self) -> bool {
        match self {
            Operand::Temp(_) => true,
            Operand::Literal(lit) => lit.is_immutable(),
            Operand::Local(_) | Operand::SelfRef => false,
        }
    }
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Temp(t) => t.fmt(f),
            Operand::Local(l) => l.fmt(f),
            Operand::Literal(lit) => lit.fmt(f),
            Operand::SelfRef => f.write_str("self"),
        }
    }
}

impl From<TempId> for Operand {
    fn from(t: TempId) -> Self {
        Operand::Temp(t)
    }
}

impl From<Literal> for Operand {
    fn from(lit: Literal) -> Self {
        Operand::Literal(lit)
    }
}
