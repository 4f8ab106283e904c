//! Code generation.
//!
//! Instrumented scopes are lowered to [`HostFunction`]s; the unit-level
//! [`UnitEmitter`] collects the call-site, helper and literal tables that
//! the runtime materializes when the unit is loaded.

mod emitter;
mod host;
mod lower;
mod unit;

pub use emitter::{LiteralRef, UnitEmitter};
pub use host::{HostFunction, HostOp, Immediate, Reg, RescueEntry};
pub use lower::lower_scope;
pub use unit::{CompiledUnit, HelperDescriptor, LiteralDescriptor, SiteDescriptor, SiteKind};
