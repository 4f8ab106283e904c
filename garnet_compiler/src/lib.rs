//! Garnet compiler.
//!
//! Turns scope trees into loadable units:
//!
//! - [`passes`]: the pass framework and the call-protocol instrumentation
//!   pass, which makes frame and binding management explicit
//! - [`codegen`]: lowering to host ops with per-unit call-site, helper and
//!   literal tables
//! - [`pipeline`]: the driver, including parallel compilation of
//!   independent units

#![deny(unsafe_op_in_unsafe_fn)]

pub mod codegen;
pub mod config;
pub mod error;
pub mod passes;
pub mod pipeline;

pub use codegen::{CompiledUnit, HostFunction, HostOp, SiteDescriptor, SiteKind};
pub use config::{CompilerConfig, MAX_ARGUMENTS};
pub use error::{CompileError, CompileResult};
pub use passes::{CallProtocolPass, CompilerPass, PassManager, PassOutcome};
pub use pipeline::{compile_unit, compile_units, UnitSource};
