//! Garnet runtime object model.
//!
//! The pieces of the object model that call-protocol compilation and
//! inline-cached dispatch depend on:
//!
//! - **Values**: immediates plus reference-counted heap values
//! - **Classes**: fixed built-in ids, guest classes, concurrent method tables
//! - **Registry**: superclass-chain lookup and the global redefinition version
//! - **Built-ins**: numeric operators and the default `respond_to?`
//! - **Thread context**: frame and binding stacks

#![deny(unsafe_op_in_unsafe_fn)]

pub mod builtins;
pub mod class;
pub mod context;
pub mod error;
pub mod method;
pub mod ops;
pub mod registry;
pub mod value;

pub use class::{ClassFlags, ClassId, RClass};
pub use context::{Binding, BindingRef, Frame, FrameKind, ThreadContext};
pub use error::{RuntimeError, RuntimeErrorKind, RuntimeResult};
pub use method::{native, MethodEntry, MethodFlags, NativeMethod, Visibility};
pub use ops::BinaryOp;
pub use registry::{MethodRegistry, Resolution, METHOD_MISSING};
pub use value::{Object, Regexp, Symbol, Value};
