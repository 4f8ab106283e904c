//! Garnet VM.
//!
//! Runs compiled units against a method registry:
//!
//! - [`callsite`]: inline-cached call sites, the operator fast path and
//!   the `respond_to?` predicate cache
//! - [`literal`]: lazily materialized literal slots
//! - [`unit`]: loaded units owning their site and literal tables
//! - [`interpreter`]: execution of lowered host ops
//! - [`config`]: dispatch tuning, from code or the environment
//!
//! # Call-site states
//!
//! ```text
//!            lookup (cacheable)           class miss x tolerance
//!   Empty ───────────────────► Monomorphic ───────────────────► Megamorphic
//!     ▲                          │                                 (sticky)
//!     └── stale + uncacheable ───┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod callsite;
pub mod config;
pub mod interpreter;
pub mod literal;
pub mod unit;

pub use callsite::{
    CacheEntry, CacheLookup, CachingCallSite, CallSite, DispatchHelper, InlineCache, OperatorCallSite,
    RespondToCallSite, SiteClassification, SiteState, SiteStatsSnapshot, UnitStats,
};
pub use config::{DispatchConfig, FastOps, DEFAULT_MISS_TOLERANCE};
pub use interpreter::{define_compiled_method, run_closure, run_method};
pub use literal::{LiteralSlot, LiteralTable};
pub use unit::LoadedUnit;
