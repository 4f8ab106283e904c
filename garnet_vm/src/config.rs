//! Dispatch configuration.
//!
//! Defaults suit general use; every knob can be overridden from the
//! environment:
//!
//! | Variable                   | Meaning                                   |
//! |----------------------------|-------------------------------------------|
//! | `GARNET_IC_MISS_TOLERANCE` | class misses before a site goes megamorphic |
//! | `GARNET_FAST_OPS`          | `off`, `all`, or a comma list like `+,-,<`  |
//! | `GARNET_RESPOND_TO_CACHE`  | `0`/`false` disables the predicate cache   |
//! | `GARNET_IC_STATS`          | `1`/`true` enables per-site counters       |

use garnet_runtime::BinaryOp;

/// Class misses a monomorphic site tolerates before going megamorphic.
pub const DEFAULT_MISS_TOLERANCE: u32 = 8;

bitflags::bitflags! {
    /// Operators with an enabled primitive fast path.
    ///
    /// Bit positions match [`BinaryOp::bit`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FastOps: u32 {
        const ADD = 1 << 0;
        const SUB = 1 << 1;
        const MUL = 1 << 2;
        const DIV = 1 << 3;
        const MOD = 1 << 4;
        const LT = 1 << 5;
        const LE = 1 << 6;
        const GT = 1 << 7;
        const GE = 1 << 8;
        const EQ = 1 << 9;
        const BIT_AND = 1 << 10;
        const BIT_OR = 1 << 11;
        const BIT_XOR = 1 << 12;
        const SHL = 1 << 13;
        const SHR = 1 << 14;
    }
}

impl FastOps {
    #[inline(always)]
    pub const fn from_op(op: BinaryOp) -> Self {
        Self::from_bits_truncate(op.bit())
    }

    #[inline(always)]
    pub const fn contains_op(self, op: BinaryOp) -> bool {
        self.bits() & op.bit() != 0
    }

    /// Parse `off`, `all`, or a comma-separated operator list.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "off" | "none" | "" => Some(Self::empty()),
            "all" => Some(Self::all()),
            list => list.split(',').try_fold(Self::empty(), |acc, name| {
                BinaryOp::from_name(name.trim()).map(|op| acc | Self::from_op(op))
            }),
        }
    }
}

/// Inline cache and call-site behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub miss_tolerance: u32,
    pub fast_ops: FastOps,
    pub cache_respond_to: bool,
    pub collect_stats: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            miss_tolerance: DEFAULT_MISS_TOLERANCE,
            fast_ops: FastOps::all(),
            cache_respond_to: true,
            collect_stats: true,
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `GARNET_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    /// Malformed values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("GARNET_IC_MISS_TOLERANCE") {
            match raw.trim().parse() {
                Ok(n) => config.miss_tolerance = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring malformed GARNET_IC_MISS_TOLERANCE"),
            }
        }
        if let Some(raw) = lookup("GARNET_FAST_OPS") {
            match FastOps::parse(&raw) {
                Some(ops) => config.fast_ops = ops,
                None => tracing::warn!(value = %raw, "ignoring malformed GARNET_FAST_OPS"),
            }
        }
        if let Some(raw) = lookup("GARNET_RESPOND_TO_CACHE") {
            match parse_bool(&raw) {
                Some(on) => config.cache_respond_to = on,
                None => tracing::warn!(value = %raw, "ignoring malformed GARNET_RESPOND_TO_CACHE"),
            }
        }
        if let Some(raw) = lookup("GARNET_IC_STATS") {
            match parse_bool(&raw) {
                Some(on) => config.collect_stats = on,
                None => tracing::warn!(value = %raw, "ignoring malformed GARNET_IC_STATS"),
            }
        }
        config
    }

    pub fn with_miss_tolerance(mut self, tolerance: u32) -> Self {
        self.miss_tolerance = tolerance;
        self
    }

    pub fn with_fast_ops(mut self, ops: FastOps) -> Self {
        self.fast_ops = ops;
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
