//! Compiler configuration.

/// Largest argument count a call may pass.
pub const MAX_ARGUMENTS: usize = 250;

/// Options for unit compilation.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Calls with more arguments than this are rejected.
    pub max_arguments: usize,
    /// Re-validate every graph after instrumentation.
    pub validate_cfg: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_arguments: MAX_ARGUMENTS,
            validate_cfg: cfg!(debug_assertions),
        }
    }
}

impl CompilerConfig {
    /// Always validate; used by tests and tooling.
    pub fn strict() -> Self {
        Self {
            validate_cfg: true,
            ..Default::default()
        }
    }
}
