//! Compiler pass framework.
//!
//! A pass rewrites one scope of a [`ScopeTree`]. Passes that cannot be
//! undone report it through [`CompilerPass::invalidate`]; the manager then
//! refuses to apply them a second time instead of silently skipping.

mod call_protocol;

pub use call_protocol::CallProtocolPass;

use crate::error::{CompileError, CompileResult};
use garnet_ir::{Scope, ScopeId, ScopeTree};
use std::time::{Duration, Instant};

// =============================================================================
// Pass Trait
// =============================================================================

/// What a pass did to a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The graph was rewritten.
    Changed,
    /// The pass ran but the graph needed nothing.
    Unchanged,
    /// The scope kind is not handled by this pass.
    Skipped,
}

/// A transformation over a single scope.
pub trait CompilerPass: Send {
    /// Human-readable name.
    fn label(&self) -> &'static str;

    /// Short identifier for logs.
    fn short_label(&self) -> &'static str;

    /// Whether the pass has already been applied to `scope`.
    fn already_applied(&self, _scope: &Scope) -> bool {
        false
    }

    /// Undo the effects of an earlier run so the pass can run again.
    /// Returns false if that is impossible.
    fn invalidate(&self, _scope: &mut Scope) -> bool {
        true
    }

    /// Run on `scope` within `tree`.
    fn run(&mut self, tree: &mut ScopeTree, scope: ScopeId) -> CompileResult<PassOutcome>;
}

// =============================================================================
// Pass Manager
// =============================================================================

struct PassEntry {
    pass: Box<dyn CompilerPass>,
    runs: usize,
    changes: usize,
    time: Duration,
}

/// Statistics for one registered pass.
#[derive(Debug, Clone)]
pub struct PassStat {
    pub name: &'static str,
    pub runs: usize,
    pub changes: usize,
    pub time: Duration,
}

/// Runs registered passes, in order, over scopes.
pub struct PassManager {
    passes: Vec<PassEntry>,
}

impl PassManager {
    /// A manager with no passes.
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    /// The standard pass list.
    pub fn new() -> Self {
        let mut manager = Self::empty();
        manager.register(CallProtocolPass::new());
        manager
    }

    pub fn register<P: CompilerPass + 'static>(&mut self, pass: P) {
        self.passes.push(PassEntry {
            pass: Box::new(pass),
            runs: 0,
            changes: 0,
            time: Duration::ZERO,
        });
    }

    /// Run every pass on `scope`.
    pub fn run(&mut self, tree: &mut ScopeTree, scope: ScopeId) -> CompileResult<()> {
        for entry in &mut self.passes {
            let target = tree.get_mut(scope);
            if entry.pass.already_applied(target) && !entry.pass.invalidate(target) {
                return Err(CompileError::PassAlreadyApplied {
                    pass: entry.pass.label(),
                    scope: target.name().to_string(),
                });
            }

            let start = Instant::now();
            let outcome = entry.pass.run(tree, scope)?;
            entry.time += start.elapsed();
            entry.runs += 1;
            if outcome == PassOutcome::Changed {
                entry.changes += 1;
            }
            tracing::trace!(pass = entry.pass.short_label(), ?outcome, "pass finished");
        }
        Ok(())
    }

    pub fn pass_stats(&self) -> Vec<PassStat> {
        self.passes
            .iter()
            .map(|e| PassStat {
                name: e.pass.short_label(),
                runs: e.runs,
                changes: e.changes,
                time: e.time,
            })
            .collect()
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_ir::{Literal, Operand, ScopeBuilder};

    #[test]
    fn test_manager_rejects_second_application() {
        let mut tree = ScopeTree::new();
        let mut b = ScopeBuilder::method("m");
        b.ret(Operand::Literal(Literal::Nil));
        let id = b.finish(&mut tree, None).unwrap();

        let mut manager = PassManager::new();
        manager.run(&mut tree, id).unwrap();
        let err = manager.run(&mut tree, id).unwrap_err();
        assert!(matches!(err, CompileError::PassAlreadyApplied { .. }));

        let stats = manager.pass_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].runs, 1);
    }
}
