//! Unit compilation pipeline.
//!
//! ```text
//!   ScopeTree ──► flags ──► call protocol ──► liveness ──► validate ──► lower ──► CompiledUnit
//! ```
//!
//! A unit compiles on one thread. Independent units compile in parallel
//! with [`compile_units`].

use crate::codegen::{lower_scope, CompiledUnit, UnitEmitter};
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::passes::PassManager;
use garnet_ir::{compute_liveness, compute_scope_flags, ScopeId, ScopeTree, Variable};
use rayon::prelude::*;

/// Source of one unit: its name and its scopes.
#[derive(Debug)]
pub struct UnitSource {
    pub name: String,
    pub tree: ScopeTree,
}

impl UnitSource {
    pub fn new(name: impl Into<String>, tree: ScopeTree) -> Self {
        Self {
            name: name.into(),
            tree,
        }
    }
}

/// Instrument and lower every scope of `tree`.
///
/// Any error aborts the whole unit.
#[tracing::instrument(skip(tree, config), fields(scopes = tree.len()))]
pub fn compile_unit(name: &str, tree: &mut ScopeTree, config: &CompilerConfig) -> CompileResult<CompiledUnit> {
    let result = compile_inner(name, tree, config);
    if let Err(err) = &result {
        tracing::warn!(unit = name, %err, "compilation failed");
    }
    result
}

fn compile_inner(name: &str, tree: &mut ScopeTree, config: &CompilerConfig) -> CompileResult<CompiledUnit> {
    let roots = tree.roots().to_vec();
    for &root in &roots {
        compute_scope_flags(tree, root);
    }

    let ids: Vec<ScopeId> = tree.ids().collect();
    let mut passes = PassManager::new();
    for &id in &ids {
        passes.run(tree, id)?;
        let liveness = compute_liveness(tree.get(id).cfg());
        tree.get_mut(id).set_liveness(liveness);
        if config.validate_cfg {
            validate_scope(tree, id)?;
        }
    }

    let mut emitter = UnitEmitter::new(name);
    for &id in &ids {
        let function = lower_scope(tree, id, &mut emitter, config)?;
        emitter.add_function(function);
    }

    for stat in passes.pass_stats() {
        tracing::debug!(pass = stat.name, runs = stat.runs, changes = stat.changes, time = ?stat.time, "pass stats");
    }
    let unit = emitter.finish();
    tracing::debug!(
        functions = unit.functions.len(),
        sites = unit.sites.len(),
        helpers = unit.helpers.len(),
        literals = unit.literals.len(),
        "unit compiled"
    );
    Ok(unit)
}

/// Structural checks on an instrumented scope.
fn validate_scope(tree: &ScopeTree, id: ScopeId) -> CompileResult<()> {
    let scope = tree.get(id);
    let cfg = scope.cfg();
    cfg.validate()?;

    if let Some(liveness) = scope.liveness() {
        for var in liveness.live_in(cfg.entry()) {
            if let Variable::Temp(temp) = var {
                return Err(CompileError::UndefinedTemp {
                    scope: scope.name().to_string(),
                    temp: *temp,
                });
            }
        }
    }
    Ok(())
}

/// Compile independent units in parallel. Results keep input order.
pub fn compile_units(sources: Vec<UnitSource>, config: &CompilerConfig) -> Vec<CompileResult<CompiledUnit>> {
    sources
        .into_par_iter()
        .map(|mut source| compile_unit(&source.name, &mut source.tree, config))
        .collect()
}
