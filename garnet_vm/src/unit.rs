//! Loaded units.
//!
//! A [`LoadedUnit`] is the runtime face of a [`CompiledUnit`]: the shared
//! dispatch helpers are built eagerly, while call sites and literal slots
//! are materialized the first time they run.
//!
//! ```text
//!   CompiledUnit ──load──► LoadedUnit
//!                          ├── helpers   Arc<DispatchHelper> per descriptor
//!                          ├── sites     OnceLock<CallSite>  (first use)
//!                          └── literals  LiteralTable        (first use)
//! ```
//!
//! Operator sites capture the registry's `Integer` and `Float` classes when
//! they materialize, so a loaded unit runs against a single registry.

use crate::callsite::{CallSite, DispatchHelper, UnitStats};
use crate::config::DispatchConfig;
use crate::literal::LiteralTable;
use garnet_compiler::{CompiledUnit, HostFunction};
use garnet_runtime::{MethodRegistry, RuntimeError, RuntimeResult, Value};
use std::sync::{Arc, OnceLock};

/// A compiled unit ready to run.
#[derive(Debug)]
pub struct LoadedUnit {
    unit: CompiledUnit,
    config: DispatchConfig,
    helpers: Box<[Arc<DispatchHelper>]>,
    sites: Box<[OnceLock<CallSite>]>,
    literals: LiteralTable,
}

impl LoadedUnit {
    /// Prepare `unit` for execution.
    pub fn load(unit: CompiledUnit, config: DispatchConfig) -> Arc<Self> {
        let helpers: Box<[_]> = unit
            .helpers
            .iter()
            .map(|d| Arc::new(DispatchHelper::from_descriptor(d)))
            .collect();
        let sites = (0..unit.sites.len()).map(|_| OnceLock::new()).collect();
        let literals = LiteralTable::from_descriptors(&unit.literals);
        tracing::debug!(
            unit = %unit.name,
            functions = unit.functions.len(),
            sites = unit.sites.len(),
            helpers = helpers.len(),
            literals = literals.len(),
            "unit loaded"
        );
        Arc::new(Self {
            unit,
            config,
            helpers,
            sites,
            literals,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.unit.name
    }

    #[inline]
    pub fn compiled(&self) -> &CompiledUnit {
        &self.unit
    }

    #[inline]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn function(&self, name: &str) -> Option<&HostFunction> {
        self.unit.function(name)
    }

    /// Call site `index`, materializing it on first use.
    pub fn site(&self, index: u32, registry: &MethodRegistry) -> RuntimeResult<&CallSite> {
        let slot = self
            .sites
            .get(index as usize)
            .ok_or_else(|| RuntimeError::internal(format!("call site {index} out of range")))?;
        if let Some(site) = slot.get() {
            return Ok(site);
        }
        let descriptor = &self.unit.sites[index as usize];
        let helper = self
            .helpers
            .get(descriptor.helper as usize)
            .ok_or_else(|| RuntimeError::internal(format!("dispatch helper {} out of range", descriptor.helper)))?;
        Ok(slot.get_or_init(|| {
            tracing::trace!(unit = %self.unit.name, site = index, name = %descriptor.name, "call site materialized");
            CallSite::from_descriptor(descriptor, helper.clone(), registry, &self.config)
        }))
    }

    /// Value of literal slot `index`.
    #[inline]
    pub fn literal(&self, index: u32) -> RuntimeResult<Value> {
        self.literals.get(index)
    }

    #[inline]
    pub fn literals(&self) -> &LiteralTable {
        &self.literals
    }

    /// Aggregate site classifications and counters.
    pub fn stats(&self) -> UnitStats {
        let mut stats = UnitStats::default();
        for slot in self.sites.iter() {
            match slot.get() {
                Some(site) => stats.record(site.classification(), site.stats()),
                None => stats.unmaterialized += 1,
            }
        }
        stats
    }
}
