//! Liveness and exit analysis.
//!
//! Standard backward dataflow over block-level use/def sets. Exception
//! edges are treated like any other edge, so a variable read by a rescuer
//! is live out of every block it protects.
//!
//! Results are cached on the scope's compilation record and must be
//! recomputed after any pass that rewrites the graph.

use crate::arena::{BitSet, SecondaryMap};
use crate::cfg::{BasicBlock, BlockId, Cfg, EdgeKind};
use crate::operand::Variable;
use rustc_hash::FxHashMap;

/// Per-block live variable sets plus the blocks that leave the scope.
#[derive(Debug, Clone)]
pub struct LivenessInfo {
    variables: Vec<Variable>,
    live_in: SecondaryMap<BasicBlock, BitSet>,
    live_out: SecondaryMap<BasicBlock, BitSet>,
    exits: Vec<BlockId>,
    iterations: usize,
}

impl LivenessInfo {
    fn index_of(&self, var: &Variable) -> Option<usize> {
        self.variables.iter().position(|v| v == var)
    }

    pub fn is_live_in(&self, block: BlockId, var: &Variable) -> bool {
        self.index_of(var)
            .is_some_and(|i| self.live_in.get(block).is_some_and(|set| set.contains(i)))
    }

    pub fn is_live_out(&self, block: BlockId, var: &Variable) -> bool {
        self.index_of(var)
            .is_some_and(|i| self.live_out.get(block).is_some_and(|set| set.contains(i)))
    }

    /// Variables live on entry to `block`.
    pub fn live_in(&self, block: BlockId) -> Vec<&Variable> {
        self.live_in
            .get(block)
            .map(|set| set.iter().map(|i| &self.variables[i]).collect())
            .unwrap_or_default()
    }

    /// Blocks with an edge leaving the scope, in layout order.
    #[inline]
    pub fn exit_blocks(&self) -> &[BlockId] {
        &self.exits
    }

    #[inline]
    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Fixpoint iterations taken.
    #[inline]
    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

/// Compute liveness for `cfg`.
pub fn compute_liveness(cfg: &Cfg) -> LivenessInfo {
    let mut index: FxHashMap<Variable, usize> = FxHashMap::default();
    let mut variables = Vec::new();
    let mut intern = |var: Variable| -> usize {
        *index.entry(var.clone()).or_insert_with(|| {
            variables.push(var);
            variables.len() - 1
        })
    };

    // Block-local use (upward exposed) and def sets.
    let count = cfg.block_count();
    let mut uses: SecondaryMap<BasicBlock, BitSet> = SecondaryMap::with_len(count);
    let mut defs: SecondaryMap<BasicBlock, BitSet> = SecondaryMap::with_len(count);
    for &id in cfg.layout() {
        let mut use_set = BitSet::new();
        let mut def_set = BitSet::new();
        for instr in cfg.block(id).instrs() {
            for var in instr.used_variables() {
                let i = intern(var);
                if !def_set.contains(i) {
                    use_set.insert(i);
                }
            }
            if let Some(var) = instr.defined() {
                def_set.insert(intern(var));
            }
        }
        uses.set(id, use_set);
        defs.set(id, def_set);
    }

    let mut live_in: SecondaryMap<BasicBlock, BitSet> = SecondaryMap::with_len(count);
    let mut live_out: SecondaryMap<BasicBlock, BitSet> = SecondaryMap::with_len(count);
    let mut order = cfg.reverse_postorder();
    order.reverse();

    let mut iterations = 0;
    let mut changed = true;
    while changed {
        changed = false;
        iterations += 1;
        for &id in &order {
            let mut out = BitSet::new();
            for edge in cfg.block(id).successors() {
                out.union_with(&live_in[edge.block]);
            }
            let mut inn = out.clone();
            for i in defs[id].iter() {
                inn.remove(i);
            }
            inn.union_with(&uses[id]);
            if inn != live_in[id] {
                live_in.set(id, inn);
                changed = true;
            }
            live_out.set(id, out);
        }
    }

    let exits = cfg
        .layout()
        .iter()
        .copied()
        .filter(|&id| {
            cfg.block(id)
                .successors()
                .iter()
                .any(|e| e.kind == EdgeKind::Exit)
        })
        .collect();

    tracing::trace!(variables = variables.len(), iterations, "liveness computed");
    LivenessInfo {
        variables,
        live_in,
        live_out,
        exits,
        iterations,
    }
}
