//! Control-flow graphs.
//!
//! Blocks live in an arena and are linked by typed edges. The graph also
//! keeps a layout order (used for fall-through when lowering) and a label
//! map so instructions can name blocks without holding ids.
//!
//! # Shape
//!
//! ```text
//!            ┌────────┐
//!            │ entry  │
//!            └───┬────┘
//!                │ fall-through
//!            ┌───▼────┐   exception   ┌──────────────────┐
//!            │ body … ├──────────────►│ global ensure    │
//!            └───┬────┘               │ recv_exc; throw  │
//!                │ exit               └────────┬─────────┘
//!            ┌───▼────┐         exit           │
//!            │ exit   │◄───────────────────────┘
//!            └────────┘
//! ```

use crate::arena::{Arena, BitSet, Id};
use crate::error::{IrError, IrResult};
use crate::instr::{Instr, Label};
use crate::operand::{Operand, TempId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt::Write;

/// Block identifier.
pub type BlockId = Id<BasicBlock>;

// =============================================================================
// Edges
// =============================================================================

/// Why control can move between two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Falls off the end of the source block.
    FallThrough,
    /// Explicit jump or branch.
    Jump,
    /// Raised exception unwinding to a rescuer.
    Exception,
    /// Leaves the scope (return, or the ensure block rethrowing).
    Exit,
}

/// One end of an edge, stored on both blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub block: BlockId,
    pub kind: EdgeKind,
}

// =============================================================================
// Basic Block
// =============================================================================

/// A labelled, ordered run of instructions.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    label: Label,
    instrs: Vec<Instr>,
    is_exit: bool,
    rescuer: Option<BlockId>,
    succs: SmallVec<[Edge; 2]>,
    preds: SmallVec<[Edge; 2]>,
}

impl BasicBlock {
    fn new(label: Label) -> Self {
        Self {
            label,
            instrs: Vec::new(),
            is_exit: false,
            rescuer: None,
            succs: SmallVec::new(),
            preds: SmallVec::new(),
        }
    }

    #[inline]
    pub fn label(&self) -> Label {
        self.label
    }

    #[inline]
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    #[inline]
    pub fn instrs_mut(&mut self) -> &mut Vec<Instr> {
        &mut self.instrs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    #[inline]
    pub fn last(&self) -> Option<&Instr> {
        self.instrs.last()
    }

    /// Whether any instruction in the block may raise.
    pub fn can_raise(&self) -> bool {
        self.instrs.iter().any(Instr::can_raise)
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        self.is_exit
    }

    #[inline]
    pub fn rescuer(&self) -> Option<BlockId> {
        self.rescuer
    }

    #[inline]
    pub fn successors(&self) -> &[Edge] {
        &self.succs
    }

    #[inline]
    pub fn predecessors(&self) -> &[Edge] {
        &self.preds
    }
}

// =============================================================================
// CFG
// =============================================================================

/// A scope's control-flow graph.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Arena<BasicBlock>,
    layout: Vec<BlockId>,
    labels: FxHashMap<Label, BlockId>,
    entry: BlockId,
    exit: BlockId,
    geb: Option<BlockId>,
}

impl Cfg {
    /// Create a graph with an empty entry block and an empty exit block.
    pub fn new(entry_label: Label, exit_label: Label) -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(BasicBlock::new(entry_label));
        let mut exit_block = BasicBlock::new(exit_label);
        exit_block.is_exit = true;
        let exit = blocks.alloc(exit_block);

        let mut labels = FxHashMap::default();
        labels.insert(entry_label, entry);
        labels.insert(exit_label, exit);

        Self {
            blocks,
            layout: vec![entry, exit],
            labels,
            entry,
            exit,
            geb: None,
        }
    }

    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    #[inline]
    pub fn exit(&self) -> BlockId {
        self.exit
    }

    /// The global ensure block, if installed.
    #[inline]
    pub fn global_ensure_block(&self) -> Option<BlockId> {
        self.geb
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block ids in layout order.
    #[inline]
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn block_by_label(&self, label: Label) -> IrResult<BlockId> {
        self.labels.get(&label).copied().ok_or(IrError::UnknownLabel(label))
    }

    /// Blocks flagged as scope exits.
    pub fn exit_blocks(&self) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&id| self.blocks[id].is_exit)
            .collect()
    }

    // =========================================================================
    // Construction
    // =========================================================================

    fn register(&mut self, label: Label, block: BasicBlock) -> IrResult<BlockId> {
        if self.labels.contains_key(&label) {
            return Err(IrError::DuplicateLabel(label));
        }
        let id = self.blocks.alloc(block);
        self.labels.insert(label, id);
        Ok(id)
    }

    /// Add a block laid out just before the exit block.
    pub fn add_block(&mut self, label: Label) -> IrResult<BlockId> {
        let id = self.register(label, BasicBlock::new(label))?;
        let at = self
            .layout
            .iter()
            .position(|&b| b == self.exit)
            .unwrap_or(self.layout.len());
        self.layout.insert(at, id);
        Ok(id)
    }

    /// Add a block laid out immediately after `after`.
    pub fn insert_block_after(&mut self, after: BlockId, label: Label) -> IrResult<BlockId> {
        let id = self.register(label, BasicBlock::new(label))?;
        let at = self
            .layout
            .iter()
            .position(|&b| b == after)
            .map_or(self.layout.len(), |i| i + 1);
        self.layout.insert(at, id);
        Ok(id)
    }

    /// Flag `id` as an exit block.
    pub fn mark_exit(&mut self, id: BlockId) {
        self.blocks[id].is_exit = true;
    }

    /// Add an edge. Re-adding an existing edge with the same kind is a no-op.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        let edge = Edge { block: to, kind };
        if self.blocks[from].succs.contains(&edge) {
            return;
        }
        self.blocks[from].succs.push(edge);
        self.blocks[to].preds.push(Edge { block: from, kind });
    }

    /// Remove every edge from `from` to `to`, returning the kind of the
    /// first one removed.
    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) -> Option<EdgeKind> {
        let kind = self.blocks[from]
            .succs
            .iter()
            .find(|e| e.block == to)
            .map(|e| e.kind)?;
        self.blocks[from].succs.retain(|e| e.block != to);
        self.blocks[to].preds.retain(|e| e.block != from);
        Some(kind)
    }

    /// First successor of `id` reached through an edge of `kind`.
    pub fn outgoing_of_kind(&self, id: BlockId, kind: EdgeKind) -> Option<BlockId> {
        self.blocks[id]
            .succs
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.block)
    }

    /// Make `rescuer` the exception target of `block`.
    pub fn set_rescuer(&mut self, block: BlockId, rescuer: BlockId) {
        self.blocks[block].rescuer = Some(rescuer);
        self.add_edge(block, rescuer, EdgeKind::Exception);
    }

    /// Create the global ensure block, `%exc = recv_exception; throw %exc`.
    ///
    /// Every raising block without a rescuer gets an exception edge to it,
    /// and it exits the scope. Returns the existing block if one is
    /// already installed.
    pub fn install_global_ensure_block(&mut self, label: Label, exception: TempId) -> IrResult<BlockId> {
        if let Some(geb) = self.geb {
            return Ok(geb);
        }
        let geb = self.add_block(label)?;
        self.blocks[geb].instrs = vec![
            Instr::ReceiveException { dst: exception },
            Instr::Throw {
                value: Operand::Temp(exception),
            },
        ];

        let candidates: Vec<BlockId> = self.layout.clone();
        for id in candidates {
            let block = &self.blocks[id];
            if id != geb && !block.is_exit && block.rescuer.is_none() && block.can_raise() {
                self.set_rescuer(id, geb);
            }
        }
        self.add_edge(geb, self.exit, EdgeKind::Exit);
        self.geb = Some(geb);
        tracing::trace!(?label, "installed global ensure block");
        Ok(geb)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Blocks reachable from the entry along any edge kind.
    pub fn reachable(&self) -> BitSet {
        let mut seen = BitSet::with_capacity(self.blocks.len());
        let mut stack = vec![self.entry];
        seen.insert(self.entry.as_usize());
        while let Some(id) = stack.pop() {
            for edge in &self.blocks[id].succs {
                if seen.insert(edge.block.as_usize()) {
                    stack.push(edge.block);
                }
            }
        }
        seen
    }

    /// Reverse postorder over reachable blocks, starting at the entry.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        // (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry.as_usize());

        while let Some((id, next)) = stack.pop() {
            let succs = &self.blocks[id].succs;
            if let Some(edge) = succs.get(next) {
                stack.push((id, next + 1));
                if visited.insert(edge.block.as_usize()) {
                    stack.push((edge.block, 0));
                }
            } else {
                postorder.push(id);
            }
        }
        postorder.reverse();
        postorder
    }

    /// Check structural invariants.
    ///
    /// - control transfers only end blocks
    /// - every laid-out block except the entry is reachable
    /// - with a global ensure block, every raising block has a rescuer
    /// - every branch target names a block
    ///
    /// The global ensure block itself is exempt from the last two block
    /// checks: it rethrows out of the scope, and has no predecessors when
    /// nothing in the scope can raise.
    pub fn validate(&self) -> IrResult<()> {
        let reachable = self.reachable();
        for &id in &self.layout {
            let block = &self.blocks[id];
            let is_geb = Some(id) == self.geb;
            let count = block.instrs.len();
            for (index, instr) in block.instrs.iter().enumerate() {
                if instr.transfers_control() && index + 1 != count {
                    return Err(IrError::MisplacedControlTransfer { label: block.label, index });
                }
                for target in instr.targets() {
                    self.block_by_label(target)?;
                }
            }
            if is_geb {
                continue;
            }
            if id != self.entry && !block.is_exit && !reachable.contains(id.as_usize()) {
                return Err(IrError::UnreachableBlock(block.label));
            }
            if self.geb.is_some() && !block.is_exit && block.rescuer.is_none() && block.can_raise() {
                return Err(IrError::MissingRescuer(block.label));
            }
        }
        Ok(())
    }

    /// Human-readable listing, one block per paragraph.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for &id in &self.layout {
            let block = &self.blocks[id];
            let _ = write!(out, "{:?}:", block.label);
            if id == self.entry {
                out.push_str(" ; entry");
            }
            if Some(id) == self.geb {
                out.push_str(" ; global ensure");
            }
            if block.is_exit {
                out.push_str(" ; exit");
            }
            if let Some(rescuer) = block.rescuer {
                let _ = write!(out, " ; rescue {:?}", self.blocks[rescuer].label);
            }
            out.push('\n');
            for instr in &block.instrs {
                let _ = writeln!(out, "    {instr}");
            }
        }
        out
    }
}
