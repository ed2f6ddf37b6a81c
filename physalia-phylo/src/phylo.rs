//! The phylogenetic engine state: tree, alignment, model stack, and the
//! central cache arena.
//!
//! All partial-likelihood, scale-number, and partial-parsimony blocks live
//! in three flat vectors owned here, allocated once per (tree, alignment,
//! rate model) association. Half-edges hold slot indices into the arena;
//! topology mutations move slot assignments around but never free blocks.
//! A small free-list of spare slots serves move evaluation, which needs
//! throwaway blocks while the original caches are kept for restore.

use std::ops::Range;

use log::{info, warn};
use physalia_core::{PhysaliaError, Result, Summarizable};

use crate::alignment::Alignment;
use crate::model::{ModelFactory, SiteRate, SubstModel};
use crate::stateset;
use crate::tree::{NodeId, Tree};

/// Spare arena slots preallocated for move evaluation.
const INITIAL_SCRATCH_SLOTS: usize = 8;

/// Warn when the partial-likelihood arena request exceeds this many bytes.
const MEMORY_WARN_BYTES: usize = 8 << 30;

/// The substitution model, its transition-matrix factory, and the
/// rate-heterogeneity model, as one unit.
///
/// The trait objects are `Send + Sync` so the pairwise-distance loop can
/// fan out across threads.
pub struct ModelStack {
    pub model: Box<dyn SubstModel + Send + Sync>,
    pub factory: Box<dyn ModelFactory + Send + Sync>,
    pub site_rate: Box<dyn SiteRate + Send + Sync>,
}

/// A tree bound to an alignment, with the central cache arena.
pub struct PhyloTree {
    pub tree: Tree,
    pub(crate) aln: Alignment,
    pub(crate) models: Option<ModelStack>,
    /// Use Newton-Raphson instead of Brent for branch optimization.
    pub optimize_by_newton: bool,
    /// Drop patterns whose site-specific rate exceeds `MAX_SITE_RATE`.
    pub discard_saturated_site: bool,

    /// States times rate categories: entries per pattern in a lh block.
    pub(crate) block: usize,
    /// Entries in one partial-likelihood block.
    pub(crate) block_size: usize,
    /// Words per pattern in a parsimony block.
    pub(crate) pars_entry: usize,
    /// Words in one partial-parsimony block (incl. trailing score slot).
    pub(crate) pars_block: usize,

    pub(crate) partial_lh: Vec<f64>,
    pub(crate) scale_num: Vec<i32>,
    pub(crate) partial_pars: Vec<u64>,
    pub(crate) free_slots: Vec<usize>,
    pub(crate) initialized: bool,

    /// The entry edge `(dad, node)` of the last evaluation.
    pub(crate) current_edge: Option<(NodeId, NodeId)>,
    /// Per-pattern log-likelihoods of the last evaluation (unscaled).
    pub(crate) pattern_lh: Vec<f64>,
    /// Pattern frequencies as `f64`, for the hot loops.
    pub(crate) ptn_freq: Vec<f64>,
}

/// Saved cache metadata of one half-edge, with a scratch slot standing in.
pub(crate) struct SavedCache {
    pub node: NodeId,
    pub idx: usize,
    pub slot: Option<usize>,
    pub computed: u8,
    pub scale: f64,
    pub length: f64,
    pub peer: Option<NodeId>,
    pub scratch: usize,
}

impl PhyloTree {
    /// Bind an alignment to an empty tree.
    pub fn new(aln: Alignment) -> Self {
        let ptn_freq = aln
            .pattern_frequencies()
            .iter()
            .map(|&f| f as f64)
            .collect();
        Self {
            tree: Tree::new(),
            aln,
            models: None,
            optimize_by_newton: false,
            discard_saturated_site: true,
            block: 0,
            block_size: 0,
            pars_entry: 0,
            pars_block: 0,
            partial_lh: Vec::new(),
            scale_num: Vec::new(),
            partial_pars: Vec::new(),
            free_slots: Vec::new(),
            initialized: false,
            current_edge: None,
            pattern_lh: Vec::new(),
            ptn_freq,
        }
    }

    /// Bind an alignment to an existing tree, matching leaves by name.
    pub fn with_tree(tree: Tree, aln: Alignment) -> Result<Self> {
        let mut pt = Self::new(aln);
        pt.tree = tree;
        pt.assign_leaf_ids()?;
        Ok(pt)
    }

    /// The bound alignment.
    pub fn aln(&self) -> &Alignment {
        &self.aln
    }

    /// Attach a model stack. Invalidates the arena geometry.
    pub fn set_model(
        &mut self,
        model: Box<dyn SubstModel + Send + Sync>,
        factory: Box<dyn ModelFactory + Send + Sync>,
        site_rate: Box<dyn SiteRate + Send + Sync>,
    ) {
        self.models = Some(ModelStack {
            model,
            factory,
            site_rate,
        });
        self.initialized = false;
    }

    pub(crate) fn require_entry(&self) -> Result<NodeId> {
        self.tree
            .entry()
            .ok_or_else(|| PhysaliaError::InvalidInput("tree has no entry leaf".into()))
    }

    /// Match tree leaves to alignment sequences by name and store the
    /// sequence index as the leaf id. The entry moves to sequence 0's leaf.
    pub fn assign_leaf_ids(&mut self) -> Result<()> {
        for seq in 0..self.aln.n_seq() {
            let name = self.aln.get_seq_name(seq).to_string();
            let Some(leaf) = self.tree.find_leaf_by_name(&name) else {
                return Err(PhysaliaError::InvalidInput(format!(
                    "alignment has a sequence {} which is not in the tree",
                    name
                )));
            };
            self.tree.node_mut(leaf).id = seq;
        }
        if let Some(leaf0) = self.tree.find_leaf_by_id(0) {
            self.tree.set_entry(leaf0);
        }
        Ok(())
    }

    /// Number of rate categories of the attached rate model (1 if none).
    pub(crate) fn ncat(&self) -> usize {
        self.models
            .as_ref()
            .map(|m| m.site_rate.get_n_rate())
            .unwrap_or(1)
    }

    /// Allocate the central arena and assign a cache slot to every
    /// half-edge. Safe to call again after topology surgery.
    pub fn initialize_partial_lh(&mut self) -> Result<()> {
        let entry = self.require_entry()?;
        let nptn = self.aln.size();
        let nstates = self.aln.num_states();
        let nleaf = self.tree.leaf_count();
        if nleaf < 3 {
            return Err(PhysaliaError::InvalidInput(format!(
                "cannot initialize caches for {} taxa (need at least 3)",
                nleaf
            )));
        }

        self.block = nstates * self.ncat();
        self.block_size = nptn * self.block;
        self.pars_entry = stateset::entry_size(nstates);
        self.pars_block = stateset::block_size(nstates, nptn);

        let n_slots = 4 * (nleaf - 1) + INITIAL_SCRATCH_SLOTS;
        let lh_bytes = n_slots * self.block_size * std::mem::size_of::<f64>();
        info!(
            "requiring {:.1} MB memory for partial likelihoods",
            lh_bytes as f64 / (1024.0 * 1024.0)
        );
        if lh_bytes > MEMORY_WARN_BYTES {
            warn!(
                "partial-likelihood arena of {} bytes may exceed physical memory",
                lh_bytes
            );
        }
        self.partial_lh.clear();
        self.partial_lh.resize(n_slots * self.block_size, 0.0);
        self.scale_num.clear();
        self.scale_num.resize(n_slots * nptn, 0);
        self.partial_pars.clear();
        self.partial_pars.resize(n_slots * self.pars_block, 0);
        self.pattern_lh.clear();
        self.pattern_lh.resize(nptn, 0.0);

        // Assign slot pairs along a walk from the entry.
        let mut index = 0usize;
        let mut stack = vec![(entry, None::<NodeId>)];
        while let Some((node, dad)) = stack.pop() {
            for peer in self.tree.adjacent(node, dad) {
                {
                    let nei = self.tree.neighbor_mut(node, peer);
                    nei.slot = Some(index);
                    nei.computed = 0;
                    nei.lh_scale_factor = 0.0;
                }
                {
                    let back = self.tree.neighbor_mut(peer, node);
                    back.slot = Some(index + 1);
                    back.computed = 0;
                    back.lh_scale_factor = 0.0;
                }
                index += 2;
                stack.push((peer, Some(node)));
            }
        }
        debug_assert_eq!(index, 2 * (2 * nleaf - 3));

        self.free_slots = (index..n_slots).collect();
        self.current_edge = None;
        self.initialized = true;
        Ok(())
    }

    pub(crate) fn ensure_initialized(&mut self) -> Result<()> {
        if !self.initialized {
            self.initialize_partial_lh()?;
        }
        Ok(())
    }

    /// Borrow a spare arena slot, growing the arena if the pool is empty.
    pub(crate) fn grab_scratch(&mut self) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            return slot;
        }
        let slot = self.scale_num.len() / self.aln.size().max(1);
        self.partial_lh.resize(self.partial_lh.len() + self.block_size, 0.0);
        self.scale_num.resize(self.scale_num.len() + self.aln.size(), 0);
        self.partial_pars
            .resize(self.partial_pars.len() + self.pars_block, 0);
        slot
    }

    pub(crate) fn lh_range(&self, slot: usize) -> Range<usize> {
        slot * self.block_size..(slot + 1) * self.block_size
    }

    pub(crate) fn scale_range(&self, slot: usize) -> Range<usize> {
        let nptn = self.aln.size();
        slot * nptn..(slot + 1) * nptn
    }

    pub(crate) fn pars_range(&self, slot: usize) -> Range<usize> {
        slot * self.pars_block..(slot + 1) * self.pars_block
    }

    /// Divert the half-edge at `(node, idx)` to a scratch slot, saving its
    /// cache metadata for restore.
    pub(crate) fn stash_cache(&mut self, node: NodeId, idx: usize) -> SavedCache {
        let scratch = self.grab_scratch();
        let nei = &mut self.tree.node_mut(node).neighbors[idx];
        let saved = SavedCache {
            node,
            idx,
            slot: nei.slot,
            computed: nei.computed,
            scale: nei.lh_scale_factor,
            length: nei.length,
            peer: nei.node,
            scratch,
        };
        nei.slot = Some(scratch);
        nei.computed = 0;
        nei.lh_scale_factor = 0.0;
        saved
    }

    /// Put a stashed half-edge back on its original cache block.
    ///
    /// With `restore_link` the opposite endpoint and length are restored
    /// too; with `revalidate` the old validity bits are kept (the block
    /// content was never touched while diverted).
    pub(crate) fn restore_cache(&mut self, saved: &SavedCache, restore_link: bool, revalidate: bool) {
        let nei = &mut self.tree.node_mut(saved.node).neighbors[saved.idx];
        nei.slot = saved.slot;
        nei.computed = if revalidate { saved.computed } else { 0 };
        nei.lh_scale_factor = saved.scale;
        if restore_link {
            nei.node = saved.peer;
            nei.length = saved.length;
        }
        self.free_slots.push(saved.scratch);
    }

    /// Keep the scratch block as the half-edge's permanent cache and
    /// recycle the original slot.
    pub(crate) fn commit_cache(&mut self, saved: &SavedCache) {
        if let Some(orig) = saved.slot {
            self.free_slots.push(orig);
        }
    }

    /// Rebuild the tree from a Newick snapshot and reinitialize caches.
    pub fn rollback(&mut self, newick: &str) -> Result<()> {
        self.tree = crate::newick::parse(newick)?;
        self.assign_leaf_ids()?;
        self.initialize_partial_lh()?;
        Ok(())
    }
}

impl Summarizable for PhyloTree {
    fn summary(&self) -> String {
        format!(
            "PhyloTree: {} taxa, {} patterns, {} rate categories",
            self.tree.leaf_count(),
            self.aln.size(),
            self.ncat()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Jc69, UniformRate};

    fn quartet_tree() -> Tree {
        crate::newick::parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap()
    }

    fn quartet_aln() -> Alignment {
        Alignment::from_sequences(
            &["A", "B", "C", "D"],
            &[b"ACGTACGTAC", b"ACGTACGTAG", b"ACGTACGTTC", b"ACGTACGTTG"],
        )
        .unwrap()
    }

    fn engine() -> PhyloTree {
        let mut pt = PhyloTree::with_tree(quartet_tree(), quartet_aln()).unwrap();
        pt.set_model(
            Box::new(Jc69::new()),
            Box::new(Jc69::new()),
            Box::new(UniformRate::default()),
        );
        pt
    }

    #[test]
    fn leaf_ids_assigned_and_entry_moved() {
        let pt = engine();
        let entry = pt.tree.entry().unwrap();
        assert_eq!(pt.tree.node(entry).id, 0);
        assert_eq!(pt.tree.node(entry).name.as_deref(), Some("A"));
    }

    #[test]
    fn missing_taxon_is_an_error() {
        let tree = crate::newick::parse("((A:0.1,B:0.2):0.3,(C:0.4,X:0.5):0.6);").unwrap();
        assert!(PhyloTree::with_tree(tree, quartet_aln()).is_err());
    }

    #[test]
    fn arena_slots_cover_all_half_edges() {
        let mut pt = engine();
        pt.initialize_partial_lh().unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for (dad, node) in pt.tree.edges() {
            let fwd = pt.tree.neighbor(dad, node).slot.unwrap();
            let back = pt.tree.neighbor(node, dad).slot.unwrap();
            assert!(seen.insert(fwd));
            assert!(seen.insert(back));
        }
        // 2 * (2N - 3) half-edges for N = 4.
        assert_eq!(seen.len(), 10);
        assert!(!pt.free_slots.is_empty());
    }

    #[test]
    fn scratch_slots_cycle() {
        let mut pt = engine();
        pt.initialize_partial_lh().unwrap();
        let free_before = pt.free_slots.len();
        let saved = pt.stash_cache(pt.tree.entry().unwrap(), 0);
        assert_eq!(pt.free_slots.len(), free_before - 1);
        pt.restore_cache(&saved, true, true);
        assert_eq!(pt.free_slots.len(), free_before);
    }

    #[test]
    fn scratch_pool_grows_on_demand() {
        let mut pt = engine();
        pt.initialize_partial_lh().unwrap();
        let mut saved = Vec::new();
        // Exhaust the pool and force one growth step.
        let n = pt.free_slots.len() + 1;
        let entry = pt.tree.entry().unwrap();
        for _ in 0..n {
            saved.push(pt.stash_cache(entry, 0));
        }
        for s in saved.iter().rev() {
            pt.restore_cache(s, true, true);
        }
        assert!(pt.free_slots.len() >= n);
    }

    #[test]
    fn set_model_invalidates_arena() {
        let mut pt = engine();
        pt.initialize_partial_lh().unwrap();
        assert!(pt.initialized);
        pt.set_model(
            Box::new(Jc69::new()),
            Box::new(Jc69::new()),
            Box::new(UniformRate::default()),
        );
        assert!(!pt.initialized);
    }

    #[test]
    fn rollback_restores_topology() {
        let mut pt = engine();
        pt.initialize_partial_lh().unwrap();
        let snapshot = crate::newick::write(&pt.tree);
        let splits = pt.tree.splits();
        // Mutate: lengthen a branch, then roll back.
        let (dad, node) = pt.tree.edges()[0];
        pt.tree.set_branch_length(dad, node, 5.0);
        pt.rollback(&snapshot).unwrap();
        assert_eq!(pt.tree.splits(), splits);
    }
}
