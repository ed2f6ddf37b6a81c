//! Fitch parsimony on bit-packed state sets.
//!
//! Partial parsimony is cached per half-edge: the packed state set of every
//! pattern for the subtree behind the edge, plus the subtree's cumulative
//! score in the trailing block slot. A cache-free recursive scorer over
//! integer masks serves as the verification oracle and drives stepwise
//! addition, where the topology changes faster than caches pay off.

use physalia_core::{PhysaliaError, Result};

use crate::alignment::state_mask;
use crate::phylo::PhyloTree;
use crate::stateset;
use crate::tree::{NodeId, PARS_VALID};

impl PhyloTree {
    /// Fitch parsimony score of the tree, evaluated at the entry edge.
    pub fn compute_parsimony(&mut self) -> Result<u32> {
        self.ensure_initialized()?;
        let entry = self.require_entry()?;
        let peer = self.tree.node(entry).neighbors[0].peer();
        self.compute_parsimony_branch(entry, peer)
    }

    /// Fitch parsimony score evaluated at the edge `(dad, node)`.
    pub fn compute_parsimony_branch(&mut self, dad: NodeId, node: NodeId) -> Result<u32> {
        self.ensure_initialized()?;
        // Keep the leaf (if any) on the dad side.
        let (dad, node) = if self.tree.is_leaf(node) {
            (node, dad)
        } else {
            (dad, node)
        };
        self.compute_partial_parsimony(dad, node)?;
        self.compute_partial_parsimony(node, dad)?;

        let nstates = self.aln.num_states();
        let es = self.pars_entry;
        let fwd = self.pars_range(self.tree.neighbor(dad, node).slot.unwrap());
        let back = self.pars_range(self.tree.neighbor(node, dad).slot.unwrap());
        let fwd_block = &self.partial_pars[fwd];
        let back_block = &self.partial_pars[back.clone()];

        let mut score = fwd_block[self.pars_block - 1] + back_block[self.pars_block - 1];
        let mut entry_buf = vec![0u64; es];
        for (ptn, pattern) in (0..self.aln.size()).map(|p| (p, self.aln.pattern(p))) {
            for w in 0..es {
                entry_buf[w] = fwd_block[ptn * es + w] & back_block[ptn * es + w];
            }
            if stateset::is_empty(&entry_buf, nstates) {
                score += pattern.frequency as u64;
            }
        }
        Ok(score as u32)
    }

    /// Compute (if stale) the partial parsimony behind the half-edge
    /// `(dad -> node)`.
    fn compute_partial_parsimony(&mut self, dad: NodeId, node: NodeId) -> Result<()> {
        if self.tree.neighbor(dad, node).is_valid(PARS_VALID) {
            return Ok(());
        }
        let nstates = self.aln.num_states();
        let nptn = self.aln.size();
        let es = self.pars_entry;
        let slot = self.tree.neighbor(dad, node).slot.ok_or_else(|| {
            PhysaliaError::InvariantViolated("half-edge without a cache slot".into())
        })?;

        if self.tree.is_leaf(node) {
            let seq = self.tree.node(node).id;
            if seq >= self.aln.n_seq() {
                return Err(PhysaliaError::InvalidInput(format!(
                    "leaf id {} has no sequence in the alignment",
                    seq
                )));
            }
            let range = self.pars_range(slot);
            let block = &mut self.partial_pars[range];
            let mut entry = vec![0u64; es];
            for ptn in 0..nptn {
                let state = self.aln.state(ptn, seq);
                entry.fill(0);
                entry[0] = state_mask(state, nstates);
                stateset::set_entry(block, nstates, ptn, &entry);
            }
            block[self.pars_block - 1] = 0;
        } else {
            let children = self.tree.adjacent(node, Some(dad));
            if children.len() != 2 {
                return Err(PhysaliaError::InvalidInput(format!(
                    "node {} has degree {}, parsimony requires a binary tree",
                    node,
                    children.len() + 1
                )));
            }
            for &child in &children {
                self.compute_partial_parsimony(node, child)?;
            }
            let c1 = {
                let r = self.pars_range(self.tree.neighbor(node, children[0]).slot.unwrap());
                self.partial_pars[r].to_vec()
            };
            let c2 = {
                let r = self.pars_range(self.tree.neighbor(node, children[1]).slot.unwrap());
                self.partial_pars[r].to_vec()
            };
            let range = self.pars_range(slot);
            let block = &mut self.partial_pars[range];
            for w in 0..self.pars_block - 1 {
                block[w] = c1[w] & c2[w];
            }
            let mut score = c1[self.pars_block - 1] + c2[self.pars_block - 1];
            let mut inter = vec![0u64; es];
            let mut u1 = vec![0u64; es];
            let mut u2 = vec![0u64; es];
            let mut merged = vec![0u64; es];
            for ptn in 0..nptn {
                stateset::get_entry(block, nstates, ptn, &mut inter);
                if stateset::is_empty(&inter, nstates) {
                    stateset::get_entry(&c1, nstates, ptn, &mut u1);
                    stateset::get_entry(&c2, nstates, ptn, &mut u2);
                    stateset::union(&u1, &u2, &mut merged);
                    stateset::set_entry(block, nstates, ptn, &merged);
                    score += self.aln.pattern(ptn).frequency as u64;
                }
            }
            block[self.pars_block - 1] = score;
        }
        self.tree.neighbor_mut(dad, node).computed |= PARS_VALID;
        Ok(())
    }

    /// Cache-free reference parsimony: recursive Fitch over integer masks,
    /// frequency-weighted, constant patterns skipped.
    pub fn compute_parsimony_score(&self) -> Result<u32> {
        let entry = self.require_entry()?;
        for id in self.tree.internal_nodes() {
            if self.tree.node(id).degree() > 3 {
                return Err(PhysaliaError::InvalidInput(
                    "parsimony does not work with a multifurcating tree".into(),
                ));
            }
        }
        let mut total = 0u32;
        for ptn in 0..self.aln.size() {
            if self.aln.pattern(ptn).is_const {
                continue;
            }
            let (score, _) = self.parsimony_rec(ptn, entry, None);
            total += score * self.aln.pattern(ptn).frequency;
        }
        Ok(total)
    }

    fn parsimony_rec(&self, ptn: usize, node: NodeId, dad: Option<NodeId>) -> (u32, u64) {
        let nstates = self.aln.num_states();
        let full = (1u64 << nstates) - 1;
        let mut score = 0u32;
        let mut states = 0u64;
        if self.tree.is_leaf(node) {
            states = state_mask(self.aln.state(ptn, self.tree.node(node).id), nstates);
        }
        if !self.tree.is_leaf(node) || dad.is_none() {
            let mut union_states = states;
            let mut intersect = if states != 0 { states } else { full };
            for child in self.tree.adjacent(node, dad) {
                let (child_score, child_states) = self.parsimony_rec(ptn, child, Some(node));
                union_states |= child_states;
                intersect &= child_states;
                score += child_score;
            }
            if intersect != 0 {
                states = intersect;
            } else {
                states = union_states;
                score += 1;
            }
        }
        (score, states)
    }
}
