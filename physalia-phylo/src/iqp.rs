//! Important-Quartet-Puzzling perturbation and the IQPNNI outer loop.
//!
//! One perturbation step deletes each leaf with probability `p_delete`
//! (keeping at least three), then reinserts every deleted leaf at the edge
//! preferred by quartet votes: for each internal node of the reduced tree,
//! up to `k_represent` representative leaves per subtree form quartets with
//! the deleted leaf, and each quartet awards one bonus to every edge of the
//! subtree it votes for. The leaf is reinserted by bisecting a
//! highest-bonus edge (ties broken at random).
//!
//! The outer loop keeps the best tree seen as a Newick snapshot and rolls
//! back to it whenever an iteration fails to improve.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};
use physalia_core::Result;

use crate::config::SearchConfig;
use crate::newick;
use crate::phylo::PhyloTree;
use crate::rng::Xorshift64;
use crate::tree::NodeId;
use crate::TOL_LIKELIHOOD;

fn edge_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

impl PhyloTree {
    /// The iterated local search: perturb with IQP, reoptimize, keep the
    /// best tree seen. Returns the best log-likelihood.
    ///
    /// `dist_mat` is the `N x N` pairwise distance matrix indexed by taxon
    /// id; `tree_file`, when given, receives the best tree whenever it
    /// improves.
    pub fn do_iqpnni(
        &mut self,
        cfg: &SearchConfig,
        dist_mat: &[f64],
        tree_file: Option<&Path>,
    ) -> Result<f64> {
        self.optimize_by_newton = cfg.optimize_by_newton;
        self.discard_saturated_site = cfg.discard_saturated_site;
        self.ensure_initialized()?;
        let mut rng = Xorshift64::new(cfg.seed);
        let mut best_score = self.compute_likelihood(None)?;
        let mut best_tree = newick::write(&self.tree);
        if let Some(path) = tree_file {
            newick::write_to_file(&self.tree, path)?;
        }

        for iteration in 1..=cfg.iqpnni_iterations {
            let cur_score = self.do_iqp(cfg, dist_mat, &mut rng)?;
            info!("iteration {} / log-likelihood: {}", iteration, cur_score);
            if cur_score > best_score + 1e-6 {
                info!("better tree found: {}", cur_score);
                best_score = cur_score;
                best_tree = newick::write(&self.tree);
                if let Some(path) = tree_file {
                    newick::write_to_file(&self.tree, path)?;
                }
            } else {
                self.rollback(&best_tree)?;
            }
        }
        Ok(best_score)
    }

    /// One perturbation step: delete, reinsert by quartet vote, reoptimize
    /// branches, run NNI to a local optimum.
    pub fn do_iqp(
        &mut self,
        cfg: &SearchConfig,
        dist_mat: &[f64],
        rng: &mut Xorshift64,
    ) -> Result<f64> {
        let deleted = self.delete_leaves(cfg.p_delete, rng);
        debug!("{} leaves deleted", deleted.len());
        self.reinsert_leaves(&deleted, cfg, dist_mat, rng);
        if let Some(leaf0) = self.tree.find_leaf_by_id(0) {
            self.tree.set_entry(leaf0);
        }
        self.initialize_partial_lh()?;
        let tree_lh = self.optimize_all_branches(100, TOL_LIKELIHOOD)?;
        debug!("IQP likelihood: {}", tree_lh);
        if cfg.simple_nni {
            self.optimize_nni()
        } else {
            self.optimize_fast_nni(cfg)
        }
    }

    /// Randomly delete leaves with probability `p_delete`, never going
    /// below three. Returns `(leaf, detached internal node)` pairs.
    pub(crate) fn delete_leaves(
        &mut self,
        p_delete: f64,
        rng: &mut Xorshift64,
    ) -> Vec<(NodeId, NodeId)> {
        let taxa = self.tree.taxa();
        let mut deleted = Vec::new();
        let mut remaining = taxa.len();
        let mut new_entry = None;
        for taxon in taxa {
            if rng.next_f64() < p_delete && remaining > 3 {
                let adjacent = self.tree.node(taxon).neighbors[0].peer();
                deleted.push((taxon, adjacent));
                self.tree.delete_leaf(taxon);
                remaining -= 1;
            } else if new_entry.is_none() {
                new_entry = Some(taxon);
            }
        }
        if let Some(entry) = new_entry {
            self.tree.set_entry(entry);
        }
        deleted
    }

    /// Reinsert deleted leaves one at a time at their best-bonus edges.
    pub(crate) fn reinsert_leaves(
        &mut self,
        deleted: &[(NodeId, NodeId)],
        cfg: &SearchConfig,
        dist_mat: &[f64],
        rng: &mut Xorshift64,
    ) {
        for &(leaf, adjacent) in deleted {
            debug!("reinserting {:?}", self.tree.node(leaf).name);
            let mut bonus: HashMap<(NodeId, NodeId), f64> = HashMap::new();
            for internal in self.tree.internal_nodes() {
                self.assess_quartets(internal, leaf, cfg.k_represent, dist_mat, rng, &mut bonus);
            }
            let edges = self.tree.edges();
            let best = edges
                .iter()
                .map(|&(a, b)| bonus.get(&edge_key(a, b)).copied().unwrap_or(0.0))
                .fold(0.0f64, f64::max);
            let best_edges: Vec<(NodeId, NodeId)> = edges
                .into_iter()
                .filter(|&(a, b)| bonus.get(&edge_key(a, b)).copied().unwrap_or(0.0) == best)
                .collect();
            let pick = (rng.next_f64() * best_edges.len() as f64) as usize;
            let (dad, node) = best_edges[pick.min(best_edges.len() - 1)];
            if best_edges.len() > 1 {
                debug!(
                    "{} branches share the best bonus, nr. {} chosen",
                    best_edges.len(),
                    pick
                );
            }
            self.tree.reinsert_leaf(leaf, adjacent, node, dad);
        }
    }

    /// Quartet votes at one internal node of the reduced tree.
    fn assess_quartets(
        &self,
        cur_root: NodeId,
        del_leaf: NodeId,
        k_represent: usize,
        dist_mat: &[f64],
        rng: &mut Xorshift64,
        bonus: &mut HashMap<(NodeId, NodeId), f64>,
    ) {
        let subtrees = self.tree.adjacent(cur_root, None);
        debug_assert_eq!(subtrees.len(), 3);
        let reps: Vec<Vec<NodeId>> = subtrees
            .iter()
            .map(|&peer| self.find_represent_leaves(k_represent, peer, cur_root, rng))
            .collect();
        for &l0 in &reps[0] {
            for &l1 in &reps[1] {
                for &l2 in &reps[2] {
                    let winner = self.assess_quartet(l0, l1, l2, del_leaf, dist_mat);
                    self.raise_bonus(bonus, subtrees[winner], cur_root);
                }
            }
        }
    }

    /// Decide which of three subtrees the deleted leaf belongs with, by
    /// the four-point condition on pairwise distances.
    fn assess_quartet(
        &self,
        leaf0: NodeId,
        leaf1: NodeId,
        leaf2: NodeId,
        del_leaf: NodeId,
        dist_mat: &[f64],
    ) -> usize {
        let n = self.aln.n_seq();
        let id = |leaf: NodeId| self.tree.node(leaf).id;
        let d = |a: NodeId, b: NodeId| dist_mat[id(a) * n + id(b)];
        let dist0 = d(leaf0, del_leaf) + d(leaf1, leaf2);
        let dist1 = d(leaf1, del_leaf) + d(leaf0, leaf2);
        let dist2 = d(leaf2, del_leaf) + d(leaf0, leaf1);
        if dist0 < dist1 && dist0 < dist2 {
            0
        } else if dist1 < dist2 {
            1
        } else {
            2
        }
    }

    /// Award one bonus to every edge of the subtree behind `(node, dad)`.
    fn raise_bonus(
        &self,
        bonus: &mut HashMap<(NodeId, NodeId), f64>,
        node: NodeId,
        dad: NodeId,
    ) {
        let mut stack = vec![(node, dad)];
        while let Some((cur, from)) = stack.pop() {
            *bonus.entry(edge_key(cur, from)).or_insert(0.0) += 1.0;
            for peer in self.tree.adjacent(cur, Some(from)) {
                stack.push((peer, cur));
            }
        }
    }

    /// Representative leaves of the subtree behind `(node, dad)`: the up to
    /// `k_represent` leaves closest in edge count, ties thinned at random.
    fn find_represent_leaves(
        &self,
        k_represent: usize,
        node: NodeId,
        dad: NodeId,
        rng: &mut Xorshift64,
    ) -> Vec<NodeId> {
        let mut leaves: Vec<(usize, NodeId)> = self
            .tree
            .leaf_depths(node, dad)
            .into_iter()
            .map(|(id, depth)| (depth, id))
            .collect();
        leaves.sort_by_key(|&(h, id)| (h, id));
        if leaves.len() <= k_represent {
            return leaves.into_iter().map(|(_, id)| id).collect();
        }
        let admit_height = leaves[k_represent].0;
        let below: Vec<NodeId> = leaves
            .iter()
            .filter(|&&(h, _)| h < admit_height)
            .map(|&(_, id)| id)
            .collect();
        let mut ties: Vec<NodeId> = leaves
            .iter()
            .filter(|&&(h, _)| h == admit_height)
            .map(|&(_, id)| id)
            .collect();
        let needed = k_represent - below.len();
        // Bounded random thinning of the boundary height class.
        for i in (1..ties.len()).rev() {
            let j = rng.next_usize(i + 1);
            ties.swap(i, j);
        }
        ties.truncate(needed);
        let mut result = below;
        result.extend(ties);
        result
    }
}
