//! Nearest-Neighbor Interchange search.
//!
//! An NNI at an internal edge `(node1, node2)` exchanges one neighbor of
//! `node1` with one neighbor of `node2`; each internal edge admits exactly
//! two such swaps. The neighbor *entries* move between the endpoints,
//! carrying their subtree caches with them, so only the center edge needs
//! recomputation when a swap is evaluated.
//!
//! Two searches are provided: a first-improvement sweep (parsimony and
//! likelihood flavors), and the fast lambda-scheduled variant that
//! evaluates every internal edge against the same starting tree, applies a
//! prefix of the non-conflicting improving moves at once, and rolls the
//! whole iteration back when the combined result is worse.

use std::collections::HashMap;

use log::{debug, info};
use physalia_core::Result;

use crate::config::SearchConfig;
use crate::phylo::PhyloTree;
use crate::tree::NodeId;
use crate::TOL_LIKELIHOOD;

/// One NNI move: swap the neighbor entries at the given positions of the
/// two endpoints of an internal edge.
///
/// Positions stay valid across other, endpoint-disjoint NNI moves, which is
/// what the non-conflict rule guarantees.
#[derive(Debug, Clone)]
pub struct NniMove {
    pub node1: NodeId,
    pub node2: NodeId,
    pub node1_nei_idx: usize,
    pub node2_nei_idx: usize,
    /// Post-swap log-likelihood with the center branch re-optimized.
    pub score: f64,
}

/// Key an undirected edge by its node pair.
fn edge_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

impl PhyloTree {
    /// Exchange the neighbor entries and retarget the two backward
    /// half-edges. Applying the same swap twice is the identity.
    pub(crate) fn nni_swap_entries(&mut self, node1: NodeId, i1: usize, node2: NodeId, i2: usize) {
        let a = self.tree.node(node1).neighbors[i1].peer();
        let b = self.tree.node(node2).neighbors[i2].peer();
        self.tree.swap_neighbor_entries(node1, i1, node2, i2);
        self.tree.update_neighbor(a, node1, node2, None);
        self.tree.update_neighbor(b, node2, node1, None);
    }

    /// Apply an NNI move and invalidate every cache whose subtree changed.
    pub fn do_nni(&mut self, mv: &NniMove) {
        self.nni_swap_entries(mv.node1, mv.node1_nei_idx, mv.node2, mv.node2_nei_idx);
        self.tree.clear_edge(mv.node1, mv.node2);
        self.tree.clear_reverse_partial(mv.node1, mv.node2);
        self.tree.clear_reverse_partial(mv.node2, mv.node1);
    }

    // ------------------------------------------------------------------
    // Simple first-improvement NNI
    // ------------------------------------------------------------------

    /// First-improvement NNI under parsimony: keep the first swap that
    /// lowers the score, restart, stop when a full sweep finds nothing.
    pub fn search_nni_parsimony(&mut self) -> Result<u32> {
        info!("search with nearest neighbor interchange (parsimony)");
        let mut cur_score = self.compute_parsimony_score()?;
        loop {
            let entry = self.require_entry()?;
            let score = self.search_nni_pars_from(cur_score, entry, None)?;
            if score >= cur_score {
                break;
            }
            info!("better parsimony score found: {}", score);
            cur_score = score;
        }
        self.tree.clear_all_partial();
        Ok(cur_score)
    }

    fn search_nni_pars_from(
        &mut self,
        cur_score: u32,
        node: NodeId,
        dad: Option<NodeId>,
    ) -> Result<u32> {
        if let Some(dad) = dad {
            if !self.tree.is_leaf(node) && !self.tree.is_leaf(dad) {
                let score = self.swap_nni_parsimony(cur_score, node, dad)?;
                if score < cur_score {
                    return Ok(score);
                }
            }
        }
        for peer in self.tree.adjacent(node, dad) {
            let score = self.search_nni_pars_from(cur_score, peer, Some(node))?;
            if score < cur_score {
                return Ok(score);
            }
        }
        Ok(cur_score)
    }

    fn swap_nni_parsimony(&mut self, cur_score: u32, node1: NodeId, node2: NodeId) -> Result<u32> {
        let i1 = self.first_neighbor_index(node1, node2);
        for i2 in self.neighbor_indices(node2, node1) {
            self.nni_swap_entries(node1, i1, node2, i2);
            let score = self.compute_parsimony_score()?;
            if score < cur_score {
                return Ok(score);
            }
            self.nni_swap_entries(node1, i1, node2, i2);
        }
        Ok(cur_score)
    }

    /// First-improvement NNI under likelihood with per-sweep branch
    /// optimization. Returns the final log-likelihood.
    pub fn optimize_nni(&mut self) -> Result<f64> {
        self.ensure_initialized()?;
        let mut cur_score = self.compute_likelihood(None)?;
        for round in 0..100 {
            let entry = self.require_entry()?;
            let score = self.optimize_nni_from(cur_score, entry, None)?;
            if score <= cur_score {
                break;
            }
            debug!("NNI round {}: {}", round + 1, score);
            cur_score = self.optimize_all_branches_from(entry, None)?;
        }
        self.optimize_all_branches(100, TOL_LIKELIHOOD)
    }

    fn optimize_nni_from(
        &mut self,
        cur_score: f64,
        node: NodeId,
        dad: Option<NodeId>,
    ) -> Result<f64> {
        if let Some(dad) = dad {
            if !self.tree.is_leaf(node) && !self.tree.is_leaf(dad) {
                let score = self.swap_nni_branch(cur_score, node, dad)?;
                if score > cur_score {
                    return Ok(score);
                }
            }
        }
        for peer in self.tree.adjacent(node, dad) {
            let score = self.optimize_nni_from(cur_score, peer, Some(node))?;
            if score > cur_score {
                return Ok(score);
            }
        }
        Ok(cur_score)
    }

    /// Try both NNI swaps at the edge `(node1, node2)`, keeping the first
    /// that improves `cur_score` after re-optimizing the center branch.
    fn swap_nni_branch(&mut self, cur_score: f64, node1: NodeId, node2: NodeId) -> Result<f64> {
        let i12 = self.tree.neighbor_index(node1, node2).unwrap();
        let i21 = self.tree.neighbor_index(node2, node1).unwrap();
        let center_len = self.tree.node(node1).neighbors[i12].length;
        let saved1 = self.stash_cache(node1, i12);
        let saved2 = self.stash_cache(node2, i21);

        let i1 = self.first_neighbor_index(node1, node2);
        let mut result = cur_score;
        for i2 in self.neighbor_indices(node2, node1) {
            self.nni_swap_entries(node1, i1, node2, i2);
            self.tree.clear_edge(node1, node2);
            let score = self.optimize_one_branch(node1, node2, false)?;
            if score > result {
                self.tree.clear_reverse_partial(node1, node2);
                self.tree.clear_reverse_partial(node2, node1);
                debug!(
                    "swapped neighbors of {} and {}, score {}",
                    node1, node2, score
                );
                result = score;
                break;
            }
            // Swap back; subtree entries carry their lengths with them.
            self.nni_swap_entries(node1, i1, node2, i2);
            self.tree.set_branch_length(node1, node2, center_len);
        }
        self.restore_cache(&saved2, false, false);
        self.restore_cache(&saved1, false, false);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Fast lambda-scheduled NNI
    // ------------------------------------------------------------------

    /// Fast NNI: evaluate every internal edge against the same starting
    /// tree, apply the top `ceil(lambda * K)` non-conflicting improving
    /// moves at once, and roll back (halving lambda) when the combined
    /// tree is worse.
    pub fn optimize_fast_nni(&mut self, cfg: &SearchConfig) -> Result<f64> {
        self.ensure_initialized()?;
        let mut lambda = 0.75;
        let mut applied_total = 0usize;
        loop {
            let snapshot = self.tree.clone();
            let old_score = self.compute_likelihood(None)?;

            let mut opt_lens: HashMap<(NodeId, NodeId), f64> = HashMap::new();
            let mut moves = self.generate_positive_nni_moves(&mut opt_lens)?;
            if moves.is_empty() {
                break;
            }
            moves.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            // Greedy endpoint-disjoint selection: the chosen moves commute.
            let mut chosen: Vec<NniMove> = Vec::new();
            for mv in moves {
                let conflicts = chosen.iter().any(|m| {
                    m.node1 == mv.node1
                        || m.node1 == mv.node2
                        || m.node2 == mv.node1
                        || m.node2 == mv.node2
                });
                if !conflicts {
                    chosen.push(mv);
                }
            }

            let mut n_apply = (chosen.len() as f64 * lambda).ceil() as usize;
            if n_apply < 1 {
                n_apply = 1;
                lambda = 0.0;
            }
            debug!(
                "{} non-conflicting NNIs, applying {} (lambda {})",
                chosen.len(),
                n_apply,
                lambda
            );

            let applied: Vec<NniMove> = chosen[..n_apply.min(chosen.len())].to_vec();
            for mv in &applied {
                // Commit the center branch to its cached optimum, then swap.
                self.apply_branch_length_change(mv.node1, mv.node2, &opt_lens, lambda, false);
                self.do_nni(mv);
            }
            applied_total += applied.len();

            let new_score = if cfg.phyml_opt {
                self.apply_all_branch_length_changes(&applied, &opt_lens, lambda);
                self.compute_likelihood(None)?
            } else {
                self.optimize_all_branches(1, TOL_LIKELIHOOD)?
            };

            if new_score < old_score {
                info!(
                    "tree dropped from {} to {} after {} NNIs, halving lambda",
                    old_score,
                    new_score,
                    applied.len()
                );
                self.tree = snapshot;
                self.tree.clear_all_partial();
                applied_total -= applied.len();
                if lambda == 0.0 {
                    // Even the single best move failed; nothing left to try.
                    break;
                }
                lambda /= 2.0;
            } else {
                debug!(
                    "new tree score {} (+{}) with {} NNIs",
                    new_score,
                    new_score - old_score,
                    applied.len()
                );
                lambda = 0.75;
            }
        }
        debug!("{} NNIs applied in total", applied_total);
        self.optimize_all_branches(1, TOL_LIKELIHOOD)
    }

    /// Evaluate every edge against the current tree: improving moves for
    /// internal edges, optimal lengths for every edge (keyed by node pair).
    fn generate_positive_nni_moves(
        &mut self,
        opt_lens: &mut HashMap<(NodeId, NodeId), f64>,
    ) -> Result<Vec<NniMove>> {
        let mut moves = Vec::new();
        for (dad, node) in self.tree.edges() {
            if !self.tree.is_leaf(node) && !self.tree.is_leaf(dad) {
                if let Some(mv) = self.best_nni_move_for_branch(node, dad, opt_lens)? {
                    moves.push(mv);
                }
            } else {
                let (opt, _) = self.branch_length_optimum(node, dad)?;
                opt_lens.insert(edge_key(node, dad), opt);
            }
        }
        Ok(moves)
    }

    /// Evaluate the two NNIs at an internal edge. Records the optimal
    /// center length of the winning configuration (or of the current
    /// topology if no swap improves) and returns the best improving move.
    fn best_nni_move_for_branch(
        &mut self,
        node1: NodeId,
        node2: NodeId,
        opt_lens: &mut HashMap<(NodeId, NodeId), f64>,
    ) -> Result<Option<NniMove>> {
        let i12 = self.tree.neighbor_index(node1, node2).unwrap();
        let i21 = self.tree.neighbor_index(node2, node1).unwrap();
        let len0 = self.tree.node(node1).neighbors[i12].length;

        let cur_score = self.optimize_one_branch(node1, node2, true)?;
        let len_current_opt = self.tree.node(node1).neighbors[i12].length;
        let mut best_score = cur_score;
        let mut chosen_len = len_current_opt;
        let mut best: Option<NniMove> = None;

        let saved1 = self.stash_cache(node1, i12);
        let saved2 = self.stash_cache(node2, i21);
        let i1 = self.first_neighbor_index(node1, node2);

        for i2 in self.neighbor_indices(node2, node1) {
            self.nni_swap_entries(node1, i1, node2, i2);
            self.tree.clear_edge(node1, node2);
            let score = self.optimize_one_branch(node1, node2, false)?;
            if score > best_score {
                best_score = score;
                chosen_len = self.tree.node(node1).neighbors[i12].length;
                best = Some(NniMove {
                    node1,
                    node2,
                    node1_nei_idx: i1,
                    node2_nei_idx: i2,
                    score,
                });
            }
            self.nni_swap_entries(node1, i1, node2, i2);
            self.tree.set_branch_length(node1, node2, len0);
        }

        self.restore_cache(&saved2, false, false);
        self.restore_cache(&saved1, false, false);
        opt_lens.insert(edge_key(node1, node2), chosen_len);
        Ok(best)
    }

    /// Set an edge toward its recorded optimum: all the way for an applied
    /// NNI center, blended by `lambda` for every other branch.
    fn apply_branch_length_change(
        &mut self,
        node1: NodeId,
        node2: NodeId,
        opt_lens: &HashMap<(NodeId, NodeId), f64>,
        lambda: f64,
        non_nni_branch: bool,
    ) {
        let current_len = self.tree.branch_length(node1, node2);
        let opt_len = *opt_lens.get(&edge_key(node1, node2)).unwrap_or(&current_len);
        let new_len = if non_nni_branch {
            current_len + lambda * (opt_len - current_len)
        } else {
            opt_len
        };
        self.tree.set_branch_length(node1, node2, new_len);
        self.tree.clear_reverse_partial(node1, node2);
        self.tree.clear_reverse_partial(node2, node1);
    }

    /// The phyml-style simultaneous update: blend every branch that was not
    /// an applied NNI center toward its recorded optimum.
    fn apply_all_branch_length_changes(
        &mut self,
        applied: &[NniMove],
        opt_lens: &HashMap<(NodeId, NodeId), f64>,
        lambda: f64,
    ) {
        for (dad, node) in self.tree.edges() {
            let used = applied
                .iter()
                .any(|m| edge_key(m.node1, m.node2) == edge_key(dad, node));
            if used {
                continue;
            }
            self.apply_branch_length_change(dad, node, opt_lens, lambda, true);
        }
    }

    // ------------------------------------------------------------------

    fn first_neighbor_index(&self, node: NodeId, excluding: NodeId) -> usize {
        self.tree
            .node(node)
            .neighbors
            .iter()
            .position(|n| n.node.is_some() && n.node != Some(excluding))
            .expect("internal node with no free neighbor")
    }

    fn neighbor_indices(&self, node: NodeId, excluding: NodeId) -> Vec<usize> {
        self.tree
            .node(node)
            .neighbors
            .iter()
            .enumerate()
            .filter(|(_, n)| n.node.is_some() && n.node != Some(excluding))
            .map(|(i, _)| i)
            .collect()
    }
}
