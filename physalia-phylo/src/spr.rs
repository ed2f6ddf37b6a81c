//! Subtree-Pruning-Regrafting with a bounded radius.
//!
//! A prune detaches the subtree behind an edge by splicing its parent node
//! out (the two sibling edges merge, lengths summed). Candidate reinsertion
//! edges are walked outward from the prune site up to `spr_radius` edges
//! away; each trial bisects the candidate edge (`sqrt` of its length on
//! both halves), resets the attachment branch to 0.9, reoptimizes the four
//! surrounding branches, and keeps the first strict improvement. Rejected
//! trials restore lengths and cache assignments.
//!
//! Every evaluated regraft also goes into a bounded buffer of the best
//! moves, kept in descending log-likelihood order; if a whole sweep fails,
//! the buffered candidates are re-assessed with a full branch-length pass.

use log::{debug, info};
use physalia_core::Result;

use crate::phylo::PhyloTree;
use crate::tree::NodeId;
use crate::{MAX_SPR_MOVES, SPR_DEPTH, TOL_LIKELIHOOD};

/// One recorded prune/regraft candidate.
#[derive(Debug, Clone)]
pub struct SprMove {
    pub prune_node: NodeId,
    pub prune_dad: NodeId,
    pub regraft_node: NodeId,
    pub regraft_dad: NodeId,
    pub score: f64,
}

/// Bounded candidate buffer: the top [`MAX_SPR_MOVES`] moves by largest
/// log-likelihood.
#[derive(Debug, Default)]
pub struct SprMoves {
    moves: Vec<SprMove>,
}

impl SprMoves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.moves.clear();
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Insert in descending score order; when full, the worst candidate is
    /// dropped (and worse-than-worst insertions are ignored).
    pub fn add(
        &mut self,
        prune_node: NodeId,
        prune_dad: NodeId,
        regraft_node: NodeId,
        regraft_dad: NodeId,
        score: f64,
    ) {
        if self.moves.len() >= MAX_SPR_MOVES {
            if score <= self.moves.last().map(|m| m.score).unwrap_or(f64::NEG_INFINITY) {
                return;
            }
            self.moves.pop();
        }
        let mv = SprMove {
            prune_node,
            prune_dad,
            regraft_node,
            regraft_dad,
            score,
        };
        let pos = self
            .moves
            .partition_point(|m| m.score >= mv.score);
        self.moves.insert(pos, mv);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SprMove> {
        self.moves.iter()
    }
}

impl PhyloTree {
    /// SPR hill climbing: sweep all prune points, fall back to the buffered
    /// candidates when a sweep fails, stop when neither improves.
    pub fn optimize_spr(&mut self, spr_radius: usize) -> Result<f64> {
        self.ensure_initialized()?;
        let mut cur_score = self.compute_likelihood(None)?;
        let mut spr_moves = SprMoves::new();
        for round in 0..100 {
            spr_moves.clear();
            let entry = self.require_entry()?;
            let start = self.tree.node(entry).neighbors[0].peer();
            let score = self.optimize_spr_from(cur_score, start, None, spr_radius, &mut spr_moves)?;
            self.tree.clear_all_partial();
            if score <= cur_score {
                let candidates: Vec<SprMove> = spr_moves.iter().cloned().collect();
                let mut improved = false;
                for mv in &candidates {
                    let assessed = self.assess_spr_move(cur_score, mv)?;
                    if assessed > cur_score {
                        cur_score = assessed;
                        improved = true;
                        break;
                    }
                }
                if !improved {
                    break;
                }
            } else {
                let polished = self.optimize_all_branches(100, TOL_LIKELIHOOD)?;
                cur_score = polished.max(score);
                info!("SPR round {}: {}", round + 1, cur_score);
            }
        }
        Ok(cur_score)
    }

    /// Walk prune candidates; for each internal `dad`, splice it out and
    /// try regrafting the `(node, dad)` subtree within the radius.
    fn optimize_spr_from(
        &mut self,
        cur_score: f64,
        node: NodeId,
        dad: Option<NodeId>,
        spr_radius: usize,
        moves: &mut SprMoves,
    ) -> Result<f64> {
        if let Some(dad) = dad {
            if !self.tree.is_leaf(dad) {
                let siblings = self.tree.adjacent(dad, Some(node));
                let (s1, s2) = (siblings[0], siblings[1]);
                let s1_len = self.tree.branch_length(dad, s1);
                let s2_len = self.tree.branch_length(dad, s2);
                let dad_i1 = self.tree.neighbor_index(dad, s1).unwrap();
                let dad_i2 = self.tree.neighbor_index(dad, s2).unwrap();

                // Splice dad out: the sibling edges merge.
                let sum_len = s1_len + s2_len;
                self.tree.update_neighbor(s1, dad, s2, Some(sum_len));
                self.tree.update_neighbor(s2, dad, s1, Some(sum_len));
                let sv1 = self.stash_cache(s1, self.tree.neighbor_index(s1, s2).unwrap());
                let sv2 = self.stash_cache(s2, self.tree.neighbor_index(s2, s1).unwrap());

                let mut path: Vec<(NodeId, usize)> = Vec::new();
                let mut found = None;
                'directions: for (origin, other) in [(s1, s2), (s2, s1)] {
                    for peer in self.tree.adjacent(origin, Some(other)) {
                        path.push((origin, self.tree.neighbor_index(origin, other).unwrap()));
                        let score = self.swap_spr(
                            cur_score, 1, node, dad, s1, s2, peer, origin, spr_radius, &mut path,
                            moves,
                        )?;
                        path.pop();
                        if score > cur_score {
                            found = Some(score);
                            break 'directions;
                        }
                    }
                }
                if let Some(score) = found {
                    info!("found a better score by SPR: {}", score);
                    self.commit_cache(&sv1);
                    self.commit_cache(&sv2);
                    return Ok(score);
                }

                // No improvement: reconnect dad between its siblings.
                self.tree.update_neighbor(s1, s2, dad, Some(s1_len));
                self.tree.update_neighbor(s2, s1, dad, Some(s2_len));
                self.tree.update_neighbor_at(dad, dad_i1, Some(s1), Some(s1_len));
                self.tree.update_neighbor_at(dad, dad_i2, Some(s2), Some(s2_len));
                self.restore_cache(&sv1, false, false);
                self.restore_cache(&sv2, false, false);
            }
        }
        for peer in self.tree.adjacent(node, dad) {
            let score = self.optimize_spr_from(cur_score, peer, Some(node), spr_radius, moves)?;
            if score > cur_score {
                return Ok(score);
            }
        }
        Ok(cur_score)
    }

    /// Try regrafting the pruned subtree `(node1, dad1)` onto the edge
    /// `(node2, dad2)`, then keep walking outward.
    #[allow(clippy::too_many_arguments)]
    fn swap_spr(
        &mut self,
        cur_score: f64,
        depth: usize,
        node1: NodeId,
        dad1: NodeId,
        orig_node1: NodeId,
        orig_node2: NodeId,
        node2: NodeId,
        dad2: NodeId,
        spr_radius: usize,
        path: &mut Vec<(NodeId, usize)>,
        moves: &mut SprMoves,
    ) -> Result<f64> {
        let attach_len = self.tree.branch_length(node1, dad1);
        let len2 = self.tree.branch_length(node2, dad2);
        let new_len2 = len2.sqrt();

        if depth >= SPR_DEPTH {
            let i_n2 = self.tree.neighbor_index(node2, dad2).unwrap();
            let i_d2 = self.tree.neighbor_index(dad2, node2).unwrap();

            // Repurpose dad1's two free entries to bisect (node2, dad2).
            let free: Vec<usize> = (0..self.tree.node(dad1).neighbors.len())
                .filter(|&i| self.tree.node(dad1).neighbors[i].node != Some(node1))
                .collect();
            self.tree
                .update_neighbor_at(dad1, free[0], Some(dad2), Some(new_len2));
            self.tree.update_neighbor(dad2, node2, dad1, Some(new_len2));
            self.tree
                .update_neighbor_at(dad1, free[1], Some(node2), Some(new_len2));
            self.tree.update_neighbor(node2, dad2, dad1, Some(new_len2));
            self.tree.node_mut(dad1).neighbors[free[0]].computed = 0;
            self.tree.node_mut(dad1).neighbors[free[1]].computed = 0;
            self.tree.neighbor_mut(node1, dad1).computed = 0;

            // Attachment branch reset, as a neutral starting point.
            self.tree.set_branch_length(node1, dad1, 0.9);

            // Divert the caches along the walk (and at the target edge) to
            // scratch blocks for the trial.
            let saved_n2 = self.stash_cache(node2, i_n2);
            let saved_d2 = self.stash_cache(dad2, i_d2);
            let saved_path: Vec<_> = {
                let snapshot = path.clone();
                snapshot
                    .into_iter()
                    .map(|(n, i)| self.stash_cache(n, i))
                    .collect()
            };

            self.optimize_one_branch(node1, dad1, true)?;
            self.optimize_one_branch(dad2, dad1, true)?;
            self.optimize_one_branch(node2, dad1, true)?;
            let score = self.optimize_one_branch(orig_node1, orig_node2, true)?;

            if score > cur_score {
                debug!("SPR regraft improves to {}", score);
                self.commit_cache(&saved_n2);
                self.commit_cache(&saved_d2);
                for s in &saved_path {
                    self.commit_cache(s);
                }
                return Ok(score);
            }

            // Reject: disconnect dad1 from the candidate edge and restore.
            self.tree.update_neighbor(node2, dad1, dad2, Some(len2));
            self.tree.update_neighbor(dad2, dad1, node2, Some(len2));
            self.tree.set_branch_length(node1, dad1, attach_len);
            for s in saved_path.iter().rev() {
                self.restore_cache(s, false, true);
            }
            self.restore_cache(&saved_d2, false, false);
            self.restore_cache(&saved_n2, false, false);
            // Caches recomputed against the trial topology must not survive
            // as valid: the trashed entries at the carrier node, and every
            // cache whose subtree contains the candidate edge.
            self.tree.node_mut(dad1).neighbors[free[0]].computed = 0;
            self.tree.node_mut(dad1).neighbors[free[1]].computed = 0;
            self.tree.neighbor_mut(node1, dad1).computed = 0;
            self.tree.clear_reverse_partial(node2, dad2);
            self.tree.clear_reverse_partial(dad2, node2);

            moves.add(node1, dad1, node2, dad2, score);
        }

        if depth >= spr_radius {
            return Ok(cur_score);
        }
        path.push((node2, self.tree.neighbor_index(node2, dad2).unwrap()));
        for peer in self.tree.adjacent(node2, Some(dad2)) {
            let score = self.swap_spr(
                cur_score,
                depth + 1,
                node1,
                dad1,
                orig_node1,
                orig_node2,
                peer,
                node2,
                spr_radius,
                path,
                moves,
            )?;
            if score > cur_score {
                return Ok(score);
            }
        }
        path.pop();
        Ok(cur_score)
    }

    /// Re-assess a buffered candidate with a full branch-length pass,
    /// committing it only on strict improvement.
    fn assess_spr_move(&mut self, cur_score: f64, mv: &SprMove) -> Result<f64> {
        let snapshot = self.tree.clone();
        let dad = mv.prune_dad;
        let node = mv.prune_node;
        let node2 = mv.regraft_node;
        let dad2 = mv.regraft_dad;

        let siblings = self.tree.adjacent(dad, Some(node));
        let (s1, s2) = (siblings[0], siblings[1]);
        let s1_len = self.tree.branch_length(dad, s1);
        let s2_len = self.tree.branch_length(dad, s2);
        let sum_len = s1_len + s2_len;
        self.tree.update_neighbor(s1, dad, s2, Some(sum_len));
        self.tree.update_neighbor(s2, dad, s1, Some(sum_len));

        let len2 = self.tree.branch_length(node2, dad2);
        let free: Vec<usize> = (0..self.tree.node(dad).neighbors.len())
            .filter(|&i| self.tree.node(dad).neighbors[i].node != Some(node))
            .collect();
        self.tree
            .update_neighbor_at(dad, free[0], Some(dad2), Some(len2 / 2.0));
        self.tree.update_neighbor(dad2, node2, dad, Some(len2 / 2.0));
        self.tree
            .update_neighbor_at(dad, free[1], Some(node2), Some(len2 / 2.0));
        self.tree.update_neighbor(node2, dad2, dad, Some(len2 / 2.0));

        self.tree.clear_all_partial();
        let score = self.optimize_all_branches_from(dad, None)?;
        if score > cur_score {
            debug!("buffered SPR move accepted: {}", score);
            return Ok(score);
        }
        self.tree = snapshot;
        self.tree.clear_all_partial();
        Ok(cur_score)
    }
}
