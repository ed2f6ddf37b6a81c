//! Branch-length optimization by maximum likelihood.
//!
//! One edge at a time: the edge is designated as the entry edge and its
//! negative log-likelihood is minimized over
//! `[MIN_BRANCH_LEN, MAX_BRANCH_LEN]` with Brent's method, or with
//! Newton-Raphson on the analytic derivatives when configured. A full-tree
//! pass visits every edge in post-order from the entry leaf.

use log::debug;
use physalia_core::{PhysaliaError, Result};

use crate::minimizer::{minimize_newton, minimize_one_dimen};
use crate::phylo::PhyloTree;
use crate::tree::NodeId;
use crate::{MAX_BRANCH_LEN, MIN_BRANCH_LEN, TOL_BRANCH_LEN};

impl PhyloTree {
    /// Negative log-likelihood of the current entry edge at length `value`.
    pub(crate) fn compute_function(&mut self, value: f64) -> Result<f64> {
        let (dad, node) = self.current_edge.ok_or_else(|| {
            PhysaliaError::InvariantViolated("no entry edge designated".into())
        })?;
        self.tree.set_branch_length(dad, node, value);
        Ok(-self.compute_likelihood_branch(dad, node)?)
    }

    /// Negative log-likelihood and negated derivatives at length `value`.
    pub(crate) fn compute_func_derv(&mut self, value: f64) -> Result<(f64, f64, f64)> {
        let (dad, node) = self.current_edge.ok_or_else(|| {
            PhysaliaError::InvariantViolated("no entry edge designated".into())
        })?;
        self.tree.set_branch_length(dad, node, value);
        let (lh, df, ddf) = self.compute_likelihood_derv(dad, node)?;
        Ok((-lh, -df, -ddf))
    }

    /// Locate the likelihood-optimal length of the edge `(node1, node2)`
    /// without committing it: the incoming length is restored afterwards,
    /// leaving every cache valid.
    ///
    /// Returns `(optimal length, log-likelihood at the optimum)`.
    pub(crate) fn branch_length_optimum(
        &mut self,
        node1: NodeId,
        node2: NodeId,
    ) -> Result<(f64, f64)> {
        self.ensure_initialized()?;
        self.current_edge = Some((node1, node2));
        let current_len = self.tree.branch_length(node1, node2);

        let mut failure: Option<PhysaliaError> = None;
        let (optx, negative_lh) = if self.optimize_by_newton {
            minimize_newton(
                MIN_BRANCH_LEN,
                current_len,
                MAX_BRANCH_LEN,
                TOL_BRANCH_LEN,
                &mut |x| match self.compute_func_derv(x) {
                    Ok(v) => v,
                    Err(e) => {
                        failure.get_or_insert(e);
                        (f64::INFINITY, f64::NAN, f64::NAN)
                    }
                },
            )
        } else {
            minimize_one_dimen(
                MIN_BRANCH_LEN,
                current_len,
                MAX_BRANCH_LEN,
                TOL_BRANCH_LEN,
                &mut |x| match self.compute_function(x) {
                    Ok(v) => v,
                    Err(e) => {
                        failure.get_or_insert(e);
                        f64::INFINITY
                    }
                },
            )
        };
        if let Some(e) = failure {
            return Err(e);
        }
        // Evaluation leaves the edge at the last trial length; put the
        // incoming length back so every cache is consistent again.
        self.tree.set_branch_length(node1, node2, current_len);
        Ok((optx, -negative_lh))
    }

    /// Optimize the length of the edge `(node1, node2)`.
    ///
    /// With `clear`, caches whose subtree contains the edge are invalidated
    /// when the length actually changed. Returns the log-likelihood at the
    /// optimum.
    pub fn optimize_one_branch(&mut self, node1: NodeId, node2: NodeId, clear: bool) -> Result<f64> {
        let current_len = self.tree.branch_length(node1, node2);
        let (optx, lh) = self.branch_length_optimum(node1, node2)?;
        if optx == current_len {
            return Ok(lh);
        }
        self.tree.set_branch_length(node1, node2, optx);
        if clear {
            self.tree.clear_reverse_partial(node1, node2);
            self.tree.clear_reverse_partial(node2, node1);
        }
        Ok(lh)
    }

    /// Optimize every edge incident to `node` (excluding the one toward
    /// `dad`), returning the last evaluated log-likelihood.
    pub fn optimize_child_branches(&mut self, node: NodeId, dad: Option<NodeId>) -> Result<f64> {
        let mut tree_lh = f64::NEG_INFINITY;
        for peer in self.tree.adjacent(node, dad) {
            tree_lh = self.optimize_one_branch(node, peer, true)?;
        }
        Ok(tree_lh)
    }

    pub(crate) fn optimize_all_branches_from(
        &mut self,
        node: NodeId,
        dad: Option<NodeId>,
    ) -> Result<f64> {
        let mut tree_lh = f64::NEG_INFINITY;
        for peer in self.tree.adjacent(node, dad) {
            tree_lh = self.optimize_all_branches_from(peer, Some(node))?;
        }
        if let Some(dad) = dad {
            tree_lh = self.optimize_one_branch(node, dad, true)?;
        }
        Ok(tree_lh)
    }

    /// Post-order sweeps over all branches until the improvement drops to
    /// `tolerance` or `iterations` passes are done.
    ///
    /// The returned log-likelihood never decreases across passes.
    pub fn optimize_all_branches(&mut self, iterations: usize, tolerance: f64) -> Result<f64> {
        self.ensure_initialized()?;
        let entry = self.require_entry()?;
        let mut tree_lh = self.compute_likelihood(None)?;
        for pass in 0..iterations {
            let new_tree_lh = self.optimize_all_branches_from(entry, None)?;
            debug!("branch length pass {}: {}", pass + 1, new_tree_lh);
            if new_tree_lh <= tree_lh + tolerance {
                return Ok(new_tree_lh.max(tree_lh));
            }
            tree_lh = new_tree_lh;
        }
        Ok(tree_lh)
    }
}
