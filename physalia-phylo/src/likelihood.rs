//! The partial-likelihood engine.
//!
//! Partial likelihoods are cached per half-edge as flat
//! `pattern x category x state` blocks in the central arena. The tree
//! log-likelihood is evaluated at a designated entry edge by combining the
//! two opposing caches through the transition matrix of that edge, with a
//! leaf-row shortcut when one endpoint is a leaf with a definite state.
//!
//! Numerical underflow is handled by threshold scaling: whenever every
//! entry of a pattern's block drops below [`SCALING_THRESHOLD`], the block
//! is rescaled and the event is counted in `scale_num`, with the aggregate
//! log-scale accumulated per half-edge. Per-pattern log-likelihoods are
//! recovered on demand from the counters.

use physalia_core::{PhysaliaError, Result};

use crate::alignment::state_mask;
use crate::phylo::PhyloTree;
use crate::tree::{NodeId, LH_VALID};
use crate::{LOG_SCALING_THRESHOLD, MAX_SITE_RATE, SCALING_THRESHOLD};

/// Split `arr` into the mutable block of `parent` and the shared block of
/// `child`, both of `stride` elements.
fn disjoint_pair<T>(arr: &mut [T], stride: usize, parent: usize, child: usize) -> (&mut [T], &[T]) {
    assert_ne!(parent, child);
    if parent < child {
        let (lo, hi) = arr.split_at_mut(child * stride);
        (
            &mut lo[parent * stride..(parent + 1) * stride],
            &hi[..stride],
        )
    } else {
        let (lo, hi) = arr.split_at_mut(parent * stride);
        (&mut hi[..stride], &lo[child * stride..(child + 1) * stride])
    }
}

impl PhyloTree {
    /// Tree log-likelihood at the entry edge.
    ///
    /// If `pattern_lh` is given it receives the per-pattern log-likelihoods
    /// including scaling recovery.
    pub fn compute_likelihood(&mut self, pattern_lh: Option<&mut [f64]>) -> Result<f64> {
        self.ensure_initialized()?;
        let entry = self.require_entry()?;
        let peer = self.tree.node(entry).neighbors[0].peer();
        let score = self.compute_likelihood_branch(entry, peer)?;
        if let Some(out) = pattern_lh {
            self.recover_pattern_lh(out);
        }
        Ok(score)
    }

    /// Per-pattern log-likelihoods of the last evaluation, with scaling
    /// recovered from the entry edge's counters.
    ///
    /// When `cur_logl` is given, the recovered values are re-summed against
    /// it; a discrepancy beyond `1e-3` signals a cache-invalidation bug.
    pub fn compute_pattern_likelihood(
        &mut self,
        out: &mut [f64],
        cur_logl: Option<f64>,
    ) -> Result<()> {
        if self.current_edge.is_none() {
            return Err(PhysaliaError::InvariantViolated(
                "pattern likelihoods requested before any evaluation".into(),
            ));
        }
        self.recover_pattern_lh(out);
        if let Some(logl) = cur_logl {
            let check: f64 = out
                .iter()
                .zip(&self.ptn_freq)
                .map(|(lh, f)| lh * f)
                .sum();
            if (check - logl).abs() > 1e-3 {
                return Err(PhysaliaError::InvariantViolated(format!(
                    "pattern likelihoods sum to {} but tree score is {}",
                    check, logl
                )));
            }
        }
        Ok(())
    }

    fn recover_pattern_lh(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.pattern_lh);
        let Some((dad, node)) = self.current_edge else {
            return;
        };
        let fwd = self.tree.neighbor(dad, node);
        let back = self.tree.neighbor(node, dad);
        if fwd.lh_scale_factor < 0.0 || back.lh_scale_factor < 0.0 {
            let s1 = self.scale_range(fwd.slot.unwrap());
            let s2 = self.scale_range(back.slot.unwrap());
            for ptn in 0..self.aln.size() {
                let n1 = self.scale_num[s1.start + ptn].max(0) as f64;
                let n2 = self.scale_num[s2.start + ptn].max(0) as f64;
                out[ptn] += (n1 + n2) * LOG_SCALING_THRESHOLD;
            }
        }
    }

    /// Tree log-likelihood evaluated at the edge `(dad, node)`.
    pub fn compute_likelihood_branch(&mut self, dad: NodeId, node: NodeId) -> Result<f64> {
        self.ensure_initialized()?;
        // Keep the leaf (if any) on the dad side for the row shortcut.
        let (dad, node) = if self.tree.is_leaf(node) {
            (node, dad)
        } else {
            (dad, node)
        };
        self.compute_partial_likelihood(dad, node)?;
        self.compute_partial_likelihood(node, dad)?;
        self.current_edge = Some((dad, node));

        let stack = self.models.as_ref().ok_or_else(|| {
            PhysaliaError::InvalidInput("no substitution model attached to the tree".into())
        })?;
        let nstates = self.aln.num_states();
        let ncat = stack.site_rate.get_n_rate();
        let discrete_cat = stack.site_rate.get_n_discrete_rate();
        let p_invar = stack.site_rate.get_p_invar();
        let p_var_cat = (1.0 - p_invar) / ncat as f64;
        let block = self.block;
        let tsize = stack.model.get_trans_matrix_size();
        let nptn = self.aln.size();
        let branch_len = self.tree.neighbor(dad, node).length;
        let site_specific_rate = stack.site_rate.is_site_specific_rate();
        let site_specific_model = stack.model.is_site_specific_model();
        let not_ptn_cat = stack.site_rate.get_ptn_cat(0) < 0;

        let mut state_freq = vec![0.0; nstates];
        stack.model.get_state_frequency(&mut state_freq);
        let mut trans_mat = vec![0.0; discrete_cat * tsize];
        if !site_specific_rate {
            for cat in 0..discrete_cat {
                stack.factory.compute_trans_matrix_freq(
                    branch_len * stack.site_rate.get_rate(cat),
                    &state_freq,
                    &mut trans_mat[cat * tsize..(cat + 1) * tsize],
                );
            }
        }

        let mut tree_lh = self.tree.neighbor(dad, node).lh_scale_factor
            + self.tree.neighbor(node, dad).lh_scale_factor;
        let node_slot = self.tree.neighbor(node, dad).slot.unwrap();
        let dad_slot = self.tree.neighbor(dad, node).slot.unwrap();
        let dad_is_leaf = self.tree.is_leaf(dad);
        let dad_seq = self.tree.node(dad).id;

        for ptn in 0..nptn {
            let pattern = self.aln.pattern(ptn);
            let mut lh_ptn = 0.0;
            let dad_state = if dad_is_leaf {
                pattern.states[dad_seq]
            } else {
                u8::MAX
            };
            if site_specific_rate {
                stack.factory.compute_trans_matrix_freq(
                    branch_len * stack.site_rate.get_ptn_rate(ptn),
                    &state_freq,
                    &mut trans_mat[..tsize],
                );
            }
            let ptn_cat = stack.site_rate.get_ptn_cat(ptn);
            let model_offset = if site_specific_model {
                nstates * nstates * stack.model.get_ptn_model_id(ptn)
            } else {
                0
            };
            let site_block = &self.partial_lh[self.lh_range(node_slot)][ptn * block..];
            let child_block = &self.partial_lh[self.lh_range(dad_slot)][ptn * block..];
            for cat in 0..ncat {
                let off = cat * nstates;
                let trans_cat = if not_ptn_cat { cat } else { ptn_cat as usize };
                let trans_base = trans_cat * tsize + model_offset;
                if (dad_state as usize) < nstates {
                    let row = &trans_mat[trans_base + dad_state as usize * nstates..];
                    let mut lh_cat = 0.0;
                    for j in 0..nstates {
                        lh_cat += child_block[off + j] * row[j];
                    }
                    lh_ptn += lh_cat;
                } else {
                    for i in 0..nstates {
                        let row = &trans_mat[trans_base + i * nstates..];
                        let mut lh_state = 0.0;
                        for j in 0..nstates {
                            lh_state += child_block[off + j] * row[j];
                        }
                        lh_ptn += lh_state * site_block[off + i];
                    }
                }
            }
            lh_ptn *= p_var_cat;
            if pattern.is_const && (pattern.states[0] as usize) < nstates {
                lh_ptn += p_invar * state_freq[pattern.states[0] as usize];
            }
            if lh_ptn <= 0.0 {
                return Err(PhysaliaError::NumericFailure(format!(
                    "non-positive likelihood {} at pattern {}",
                    lh_ptn, ptn
                )));
            }
            let log_lh = lh_ptn.ln();
            self.pattern_lh[ptn] = log_lh;
            if self.discard_saturated_site
                && site_specific_rate
                && stack.site_rate.get_ptn_rate(ptn) >= MAX_SITE_RATE
            {
                continue;
            }
            tree_lh += log_lh * self.ptn_freq[ptn];
        }
        Ok(tree_lh)
    }

    /// Tree log-likelihood at `(dad, node)` with the edge length forced to
    /// zero; both caches stay valid at the original length.
    pub fn compute_likelihood_zero_branch(&mut self, dad: NodeId, node: NodeId) -> Result<f64> {
        let saved = self.tree.neighbor(dad, node).length;
        self.tree.set_branch_length(dad, node, 0.0);
        let result = self.compute_likelihood_branch(dad, node);
        self.tree.set_branch_length(dad, node, saved);
        result
    }

    /// Tree log-likelihood at `(dad, node)` together with the first and
    /// second derivatives in the branch length.
    pub fn compute_likelihood_derv(
        &mut self,
        dad: NodeId,
        node: NodeId,
    ) -> Result<(f64, f64, f64)> {
        self.ensure_initialized()?;
        let (dad, node) = if self.tree.is_leaf(node) {
            (node, dad)
        } else {
            (dad, node)
        };
        self.compute_partial_likelihood(dad, node)?;
        self.compute_partial_likelihood(node, dad)?;
        self.current_edge = Some((dad, node));

        let stack = self.models.as_ref().ok_or_else(|| {
            PhysaliaError::InvalidInput("no substitution model attached to the tree".into())
        })?;
        let nstates = self.aln.num_states();
        let ncat = stack.site_rate.get_n_rate();
        let discrete_cat = stack.site_rate.get_n_discrete_rate();
        let p_invar = stack.site_rate.get_p_invar();
        let p_var_cat = (1.0 - p_invar) / ncat as f64;
        let block = self.block;
        let tsize = stack.model.get_trans_matrix_size();
        let nptn = self.aln.size();
        let branch_len = self.tree.neighbor(dad, node).length;
        let site_specific_rate = stack.site_rate.is_site_specific_rate();
        let site_specific_model = stack.model.is_site_specific_model();
        let not_ptn_cat = stack.site_rate.get_ptn_cat(0) < 0;

        let mut state_freq = vec![0.0; nstates];
        stack.model.get_state_frequency(&mut state_freq);
        let mut trans_mat = vec![0.0; discrete_cat * tsize];
        let mut trans_derv1 = vec![0.0; discrete_cat * tsize];
        let mut trans_derv2 = vec![0.0; discrete_cat * tsize];
        if !site_specific_rate {
            for cat in 0..discrete_cat {
                let r = cat * tsize..(cat + 1) * tsize;
                stack.factory.compute_trans_derv_freq(
                    branch_len,
                    stack.site_rate.get_rate(cat),
                    &state_freq,
                    &mut trans_mat[r.clone()],
                    &mut trans_derv1[r.clone()],
                    &mut trans_derv2[r],
                );
            }
        }

        let mut tree_lh = self.tree.neighbor(dad, node).lh_scale_factor
            + self.tree.neighbor(node, dad).lh_scale_factor;
        let mut my_df = 0.0;
        let mut my_ddf = 0.0;
        let node_slot = self.tree.neighbor(node, dad).slot.unwrap();
        let dad_slot = self.tree.neighbor(dad, node).slot.unwrap();
        let dad_is_leaf = self.tree.is_leaf(dad);
        let dad_seq = self.tree.node(dad).id;

        for ptn in 0..nptn {
            let pattern = self.aln.pattern(ptn);
            if self.discard_saturated_site
                && site_specific_rate
                && stack.site_rate.get_ptn_rate(ptn) >= MAX_SITE_RATE
            {
                continue;
            }
            if site_specific_rate {
                stack.factory.compute_trans_derv_freq(
                    branch_len,
                    stack.site_rate.get_ptn_rate(ptn),
                    &state_freq,
                    &mut trans_mat[..tsize],
                    &mut trans_derv1[..tsize],
                    &mut trans_derv2[..tsize],
                );
            }
            let mut lh_ptn = 0.0;
            let mut lh_ptn_derv1 = 0.0;
            let mut lh_ptn_derv2 = 0.0;
            let dad_state = if dad_is_leaf {
                pattern.states[dad_seq]
            } else {
                u8::MAX
            };
            let ptn_cat = stack.site_rate.get_ptn_cat(ptn);
            let model_offset = if site_specific_model {
                nstates * nstates * stack.model.get_ptn_model_id(ptn)
            } else {
                0
            };
            let site_block = &self.partial_lh[self.lh_range(node_slot)][ptn * block..];
            let child_block = &self.partial_lh[self.lh_range(dad_slot)][ptn * block..];
            for cat in 0..ncat {
                let off = cat * nstates;
                let trans_cat = if not_ptn_cat { cat } else { ptn_cat as usize };
                if (dad_state as usize) < nstates {
                    let base = trans_cat * tsize + model_offset + dad_state as usize * nstates;
                    for j in 0..nstates {
                        let child = child_block[off + j];
                        lh_ptn += child * trans_mat[base + j];
                        lh_ptn_derv1 += child * trans_derv1[base + j];
                        lh_ptn_derv2 += child * trans_derv2[base + j];
                    }
                } else {
                    for i in 0..nstates {
                        let base = trans_cat * tsize + model_offset + i * nstates;
                        let mut lh_state = 0.0;
                        let mut lh_state_d1 = 0.0;
                        let mut lh_state_d2 = 0.0;
                        for j in 0..nstates {
                            let child = child_block[off + j];
                            lh_state += child * trans_mat[base + j];
                            lh_state_d1 += child * trans_derv1[base + j];
                            lh_state_d2 += child * trans_derv2[base + j];
                        }
                        let site = site_block[off + i];
                        lh_ptn += lh_state * site;
                        lh_ptn_derv1 += lh_state_d1 * site;
                        lh_ptn_derv2 += lh_state_d2 * site;
                    }
                }
            }
            lh_ptn *= p_var_cat;
            if pattern.is_const && (pattern.states[0] as usize) < nstates {
                lh_ptn += p_invar * state_freq[pattern.states[0] as usize];
            }
            if lh_ptn <= 0.0 {
                return Err(PhysaliaError::NumericFailure(format!(
                    "non-positive likelihood {} at pattern {}",
                    lh_ptn, ptn
                )));
            }
            let pad = p_var_cat / lh_ptn;
            let (derv1_frac, derv2_frac) = if pad.is_infinite() {
                (
                    lh_ptn_derv1 * p_var_cat / lh_ptn,
                    lh_ptn_derv2 * p_var_cat / lh_ptn,
                )
            } else {
                (lh_ptn_derv1 * pad, lh_ptn_derv2 * pad)
            };
            let freq = self.ptn_freq[ptn];
            let tmp1 = derv1_frac * freq;
            let tmp2 = derv2_frac * freq;
            my_df += tmp1;
            my_ddf += tmp2 - tmp1 * derv1_frac;
            let log_lh = lh_ptn.ln();
            tree_lh += log_lh * freq;
            self.pattern_lh[ptn] = log_lh;
            if !log_lh.is_finite() || !my_df.is_finite() || !my_ddf.is_finite() {
                return Err(PhysaliaError::NumericFailure(format!(
                    "non-finite likelihood derivative at pattern {}",
                    ptn
                )));
            }
        }
        Ok((tree_lh, my_df, my_ddf))
    }

    /// Compute (if stale) the partial likelihood behind the half-edge
    /// `(dad -> node)`.
    pub(crate) fn compute_partial_likelihood(&mut self, dad: NodeId, node: NodeId) -> Result<()> {
        if self.tree.neighbor(dad, node).is_valid(LH_VALID) {
            return Ok(());
        }
        if self.tree.is_leaf(node) {
            self.fill_leaf_partial(dad, node)?;
        } else {
            let children = self.tree.adjacent(node, Some(dad));
            if children.len() != 2 {
                return Err(PhysaliaError::InvalidInput(format!(
                    "node {} has degree {}, likelihood requires a binary tree",
                    node,
                    children.len() + 1
                )));
            }
            for &child in &children {
                self.compute_partial_likelihood(node, child)?;
            }
            self.combine_partials(dad, node, &children)?;
        }
        self.tree.neighbor_mut(dad, node).computed |= LH_VALID;
        Ok(())
    }

    fn fill_leaf_partial(&mut self, dad: NodeId, node: NodeId) -> Result<()> {
        let nstates = self.aln.num_states();
        let ncat = self.ncat();
        let block = self.block;
        let nptn = self.aln.size();
        let seq = self.tree.node(node).id;
        if seq >= self.aln.n_seq() {
            return Err(PhysaliaError::InvalidInput(format!(
                "leaf id {} has no sequence in the alignment",
                seq
            )));
        }
        let slot = self.tree.neighbor(dad, node).slot.ok_or_else(|| {
            PhysaliaError::InvariantViolated("half-edge without a cache slot".into())
        })?;
        let lh_range = self.lh_range(slot);
        let scale_range = self.scale_range(slot);
        let lh = &mut self.partial_lh[lh_range];
        let scale = &mut self.scale_num[scale_range];
        lh.fill(0.0);
        scale.fill(0);
        for ptn in 0..nptn {
            let state = self.aln.state(ptn, seq);
            let site = &mut lh[ptn * block..(ptn + 1) * block];
            if state == crate::alignment::STATE_UNKNOWN {
                site.fill(1.0);
                scale[ptn] = -1;
            } else {
                let mask = state_mask(state, nstates);
                for s in 0..nstates {
                    if mask & (1 << s) != 0 {
                        for cat in 0..ncat {
                            site[cat * nstates + s] = 1.0;
                        }
                    }
                }
            }
        }
        let nei = self.tree.neighbor_mut(dad, node);
        nei.lh_scale_factor = 0.0;
        Ok(())
    }

    fn combine_partials(&mut self, dad: NodeId, node: NodeId, children: &[NodeId]) -> Result<()> {
        let nstates = self.aln.num_states();
        let block = self.block;
        let block_size = self.block_size;
        let nptn = self.aln.size();
        let parent_slot = self.tree.neighbor(dad, node).slot.ok_or_else(|| {
            PhysaliaError::InvariantViolated("half-edge without a cache slot".into())
        })?;

        struct ChildInfo {
            slot: usize,
            length: f64,
            scale_factor: f64,
        }
        let infos: Vec<ChildInfo> = children
            .iter()
            .map(|&c| {
                let nei = self.tree.neighbor(node, c);
                ChildInfo {
                    slot: nei.slot.unwrap(),
                    length: nei.length,
                    scale_factor: nei.lh_scale_factor,
                }
            })
            .collect();

        let stack = self.models.as_ref().ok_or_else(|| {
            PhysaliaError::InvalidInput("no substitution model attached to the tree".into())
        })?;
        let ncat = stack.site_rate.get_n_rate();
        let discrete_cat = stack.site_rate.get_n_discrete_rate();
        let tsize = stack.model.get_trans_matrix_size();
        let site_specific_rate = stack.site_rate.is_site_specific_rate();
        let site_specific_model = stack.model.is_site_specific_model();
        let not_ptn_cat = stack.site_rate.get_ptn_cat(0) < 0;

        // Initialize the parent block to the multiplicative identity.
        {
            let r = parent_slot * block_size..(parent_slot + 1) * block_size;
            self.partial_lh[r].fill(1.0);
            let s = parent_slot * nptn..(parent_slot + 1) * nptn;
            self.scale_num[s].fill(-1);
        }
        let mut lh_scale_factor = 0.0;
        let mut trans_mat = vec![0.0; discrete_cat * tsize];

        for info in &infos {
            lh_scale_factor += info.scale_factor;
            if !site_specific_rate {
                for cat in 0..discrete_cat {
                    stack.factory.compute_trans_matrix(
                        info.length * stack.site_rate.get_rate(cat),
                        &mut trans_mat[cat * tsize..(cat + 1) * tsize],
                    );
                }
            }
            let mut sum_scale = 0.0;
            for ptn in 0..nptn {
                let child_scale = self.scale_num[info.slot * nptn + ptn];
                if child_scale < 0 {
                    // Child block is all ones at this pattern.
                    continue;
                }
                {
                    let (parent_scale, _) =
                        disjoint_pair(&mut self.scale_num, nptn, parent_slot, info.slot);
                    if parent_scale[ptn] < 0 {
                        parent_scale[ptn] = 0;
                    }
                    parent_scale[ptn] += child_scale;
                }
                if site_specific_rate {
                    stack.factory.compute_trans_matrix(
                        info.length * stack.site_rate.get_ptn_rate(ptn),
                        &mut trans_mat[..tsize],
                    );
                }
                let ptn_cat = stack.site_rate.get_ptn_cat(ptn);
                let model_offset = if site_specific_model {
                    nstates * nstates * stack.model.get_ptn_model_id(ptn)
                } else {
                    0
                };
                let (parent, child) =
                    disjoint_pair(&mut self.partial_lh, block_size, parent_slot, info.slot);
                let parent_site = &mut parent[ptn * block..(ptn + 1) * block];
                let child_site = &child[ptn * block..(ptn + 1) * block];
                for cat in 0..ncat {
                    let off = cat * nstates;
                    let trans_cat = if not_ptn_cat { cat } else { ptn_cat as usize };
                    let base = trans_cat * tsize + model_offset;
                    for s in 0..nstates {
                        let row = &trans_mat[base + s * nstates..];
                        let mut lh_child = 0.0;
                        for j in 0..nstates {
                            lh_child += row[j] * child_site[off + j];
                        }
                        parent_site[off + s] *= lh_child;
                    }
                }
                // Scale the whole pattern block when every entry underflows
                // the threshold.
                if parent_site.iter().all(|&v| v <= SCALING_THRESHOLD) {
                    for v in parent_site.iter_mut() {
                        *v /= SCALING_THRESHOLD;
                    }
                    sum_scale += LOG_SCALING_THRESHOLD * self.ptn_freq[ptn];
                    let (parent_scale, _) =
                        disjoint_pair(&mut self.scale_num, nptn, parent_slot, info.slot);
                    parent_scale[ptn] += 1;
                }
            }
            lh_scale_factor += sum_scale;
        }
        self.tree.neighbor_mut(dad, node).lh_scale_factor = lh_scale_factor;
        Ok(())
    }

    /// Sampling variance of the log-likelihood over sites, with the
    /// `nsite / (nsite - 1)` correction.
    pub fn compute_logl_variance(
        &mut self,
        ptn_lh: Option<&[f64]>,
        tree_lh: f64,
    ) -> Result<f64> {
        let nptn = self.aln.size();
        let nsite = self.aln.n_site() as f64;
        let owned;
        let pattern_lh = match ptn_lh {
            Some(lh) => lh,
            None => {
                let mut buf = vec![0.0; nptn];
                self.compute_pattern_likelihood(&mut buf, None)?;
                owned = buf;
                &owned
            }
        };
        let mut tree_lh = tree_lh;
        if tree_lh == 0.0 {
            tree_lh = pattern_lh
                .iter()
                .zip(&self.ptn_freq)
                .map(|(lh, f)| lh * f)
                .sum();
        }
        let avg_site_lh = tree_lh / nsite;
        let variance: f64 = pattern_lh
            .iter()
            .zip(&self.ptn_freq)
            .map(|(lh, f)| (lh - avg_site_lh) * (lh - avg_site_lh) * f)
            .sum();
        Ok(variance * (nsite / (nsite - 1.0)))
    }

    /// Sampling variance of the per-site log-likelihood difference against
    /// another tree's pattern likelihoods.
    pub fn compute_logl_diff_variance(
        &mut self,
        pattern_lh_other: &[f64],
        ptn_lh: Option<&[f64]>,
    ) -> Result<f64> {
        let nptn = self.aln.size();
        let nsite = self.aln.n_site() as f64;
        let owned;
        let pattern_lh = match ptn_lh {
            Some(lh) => lh,
            None => {
                let mut buf = vec![0.0; nptn];
                self.compute_pattern_likelihood(&mut buf, None)?;
                owned = buf;
                &owned
            }
        };
        let mut avg_diff = 0.0;
        for ptn in 0..nptn {
            avg_diff += (pattern_lh[ptn] - pattern_lh_other[ptn]) * self.ptn_freq[ptn];
        }
        avg_diff /= nsite;
        let mut variance = 0.0;
        for ptn in 0..nptn {
            let diff = pattern_lh[ptn] - pattern_lh_other[ptn] - avg_diff;
            variance += diff * diff * self.ptn_freq[ptn];
        }
        Ok(variance * (nsite / (nsite - 1.0)))
    }

    /// Variance of the log-likelihood difference against another tree over
    /// the same alignment.
    pub fn compute_logl_diff_variance_with(&mut self, other: &mut PhyloTree) -> Result<f64> {
        let mut other_lh = vec![0.0; self.aln.size()];
        other.compute_pattern_likelihood(&mut other_lh, None)?;
        self.compute_logl_diff_variance(&other_lh, None)
    }
}

#[cfg(test)]
mod tests {
    use crate::alignment::Alignment;
    use crate::model::{Jc69, ModelFactory, SiteSpecificRate, UniformRate};
    use crate::phylo::PhyloTree;

    fn engine(newick: &str, seqs: &[(&str, &[u8])]) -> PhyloTree {
        engine_with_pinv(newick, seqs, 0.0)
    }

    fn engine_with_pinv(newick: &str, seqs: &[(&str, &[u8])], p_invar: f64) -> PhyloTree {
        let names: Vec<&str> = seqs.iter().map(|(n, _)| *n).collect();
        let data: Vec<&[u8]> = seqs.iter().map(|(_, s)| *s).collect();
        let aln = Alignment::from_sequences(&names, &data).unwrap();
        let tree = crate::newick::parse(newick).unwrap();
        let mut pt = PhyloTree::with_tree(tree, aln).unwrap();
        pt.set_model(
            Box::new(Jc69::new()),
            Box::new(Jc69::new()),
            Box::new(UniformRate::new(p_invar).unwrap()),
        );
        pt
    }

    fn quartet() -> PhyloTree {
        engine(
            "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);",
            &[
                ("A", b"ACGTACGTAC"),
                ("B", b"ACGTACGTAG"),
                ("C", b"ACGTACGTTC"),
                ("D", b"ACGTACGTTG"),
            ],
        )
    }

    #[test]
    fn star_tree_matches_closed_form() {
        // Three-taxon star under JC: L(site) = sum_x pi_x prod_i P(t_i)[x, s_i].
        let seqs: [(&str, &[u8]); 3] = [("A", b"ACGTAC"), ("B", b"ACGTAG"), ("C", b"AGGTAC")];
        let mut pt = engine("(A:0.1,B:0.2,C:0.3);", &seqs);
        let got = pt.compute_likelihood(None).unwrap();

        let jc = Jc69::new();
        let mut pa = vec![0.0; 16];
        let mut pb = vec![0.0; 16];
        let mut pc = vec![0.0; 16];
        jc.compute_trans_matrix(0.1, &mut pa);
        jc.compute_trans_matrix(0.2, &mut pb);
        jc.compute_trans_matrix(0.3, &mut pc);
        let mut expected = 0.0;
        for site in 0..6 {
            let a = crate::alignment::encode_dna(seqs[0].1[site]) as usize;
            let b = crate::alignment::encode_dna(seqs[1].1[site]) as usize;
            let c = crate::alignment::encode_dna(seqs[2].1[site]) as usize;
            let mut site_lh = 0.0;
            for x in 0..4 {
                site_lh += 0.25 * pa[x * 4 + a] * pb[x * 4 + b] * pc[x * 4 + c];
            }
            expected += site_lh.ln();
        }
        assert!(
            (got - expected).abs() < 1e-9,
            "engine {} vs closed form {}",
            got,
            expected
        );
    }

    #[test]
    fn likelihood_invariant_under_entry_edge() {
        let mut pt = quartet();
        let baseline = pt.compute_likelihood(None).unwrap();
        for (dad, node) in pt.tree.edges() {
            let lh = pt.compute_likelihood_branch(dad, node).unwrap();
            assert!(
                (lh - baseline).abs() < 1e-6 * baseline.abs().max(1.0),
                "edge ({}, {}): {} vs {}",
                dad,
                node,
                lh,
                baseline
            );
        }
    }

    #[test]
    fn cache_clear_and_recompute_agree() {
        let mut pt = quartet();
        let first = pt.compute_likelihood(None).unwrap();
        // Perturb one branch, let incremental invalidation do its job.
        let (dad, node) = pt.tree.edges()[1];
        pt.tree.set_branch_length(dad, node, 0.9);
        pt.tree.clear_reverse_partial(dad, node);
        pt.tree.clear_reverse_partial(node, dad);
        let incremental = pt.compute_likelihood(None).unwrap();
        // Full recompute must agree with the incremental path.
        pt.tree.clear_all_partial();
        let full = pt.compute_likelihood(None).unwrap();
        assert!((incremental - full).abs() < 1e-6);
        assert!(first > incremental, "longer branch should cost likelihood here");
    }

    #[test]
    fn all_invariant_alignment_with_full_p_invar() {
        // Every pattern constant, p_invar = 1: logL = sum freq * ln(pi).
        let mut pt = engine_with_pinv(
            "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);",
            &[
                ("A", b"AACCGGTT"),
                ("B", b"AACCGGTT"),
                ("C", b"AACCGGTT"),
                ("D", b"AACCGGTT"),
            ],
            1.0,
        );
        let got = pt.compute_likelihood(None).unwrap();
        let expected = 8.0 * (0.25f64).ln();
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn unknown_column_contributes_nothing() {
        let mut with_n = engine(
            "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);",
            &[
                ("A", b"NACGTACGTAC"),
                ("B", b"NACGTACGTAG"),
                ("C", b"NACGTACGTTC"),
                ("D", b"NACGTACGTTG"),
            ],
        );
        let mut without = quartet();
        let a = with_n.compute_likelihood(None).unwrap();
        let b = without.compute_likelihood(None).unwrap();
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn pattern_likelihoods_resum_to_score() {
        let mut pt = quartet();
        let score = pt.compute_likelihood(None).unwrap();
        let mut ptn_lh = vec![0.0; pt.aln().size()];
        pt.compute_pattern_likelihood(&mut ptn_lh, Some(score)).unwrap();
        let resum: f64 = ptn_lh
            .iter()
            .zip(pt.aln().pattern_frequencies())
            .map(|(lh, f)| lh * f as f64)
            .sum();
        assert!((resum - score).abs() < 1e-9);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let mut pt = quartet();
        pt.compute_likelihood(None).unwrap();
        let (dad, node) = pt.tree.edges()[0];
        let len = pt.tree.branch_length(dad, node);
        let (_, df, ddf) = pt.compute_likelihood_derv(dad, node).unwrap();

        let h = 1e-5;
        let mut eval = |t: f64| {
            pt.tree.set_branch_length(dad, node, t);
            pt.compute_likelihood_branch(dad, node).unwrap()
        };
        let lo = eval(len - h);
        let hi = eval(len + h);
        let mid = eval(len);
        let num_df = (hi - lo) / (2.0 * h);
        let num_ddf = (hi - 2.0 * mid + lo) / (h * h);
        assert!((df - num_df).abs() < 1e-4, "df {} vs {}", df, num_df);
        assert!((ddf - num_ddf).abs() < 1e-2, "ddf {} vs {}", ddf, num_ddf);
    }

    #[test]
    fn zero_branch_likelihood_restores_length() {
        let mut pt = quartet();
        let (dad, node) = pt.tree.edges()[0];
        let len = pt.tree.branch_length(dad, node);
        let full = pt.compute_likelihood_branch(dad, node).unwrap();
        let zero = pt.compute_likelihood_zero_branch(dad, node).unwrap();
        assert_eq!(pt.tree.branch_length(dad, node), len);
        assert!(zero.is_finite() && zero != full);
    }

    #[test]
    fn saturated_sites_discarded_when_flagged() {
        let seqs: [(&str, &[u8]); 4] = [
            ("A", b"ACGTACGTAC"),
            ("B", b"ACGTACGTAG"),
            ("C", b"ACGTACGTTC"),
            ("D", b"ACGTACGTTG"),
        ];
        let names: Vec<&str> = seqs.iter().map(|(n, _)| *n).collect();
        let data: Vec<&[u8]> = seqs.iter().map(|(_, s)| *s).collect();
        let aln = Alignment::from_sequences(&names, &data).unwrap();
        let nptn = aln.size();
        let tree = crate::newick::parse("((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);").unwrap();
        let mut pt = PhyloTree::with_tree(tree, aln).unwrap();
        // Saturate the first pattern's rate.
        let mut rates = vec![1.0; nptn];
        rates[0] = crate::MAX_SITE_RATE + 1.0;
        pt.set_model(
            Box::new(Jc69::new()),
            Box::new(Jc69::new()),
            Box::new(SiteSpecificRate::new(rates).unwrap()),
        );
        pt.discard_saturated_site = true;
        let with_discard = pt.compute_likelihood(None).unwrap();
        pt.discard_saturated_site = false;
        pt.tree.clear_all_partial();
        let without = pt.compute_likelihood(None).unwrap();
        assert!(with_discard > without, "{} vs {}", with_discard, without);
    }

    #[test]
    fn logl_variance_zero_for_single_pattern() {
        let mut pt = engine(
            "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);",
            &[("A", b"AAAA"), ("B", b"AAAA"), ("C", b"AAAA"), ("D", b"AAAA")],
        );
        let score = pt.compute_likelihood(None).unwrap();
        let var = pt.compute_logl_variance(None, score).unwrap();
        assert!(var.abs() < 1e-12);
    }

    #[test]
    fn logl_diff_variance_zero_against_self() {
        let mut pt = quartet();
        pt.compute_likelihood(None).unwrap();
        let mut lh = vec![0.0; pt.aln().size()];
        pt.compute_pattern_likelihood(&mut lh, None).unwrap();
        let var = pt.compute_logl_diff_variance(&lh, None).unwrap();
        assert!(var.abs() < 1e-12);
    }

    #[test]
    fn better_topology_has_higher_likelihood() {
        let mut good = quartet();
        let mut bad = engine(
            "((A:0.1,D:0.1):0.1,(B:0.1,C:0.1):0.1);",
            &[
                ("A", b"ACGTACGTAC"),
                ("B", b"ACGTACGTAG"),
                ("C", b"ACGTACGTTC"),
                ("D", b"ACGTACGTTG"),
            ],
        );
        let g = good.compute_likelihood(None).unwrap();
        let b = bad.compute_likelihood(None).unwrap();
        assert!(g > b, "expected {} > {}", g, b);
    }
}
