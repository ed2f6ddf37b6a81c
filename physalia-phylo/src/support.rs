//! Approximate likelihood-ratio test (SH-like) branch support with RELL
//! resampling, after Guindon et al. (2010).
//!
//! For each internal edge the two alternative NNI topologies are evaluated
//! with the five surrounding branches re-optimized to convergence; the test
//! statistic is the log-likelihood gap to the better alternative.
//! Resampling re-weights the per-pattern log-likelihoods (RELL) instead of
//! recomputing, and the support is the fraction of resamples in which the
//! centered gap stays below the statistic. Optionally the local bootstrap
//! proportion (the fraction of resamples ranking the current topology
//! first) is reported alongside.

use log::debug;
use physalia_core::Result;

use crate::phylo::PhyloTree;
use crate::rng::Xorshift64;
use crate::tree::NodeId;
use crate::TOL_LIKELIHOOD;

impl PhyloTree {
    /// Per-pattern log-likelihoods of the two alternative NNI topologies
    /// around the edge `(node1, node2)`, each with the five surrounding
    /// branches re-optimized until convergence.
    ///
    /// The tree, its branch lengths, and the surrounding caches are
    /// restored exactly before returning.
    pub fn compute_nni_pattern_lh(
        &mut self,
        cur_lh: f64,
        node1: NodeId,
        node2: NodeId,
    ) -> Result<(f64, Vec<f64>, f64, Vec<f64>)> {
        self.ensure_initialized()?;
        let nptn = self.aln.size();

        // Save the six half-edges whose caches the re-optimization touches:
        // the backward edges at the four outer neighbors plus both center
        // directions. Scratch blocks stand in during the trials.
        let mut saved = Vec::with_capacity(6);
        for peer in self.tree.adjacent(node1, Some(node2)) {
            let idx = self.tree.neighbor_index(peer, node1).unwrap();
            saved.push(self.stash_cache(peer, idx));
        }
        saved.push(self.stash_cache(node1, self.tree.neighbor_index(node1, node2).unwrap()));
        for peer in self.tree.adjacent(node2, Some(node1)) {
            let idx = self.tree.neighbor_index(peer, node2).unwrap();
            saved.push(self.stash_cache(peer, idx));
        }
        saved.push(self.stash_cache(node2, self.tree.neighbor_index(node2, node1).unwrap()));

        let i1 = self
            .tree
            .node(node1)
            .neighbors
            .iter()
            .position(|n| n.node.is_some() && n.node != Some(node2))
            .expect("degree-3 node");
        let swap_targets: Vec<usize> = self
            .tree
            .node(node2)
            .neighbors
            .iter()
            .enumerate()
            .filter(|(_, n)| n.node.is_some() && n.node != Some(node1))
            .map(|(i, _)| i)
            .collect();

        let mut lh = [0.0f64; 2];
        let mut pattern_lh = [vec![0.0; nptn], vec![0.0; nptn]];

        for (alt, &i2) in swap_targets.iter().enumerate() {
            self.nni_swap_entries(node1, i1, node2, i2);
            self.tree.clear_edge(node1, node2);

            let mut old_score = f64::NEG_INFINITY;
            let mut new_score = old_score;
            for _ in 0..2 {
                new_score = self.optimize_one_branch(node1, node2, false)?;
                for peer in self.tree.adjacent(node1, Some(node2)) {
                    self.tree.neighbor_mut(peer, node1).computed = 0;
                    new_score = self.optimize_one_branch(node1, peer, false)?;
                }
                self.tree.neighbor_mut(node2, node1).computed = 0;
                for peer in self.tree.adjacent(node2, Some(node1)) {
                    self.tree.neighbor_mut(peer, node2).computed = 0;
                    new_score = self.optimize_one_branch(node2, peer, false)?;
                }
                self.tree.neighbor_mut(node1, node2).computed = 0;
                if new_score < old_score + TOL_LIKELIHOOD {
                    break;
                }
                old_score = new_score;
            }
            if new_score > cur_lh + TOL_LIKELIHOOD {
                debug!(
                    "alternative NNI shows better likelihood {} > {}",
                    new_score, cur_lh
                );
            }
            lh[alt] = new_score;
            self.compute_pattern_likelihood(&mut pattern_lh[alt], None)?;

            self.nni_swap_entries(node1, i1, node2, i2);
        }

        // Restore the saved half-edges (links, lengths, caches), then copy
        // the recovered backward lengths onto the forward directions.
        for s in saved.iter().rev() {
            self.restore_cache(s, true, true);
        }
        for peer in self.tree.adjacent(node1, Some(node2)) {
            let len = self.tree.neighbor(peer, node1).length;
            self.tree.neighbor_mut(node1, peer).length = len;
        }
        for peer in self.tree.adjacent(node2, Some(node1)) {
            let len = self.tree.neighbor(peer, node2).length;
            self.tree.neighbor_mut(node2, peer).length = len;
        }

        let (lh2, pat2, lh3, pat3) = (
            lh[0],
            std::mem::take(&mut pattern_lh[0]),
            lh[1],
            std::mem::take(&mut pattern_lh[1]),
        );
        Ok((lh2, pat2, lh3, pat3))
    }

    /// RELL: draw bootstrap pattern frequencies once and re-weight the
    /// three per-pattern log-likelihood vectors.
    fn resample_lh(&self, pat_lh: [&[f64]; 3], rng: &mut Xorshift64) -> [f64; 3] {
        let boot_freq = self.aln.create_bootstrap_frequencies(rng);
        let mut lh_new = [0.0f64; 3];
        for (ptn, &freq) in boot_freq.iter().enumerate() {
            let f = freq as f64;
            lh_new[0] += f * pat_lh[0][ptn];
            lh_new[1] += f * pat_lh[1][ptn];
            lh_new[2] += f * pat_lh[2][ptn];
        }
        lh_new
    }

    /// SH-like aLRT support of one internal edge, plus the local bootstrap
    /// proportion. Both are fractions in `[0, 1]`.
    pub fn test_one_branch(
        &mut self,
        best_score: f64,
        pattern_lh: &[f64],
        reps: usize,
        lbp_reps: usize,
        node1: NodeId,
        node2: NodeId,
        rng: &mut Xorshift64,
    ) -> Result<(f64, f64)> {
        let (lh2, pat2, lh3, pat3) = self.compute_nni_pattern_lh(best_score, node1, node2)?;
        let lh = [best_score, lh2, lh3];
        let pats: [&[f64]; 3] = [pattern_lh, &pat2, &pat3];
        let alrt = lh[0] - lh[1].max(lh[2]);

        let times = reps.max(lbp_reps);
        let mut support = 0usize;
        let mut lbp_support = 0usize;
        for _ in 0..times {
            let lh_new = self.resample_lh(pats, rng);
            if lh_new[0] > lh_new[1] && lh_new[0] > lh_new[2] {
                lbp_support += 1;
            }
            let cs = [lh_new[0] - lh[0], lh_new[1] - lh[1], lh_new[2] - lh[2]];
            let (cs_best, cs_second) = if cs[0] >= cs[1] && cs[0] >= cs[2] {
                (cs[0], cs[1].max(cs[2]))
            } else if cs[1] >= cs[2] {
                (cs[1], cs[0].max(cs[2]))
            } else {
                (cs[2], cs[0].max(cs[1]))
            };
            if alrt > (cs_best - cs_second) + 0.05 {
                support += 1;
            }
        }
        Ok((
            support as f64 / times as f64,
            lbp_support as f64 / times as f64,
        ))
    }

    /// Test every internal edge; integer percent supports are written into
    /// the internal node names (aLRT, and `aLRT/LBP` when `lbp_reps > 0`).
    ///
    /// Returns the number of branches below `threshold` percent support.
    pub fn test_all_branches(
        &mut self,
        threshold: u32,
        best_score: f64,
        pattern_lh: &[f64],
        reps: usize,
        lbp_reps: usize,
        rng: &mut Xorshift64,
    ) -> Result<usize> {
        for internal in self.tree.internal_nodes() {
            self.tree.node_mut(internal).name = None;
        }
        let mut num_low_support = 0;
        for (dad, node) in self.tree.edges() {
            if self.tree.is_leaf(dad) || self.tree.is_leaf(node) {
                continue;
            }
            let (alrt, lbp) =
                self.test_one_branch(best_score, pattern_lh, reps, lbp_reps, node, dad, rng)?;
            let support = (alrt * 100.0).round() as u32;
            let mut label = support.to_string();
            if lbp_reps > 0 {
                label = format!("{}/{}", label, (lbp * 100.0).round() as u32);
            }
            self.tree.node_mut(node).name = Some(label);
            if support < threshold {
                num_low_support += 1;
            }
        }
        Ok(num_low_support)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::model::{Jc69, UniformRate};

    fn engine() -> PhyloTree {
        let aln = Alignment::from_sequences(
            &["A", "B", "C", "D"],
            &[
                b"AAAAAAAAAACCCCCCCCCC",
                b"AAAAAAAAAACCCCCCCCCG",
                b"TTTTTTTTTTGGGGGGGGGG",
                b"TTTTTTTTTTGGGGGGGGGA",
            ],
        )
        .unwrap();
        let tree = crate::newick::parse("((A:0.05,B:0.05):0.2,(C:0.05,D:0.05):0.2);").unwrap();
        let mut pt = PhyloTree::with_tree(tree, aln).unwrap();
        pt.set_model(
            Box::new(Jc69::new()),
            Box::new(Jc69::new()),
            Box::new(UniformRate::default()),
        );
        pt
    }

    #[test]
    fn nni_pattern_lh_alternatives_are_worse_here() {
        let mut pt = engine();
        let best = pt.optimize_all_branches(20, TOL_LIKELIHOOD).unwrap();
        let (node1, node2) = pt
            .tree
            .edges()
            .into_iter()
            .find(|&(a, b)| !pt.tree.is_leaf(a) && !pt.tree.is_leaf(b))
            .unwrap();
        let splits = pt.tree.splits();
        let (lh2, pat2, lh3, pat3) = pt.compute_nni_pattern_lh(best, node2, node1).unwrap();
        assert!(lh2 < best && lh3 < best, "{} {} vs {}", lh2, lh3, best);
        assert_eq!(pat2.len(), pt.aln().size());
        assert_eq!(pat3.len(), pt.aln().size());
        // Topology and branch lengths restored exactly.
        assert_eq!(pt.tree.splits(), splits);
        let restored = pt.compute_likelihood(None).unwrap();
        assert!((restored - best).abs() < 1e-6, "{} vs {}", restored, best);
    }

    #[test]
    fn strong_branch_gets_high_support() {
        let mut pt = engine();
        let best = pt.optimize_all_branches(20, TOL_LIKELIHOOD).unwrap();
        let mut pattern_lh = vec![0.0; pt.aln().size()];
        pt.compute_pattern_likelihood(&mut pattern_lh, None).unwrap();
        let mut rng = Xorshift64::new(42);
        let low = pt
            .test_all_branches(50, best, &pattern_lh, 100, 0, &mut rng)
            .unwrap();
        assert_eq!(low, 0, "the single internal edge is strongly supported");
        // The support label landed on an internal node.
        let labeled = pt
            .tree
            .internal_nodes()
            .into_iter()
            .filter(|&n| pt.tree.node(n).name.is_some())
            .count();
        assert_eq!(labeled, 1);
    }

    #[test]
    fn support_values_are_percentages() {
        let mut pt = engine();
        let best = pt.optimize_all_branches(20, TOL_LIKELIHOOD).unwrap();
        let mut pattern_lh = vec![0.0; pt.aln().size()];
        pt.compute_pattern_likelihood(&mut pattern_lh, None).unwrap();
        let mut rng = Xorshift64::new(7);
        pt.test_all_branches(0, best, &pattern_lh, 50, 0, &mut rng)
            .unwrap();
        for n in pt.tree.internal_nodes() {
            if let Some(name) = &pt.tree.node(n).name {
                let v: u32 = name.parse().unwrap();
                assert!(v <= 100);
            }
        }
    }

    #[test]
    fn lbp_label_appended_when_requested() {
        let mut pt = engine();
        let best = pt.optimize_all_branches(20, TOL_LIKELIHOOD).unwrap();
        let mut pattern_lh = vec![0.0; pt.aln().size()];
        pt.compute_pattern_likelihood(&mut pattern_lh, None).unwrap();
        let mut rng = Xorshift64::new(7);
        pt.test_all_branches(0, best, &pattern_lh, 50, 50, &mut rng)
            .unwrap();
        let labeled: Vec<String> = pt
            .tree
            .internal_nodes()
            .into_iter()
            .filter_map(|n| pt.tree.node(n).name.clone())
            .collect();
        assert!(labeled.iter().all(|l| l.contains('/')));
        assert!(!labeled.is_empty());
    }

    #[test]
    fn supports_deterministic_for_seed() {
        let run = |seed: u64| {
            let mut pt = engine();
            let best = pt.optimize_all_branches(20, TOL_LIKELIHOOD).unwrap();
            let mut pattern_lh = vec![0.0; pt.aln().size()];
            pt.compute_pattern_likelihood(&mut pattern_lh, None).unwrap();
            let mut rng = Xorshift64::new(seed);
            pt.test_all_branches(0, best, &pattern_lh, 200, 100, &mut rng)
                .unwrap();
            pt.tree
                .internal_nodes()
                .into_iter()
                .filter_map(|n| pt.tree.node(n).name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(12345), run(12345));
    }
}
