//! Pairwise distance matrices.
//!
//! The `N x N` symmetric matrix (zero diagonal, flat row-major) is computed
//! over the `N(N-1)/2` ordered pairs, Jukes-Cantor by default or by
//! optimizing the pairwise divergence under the attached model. The
//! pairwise loop is embarrassingly parallel and runs under `rayon` when the
//! `parallel` feature is enabled. Matrices are dumped next to the run
//! prefix as `.jcdist`, `.mldist`, or `.obsdist` depending on their origin.

use std::path::{Path, PathBuf};

use log::info;
use physalia_core::Result;

use crate::minimizer::minimize_one_dimen;
use crate::phylo::PhyloTree;
use crate::{MAX_BRANCH_LEN, MIN_BRANCH_LEN, TOL_BRANCH_LEN};

/// Floyd-Warshall shortcut correction: no distance may exceed the shortest
/// path through intermediate taxa. Returns the longest corrected distance.
pub fn correct_dist(dist: &mut [f64], n: usize) -> f64 {
    for k in 0..n {
        for i in 0..n {
            for j in 0..n {
                let through = dist[i * n + k] + dist[k * n + j];
                if dist[i * n + j] > through {
                    dist[i * n + j] = through;
                }
            }
        }
    }
    dist.iter().cloned().fold(0.0, f64::max)
}

impl PhyloTree {
    /// Distance between two sequences: Jukes-Cantor, refined by pairwise
    /// maximum likelihood when a model stack is attached.
    pub fn compute_dist(&self, seq1: usize, seq2: usize, initial_dist: f64) -> f64 {
        let initial = if initial_dist == 0.0 {
            self.aln.compute_dist(seq1, seq2)
        } else {
            initial_dist
        };
        if self.models.is_none() {
            return initial;
        }
        self.optimize_pairwise_dist(seq1, seq2, initial)
    }

    /// Maximize the two-sequence likelihood over the divergence time with
    /// the 1-D minimizer.
    fn optimize_pairwise_dist(&self, seq1: usize, seq2: usize, initial: f64) -> f64 {
        let stack = match self.models.as_ref() {
            Some(s) => s,
            None => return initial,
        };
        let nstates = self.aln.num_states();
        let ncat = stack.site_rate.get_n_rate();
        let p_invar = stack.site_rate.get_p_invar();
        let p_var_cat = (1.0 - p_invar) / ncat as f64;
        let tsize = stack.model.get_trans_matrix_size();
        let mut state_freq = vec![0.0; nstates];
        stack.model.get_state_frequency(&mut state_freq);

        // Frequency-weighted counts over definite state pairs.
        let mut counts = vec![0.0f64; nstates * nstates];
        for ptn in 0..self.aln.size() {
            let a = self.aln.state(ptn, seq1) as usize;
            let b = self.aln.state(ptn, seq2) as usize;
            if a < nstates && b < nstates {
                counts[a * nstates + b] += self.ptn_freq[ptn];
            }
        }

        let mut trans = vec![0.0; tsize];
        let mut objective = |t: f64| -> f64 {
            let mut lh_pair = vec![0.0f64; nstates * nstates];
            for cat in 0..ncat {
                stack.factory.compute_trans_matrix_freq(
                    t * stack.site_rate.get_rate(cat),
                    &state_freq,
                    &mut trans,
                );
                for (cell, &p) in lh_pair.iter_mut().zip(trans.iter()) {
                    *cell += p * p_var_cat;
                }
            }
            if p_invar > 0.0 {
                for s in 0..nstates {
                    lh_pair[s * nstates + s] += p_invar * state_freq[s];
                }
            }
            let mut neg_logl = 0.0;
            for (cell, &count) in lh_pair.iter().zip(counts.iter()) {
                if count > 0.0 {
                    neg_logl -= count * cell.max(f64::MIN_POSITIVE).ln();
                }
            }
            neg_logl
        };
        let guess = initial.clamp(MIN_BRANCH_LEN, MAX_BRANCH_LEN);
        let (optx, _) = minimize_one_dimen(
            MIN_BRANCH_LEN,
            guess,
            MAX_BRANCH_LEN,
            TOL_BRANCH_LEN,
            &mut objective,
        );
        optx
    }

    /// Fill the full distance matrix and apply the shortcut correction.
    /// Returns the longest corrected distance.
    pub fn compute_dist_matrix(&self, dist: &mut [f64]) -> f64 {
        let n = self.aln.n_seq();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();

        #[cfg(feature = "parallel")]
        let computed: Vec<f64> = {
            use rayon::prelude::*;
            pairs
                .par_iter()
                .map(|&(i, j)| self.compute_dist(i, j, dist[i * n + j]))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let computed: Vec<f64> = pairs
            .iter()
            .map(|&(i, j)| self.compute_dist(i, j, dist[i * n + j]))
            .collect();

        for (&(i, j), &d) in pairs.iter().zip(&computed) {
            dist[i * n + j] = d;
            dist[j * n + i] = d;
        }
        for i in 0..n {
            dist[i * n + i] = 0.0;
        }
        correct_dist(dist, n)
    }

    /// Fill the matrix of observed (p-) distances.
    pub fn compute_obs_dist_matrix(&self, dist: &mut [f64]) -> f64 {
        let n = self.aln.n_seq();
        for i in 0..n {
            dist[i * n + i] = 0.0;
            for j in (i + 1)..n {
                let d = self.aln.compute_obs_dist(i, j);
                dist[i * n + j] = d;
                dist[j * n + i] = d;
            }
        }
        correct_dist(dist, n)
    }

    /// Compute (or read) the distance matrix and persist it next to the
    /// run prefix: `.mldist` with a model attached, `.jcdist` otherwise.
    ///
    /// Returns the file written (or read) and the longest distance.
    pub fn compute_dist_file(
        &self,
        out_prefix: &str,
        read_from: Option<&Path>,
        dist: &mut [f64],
    ) -> Result<(PathBuf, f64)> {
        if let Some(path) = read_from {
            let longest = self.aln.read_dist(path, dist)?;
            return Ok((path.to_path_buf(), longest));
        }
        let suffix = if self.models.is_some() {
            ".mldist"
        } else {
            ".jcdist"
        };
        let path = PathBuf::from(format!("{}{}", out_prefix, suffix));
        info!("computing pairwise distances into {}", path.display());
        let longest = self.compute_dist_matrix(dist);
        self.aln.print_dist(&path, dist)?;
        Ok((path, longest))
    }

    /// Compute the observed-distance matrix and persist it as `.obsdist`.
    pub fn compute_obs_dist_file(
        &self,
        out_prefix: &str,
        dist: &mut [f64],
    ) -> Result<(PathBuf, f64)> {
        let path = PathBuf::from(format!("{}.obsdist", out_prefix));
        let longest = self.compute_obs_dist_matrix(dist);
        self.aln.print_dist(&path, dist)?;
        Ok((path, longest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::model::{Jc69, UniformRate};

    fn aln() -> Alignment {
        Alignment::from_sequences(
            &["A", "B", "C", "D"],
            &[
                b"ACGTACGTACACGTACGTAC",
                b"ACGTACGTAGACGTACGTAG",
                b"ACGTACGTTCACGTACGTTC",
                b"ACGTACGTTGACGTACGTTG",
            ],
        )
        .unwrap()
    }

    fn engine(with_model: bool) -> PhyloTree {
        let mut pt = PhyloTree::new(aln());
        if with_model {
            pt.set_model(
                Box::new(Jc69::new()),
                Box::new(Jc69::new()),
                Box::new(UniformRate::default()),
            );
        }
        pt
    }

    #[test]
    fn matrix_symmetric_with_zero_diagonal() {
        let pt = engine(false);
        let n = pt.aln().n_seq();
        let mut dist = vec![0.0; n * n];
        pt.compute_dist_matrix(&mut dist);
        for i in 0..n {
            assert_eq!(dist[i * n + i], 0.0);
            for j in 0..n {
                assert_eq!(dist[i * n + j], dist[j * n + i]);
            }
        }
    }

    #[test]
    fn correct_dist_is_idempotent() {
        let pt = engine(false);
        let n = pt.aln().n_seq();
        let mut dist = vec![0.0; n * n];
        pt.compute_dist_matrix(&mut dist);
        let snapshot = dist.clone();
        correct_dist(&mut dist, n);
        assert_eq!(dist, snapshot);
    }

    #[test]
    fn shortcut_correction_applies() {
        // d(0,2) = 10 exceeds the path through 1 (2 + 2).
        let mut dist = vec![
            0.0, 2.0, 10.0, //
            2.0, 0.0, 2.0, //
            10.0, 2.0, 0.0,
        ];
        let longest = correct_dist(&mut dist, 3);
        assert_eq!(dist[2], 4.0);
        assert_eq!(longest, 4.0);
    }

    #[test]
    fn ml_distance_close_to_jc_for_jc_data() {
        // Under the JC model with uniform rates, the pairwise ML estimate
        // coincides with the analytic JC correction.
        let jc_only = engine(false);
        let with_model = engine(true);
        for (i, j) in [(0usize, 1usize), (0, 2), (1, 3)] {
            let jc = jc_only.compute_dist(i, j, 0.0);
            let ml = with_model.compute_dist(i, j, 0.0);
            assert!((jc - ml).abs() < 1e-3, "pair ({}, {}): {} vs {}", i, j, jc, ml);
        }
    }

    #[test]
    fn dist_file_naming_follows_origin() {
        let dir = std::env::temp_dir().join("physalia_dist_naming");
        std::fs::create_dir_all(&dir).unwrap();
        let prefix = dir.join("run").to_string_lossy().into_owned();

        let pt = engine(false);
        let n = pt.aln().n_seq();
        let mut dist = vec![0.0; n * n];
        let (jc_path, _) = pt.compute_dist_file(&prefix, None, &mut dist).unwrap();
        assert!(jc_path.to_string_lossy().ends_with(".jcdist"));

        let pt = engine(true);
        let mut dist = vec![0.0; n * n];
        let (ml_path, _) = pt.compute_dist_file(&prefix, None, &mut dist).unwrap();
        assert!(ml_path.to_string_lossy().ends_with(".mldist"));

        let mut dist = vec![0.0; n * n];
        let (obs_path, _) = pt.compute_obs_dist_file(&prefix, &mut dist).unwrap();
        assert!(obs_path.to_string_lossy().ends_with(".obsdist"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn dist_file_read_back() {
        let dir = std::env::temp_dir().join("physalia_dist_readback");
        std::fs::create_dir_all(&dir).unwrap();
        let prefix = dir.join("run").to_string_lossy().into_owned();

        let pt = engine(false);
        let n = pt.aln().n_seq();
        let mut dist = vec![0.0; n * n];
        let (path, longest) = pt.compute_dist_file(&prefix, None, &mut dist).unwrap();

        let mut back = vec![0.0; n * n];
        let (_, longest2) = pt
            .compute_dist_file(&prefix, Some(&path), &mut back)
            .unwrap();
        assert!((longest - longest2).abs() < 1e-9);
        for (a, b) in dist.iter().zip(&back) {
            assert!((a - b).abs() < 1e-9);
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
