//! Distance-based starting trees: BIONJ agglomeration.
//!
//! BIONJ is neighbor-joining with variance-weighted matrix updates: each
//! agglomeration picks the Q-criterion minimum, estimates the two branch
//! lengths from net divergences, and propagates both the distances and
//! their variances to the merged cluster using a weight `lambda` chosen to
//! minimize the variance of the updated entries.

use log::info;
use physalia_core::{PhysaliaError, Result};

use crate::phylo::PhyloTree;
use crate::tree::{NodeId, Tree};
use crate::MIN_BRANCH_LEN;

/// Build an unrooted BIONJ tree from a flat `N x N` distance matrix.
pub fn bionj_tree(dist: &[f64], names: &[String]) -> Result<Tree> {
    let n = names.len();
    if n < 3 {
        return Err(PhysaliaError::InvalidInput(format!(
            "BIONJ needs at least 3 taxa, got {}",
            n
        )));
    }
    if dist.len() != n * n {
        return Err(PhysaliaError::InvalidInput(format!(
            "distance matrix has {} entries, expected {}",
            dist.len(),
            n * n
        )));
    }

    let mut tree = Tree::new();
    let mut active: Vec<NodeId> = Vec::with_capacity(n);
    for name in names {
        active.push(tree.add_node(Some(name.clone())));
    }

    // Working copies of the distance and variance matrices; BIONJ seeds the
    // variances with the distances themselves.
    let mut d: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| dist[i * n + j]).collect())
        .collect();
    let mut v = d.clone();
    let mut m = n;

    while m > 3 {
        let r: Vec<f64> = (0..m).map(|i| (0..m).map(|k| d[i][k]).sum()).collect();

        // Q-criterion minimum over ordered pairs.
        let (mut best_i, mut best_j) = (0, 1);
        let mut best_q = f64::INFINITY;
        for i in 0..m {
            for j in (i + 1)..m {
                let q = (m as f64 - 2.0) * d[i][j] - r[i] - r[j];
                if q < best_q {
                    best_q = q;
                    best_i = i;
                    best_j = j;
                }
            }
        }
        let (i, j) = (best_i, best_j);

        let li = d[i][j] / 2.0 + (r[i] - r[j]) / (2.0 * (m as f64 - 2.0));
        let lj = d[i][j] - li;

        // Variance-weighted lambda, clamped into [0, 1].
        let lambda = if v[i][j] > 0.0 {
            let sum: f64 = (0..m)
                .filter(|&k| k != i && k != j)
                .map(|k| v[j][k] - v[i][k])
                .sum();
            (0.5 + sum / (2.0 * (m as f64 - 2.0) * v[i][j])).clamp(0.0, 1.0)
        } else {
            0.5
        };

        let u = tree.add_node(None);
        tree.connect(u, active[i], li);
        tree.connect(u, active[j], lj);

        for k in 0..m {
            if k == i || k == j {
                continue;
            }
            let dk = lambda * (d[i][k] - li) + (1.0 - lambda) * (d[j][k] - lj);
            let vk = lambda * v[i][k] + (1.0 - lambda) * v[j][k] - lambda * (1.0 - lambda) * v[i][j];
            d[i][k] = dk;
            d[k][i] = dk;
            v[i][k] = vk;
            v[k][i] = vk;
        }
        active[i] = u;

        // Swap-remove cluster j: the last cluster takes its index.
        let last = m - 1;
        if j != last {
            active[j] = active[last];
            for k in 0..m {
                d[j][k] = d[last][k];
                v[j][k] = v[last][k];
            }
            for k in 0..m {
                d[k][j] = d[k][last];
                v[k][j] = v[k][last];
            }
            d[j][j] = 0.0;
            v[j][j] = 0.0;
        }
        active.pop();
        for row in d.iter_mut() {
            row.truncate(last);
        }
        for row in v.iter_mut() {
            row.truncate(last);
        }
        d.truncate(last);
        v.truncate(last);
        m = last;
    }

    // Final trifurcation over the last three clusters.
    let center = tree.add_node(None);
    let l0 = (d[0][1] + d[0][2] - d[1][2]) / 2.0;
    let l1 = (d[0][1] + d[1][2] - d[0][2]) / 2.0;
    let l2 = (d[0][2] + d[1][2] - d[0][1]) / 2.0;
    tree.connect(center, active[0], l0);
    tree.connect(center, active[1], l1);
    tree.connect(center, active[2], l2);

    // Entry: the first leaf created.
    tree.set_entry(0);
    Ok(tree)
}

impl PhyloTree {
    /// Build the starting tree with BIONJ from a distance file produced by
    /// [`PhyloTree::compute_dist_file`]; negative estimates are clamped.
    pub fn compute_bionj(&mut self, dist_file: &std::path::Path) -> Result<()> {
        info!("computing BIONJ tree from {}", dist_file.display());
        let n = self.aln.n_seq();
        let mut dist = vec![0.0; n * n];
        self.aln.read_dist(dist_file, &mut dist)?;
        self.bionj_from_matrix(&dist)
    }

    /// Build the starting tree with BIONJ from an in-memory matrix.
    pub fn bionj_from_matrix(&mut self, dist: &[f64]) -> Result<()> {
        let names: Vec<String> = (0..self.aln.n_seq())
            .map(|i| self.aln.get_seq_name(i).to_string())
            .collect();
        self.tree = bionj_tree(dist, &names)?;
        self.tree.fix_negative_branch(MIN_BRANCH_LEN);
        self.assign_leaf_ids()?;
        self.initialize_partial_lh()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn three_taxa_trifurcation() {
        // Additive three-point distances: a = 1, b = 2, c = 3 from center.
        let dist = vec![
            0.0, 3.0, 4.0, //
            3.0, 0.0, 5.0, //
            4.0, 5.0, 0.0,
        ];
        let tree = bionj_tree(&dist, &names(&["A", "B", "C"])).unwrap();
        assert_eq!(tree.leaf_count(), 3);
        tree.check_binary().unwrap();
        let center = tree.internal_nodes()[0];
        let a = tree.find_leaf_by_name("A").unwrap();
        let b = tree.find_leaf_by_name("B").unwrap();
        let c = tree.find_leaf_by_name("C").unwrap();
        assert!((tree.branch_length(center, a) - 1.0).abs() < 1e-12);
        assert!((tree.branch_length(center, b) - 2.0).abs() < 1e-12);
        assert!((tree.branch_length(center, c) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn additive_quartet_recovered() {
        // Tree ((A:1,B:2)u:1,(C:1,D:2)v) with u-v length 1.
        // d(A,B) = 3, d(C,D) = 3, d(A,C) = 3, d(A,D) = 4, d(B,C) = 4, d(B,D) = 5.
        let dist = vec![
            0.0, 3.0, 3.0, 4.0, //
            3.0, 0.0, 4.0, 5.0, //
            3.0, 4.0, 0.0, 3.0, //
            4.0, 5.0, 3.0, 0.0,
        ];
        let tree = bionj_tree(&dist, &names(&["A", "B", "C", "D"])).unwrap();
        assert_eq!(tree.leaf_count(), 4);
        tree.check_binary().unwrap();
        let splits: Vec<Vec<String>> = tree.splits().into_iter().map(|(s, _)| s).collect();
        let ab = vec!["A".to_string(), "B".to_string()];
        let cd = vec!["C".to_string(), "D".to_string()];
        assert!(
            splits.contains(&ab) || splits.contains(&cd),
            "expected AB|CD, got {:?}",
            splits
        );
    }

    #[test]
    fn five_taxa_produce_binary_tree() {
        // Distances from a caterpillar with unit branches.
        let mut dist = vec![0.0; 25];
        let coords: [f64; 5] = [0.0, 2.0, 4.0, 6.0, 8.0];
        for i in 0..5 {
            for j in 0..5 {
                dist[i * 5 + j] = (coords[i] - coords[j]).abs();
            }
        }
        let tree = bionj_tree(&dist, &names(&["A", "B", "C", "D", "E"])).unwrap();
        assert_eq!(tree.leaf_count(), 5);
        tree.check_binary().unwrap();
    }

    #[test]
    fn too_few_taxa_rejected() {
        assert!(bionj_tree(&[0.0, 1.0, 1.0, 0.0], &names(&["A", "B"])).is_err());
    }

    #[test]
    fn matrix_size_checked() {
        assert!(bionj_tree(&[0.0; 8], &names(&["A", "B", "C"])).is_err());
    }
}
