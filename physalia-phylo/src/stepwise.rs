//! Greedy stepwise addition: build a tree by inserting taxa one at a time
//! at the best-scoring edge, by parsimony or by likelihood.
//!
//! A new taxon arrives attached to a fresh internal node whose two other
//! neighbor slots are reserved (`None`) until an insertion edge is chosen;
//! every edge of the current tree is tried by temporarily bisecting it.

use log::{debug, info};
use physalia_core::{PhysaliaError, Result};

use crate::phylo::PhyloTree;
use crate::tree::{NodeId, Tree};
use crate::TOL_LIKELIHOOD;

/// Outcome of scanning one subtree for the best insertion edge.
struct Placement<S> {
    score: S,
    node: NodeId,
    dad: NodeId,
}

impl PhyloTree {
    /// Build a tree over the whole alignment by stepwise addition under
    /// maximum parsimony. Returns the final parsimony score.
    pub fn grow_tree_mp(&mut self) -> Result<u32> {
        info!("stepwise addition using maximum parsimony");
        let size = self.aln.n_seq();
        if size < 3 {
            return Err(PhysaliaError::InvalidInput(format!(
                "cannot grow a tree over {} taxa",
                size
            )));
        }
        self.start_star()?;
        for leaf_idx in 3..size {
            debug!("add {} to the tree", self.aln.get_seq_name(leaf_idx));
            let (added, _taxon) = self.new_taxon_pair(leaf_idx);
            let entry = self.require_entry()?;
            let start = self.tree.node(entry).neighbors[0].peer();
            let best = self.add_taxon_mp(added, start, entry)?;
            debug!("best insertion score {}", best.score);
            self.insert_added(added, best.node, best.dad);
        }
        self.initialized = false;
        self.compute_parsimony_score()
    }

    /// Build a tree over the whole alignment by stepwise addition under
    /// maximum likelihood, with branch optimization and an NNI pass after
    /// every insertion. Returns the final log-likelihood.
    pub fn grow_tree_ml(&mut self) -> Result<f64> {
        info!("stepwise addition using maximum likelihood");
        let size = self.aln.n_seq();
        if size < 3 {
            return Err(PhysaliaError::InvalidInput(format!(
                "cannot grow a tree over {} taxa",
                size
            )));
        }
        self.start_star()?;
        self.initialize_partial_lh()?;
        self.optimize_all_branches(100, TOL_LIKELIHOOD)?;
        for leaf_idx in 3..size {
            debug!("add {} to the tree", self.aln.get_seq_name(leaf_idx));
            let (added, taxon) = self.new_taxon_pair(leaf_idx);
            // The four floating half-edges need cache blocks for the trials:
            // the taxon edge both ways plus the two reserved slots.
            let s0 = self.grab_scratch();
            let s1 = self.grab_scratch();
            let s2 = self.grab_scratch();
            let s3 = self.grab_scratch();
            self.tree.node_mut(added).neighbors[0].slot = Some(s0);
            self.tree.node_mut(taxon).neighbors[0].slot = Some(s1);
            self.tree.node_mut(added).neighbors[1].slot = Some(s2);
            self.tree.node_mut(added).neighbors[2].slot = Some(s3);

            let entry = self.require_entry()?;
            let start = self.tree.node(entry).neighbors[0].peer();
            let best = self.add_taxon_ml(added, start, entry)?;
            self.insert_added(added, best.node, best.dad);
            self.initialize_partial_lh()?;
            let lh = self.optimize_all_branches(100, TOL_LIKELIHOOD)?;
            debug!("log-likelihood after insertion: {}", lh);
            self.optimize_nni()?;
        }
        self.compute_likelihood(None)
    }

    /// Star over the first three taxa; the entry is taxon 0.
    fn start_star(&mut self) -> Result<()> {
        self.tree = Tree::new();
        let center = self.tree.add_node(None);
        for leaf in 0..3 {
            let name = self.aln.get_seq_name(leaf).to_string();
            let taxon = self.tree.add_node(Some(name));
            self.tree.node_mut(taxon).id = leaf;
            self.tree.connect(center, taxon, 1.0);
            if leaf == 0 {
                self.tree.set_entry(taxon);
            }
        }
        self.initialized = false;
        Ok(())
    }

    /// Allocate the new taxon leaf and its carrier internal node with two
    /// reserved neighbor slots.
    fn new_taxon_pair(&mut self, leaf_idx: usize) -> (NodeId, NodeId) {
        let name = self.aln.get_seq_name(leaf_idx).to_string();
        let taxon = self.tree.add_node(Some(name));
        self.tree.node_mut(taxon).id = leaf_idx;
        let added = self.tree.add_node(None);
        self.tree.connect(added, taxon, 1.0);
        self.tree.add_neighbor(added, None, 1.0);
        self.tree.add_neighbor(added, None, 1.0);
        (added, taxon)
    }

    /// Temporarily bisect the edge `(node, dad)` with `added`.
    fn splice_in(&mut self, added: NodeId, node: NodeId, dad: NodeId) -> f64 {
        let len = self.tree.branch_length(dad, node);
        self.tree.update_neighbor(node, dad, added, Some(len / 2.0));
        self.tree.update_neighbor(dad, node, added, Some(len / 2.0));
        self.tree
            .update_neighbor_at(added, 1, Some(node), Some(len / 2.0));
        self.tree
            .update_neighbor_at(added, 2, Some(dad), Some(len / 2.0));
        len
    }

    /// Undo [`PhyloTree::splice_in`].
    fn splice_out(&mut self, added: NodeId, node: NodeId, dad: NodeId, len: f64) {
        self.tree.update_neighbor(node, added, dad, Some(len));
        self.tree.update_neighbor(dad, added, node, Some(len));
        self.tree.update_neighbor_at(added, 1, None, Some(len));
        self.tree.update_neighbor_at(added, 2, None, Some(len));
    }

    /// Permanently bisect the edge `(node, dad)` with `added`.
    fn insert_added(&mut self, added: NodeId, node: NodeId, dad: NodeId) {
        self.splice_in(added, node, dad);
    }

    fn add_taxon_mp(&mut self, added: NodeId, node: NodeId, dad: NodeId) -> Result<Placement<u32>> {
        let len = self.splice_in(added, node, dad);
        let score = self.compute_parsimony_score()?;
        self.splice_out(added, node, dad, len);
        let mut best = Placement { score, node, dad };

        for child in self.tree.adjacent(node, Some(dad)) {
            let candidate = self.add_taxon_mp(added, child, node)?;
            if candidate.score < best.score {
                best = candidate;
            }
        }
        Ok(best)
    }

    fn add_taxon_ml(&mut self, added: NodeId, node: NodeId, dad: NodeId) -> Result<Placement<f64>> {
        let len = self.splice_in(added, node, dad);
        self.tree.clear_all_partial();
        let score = self.optimize_child_branches(added, None)?;
        self.splice_out(added, node, dad, len);
        self.tree.clear_all_partial();
        let mut best = Placement { score, node, dad };

        for child in self.tree.adjacent(node, Some(dad)) {
            let candidate = self.add_taxon_ml(added, child, node)?;
            if candidate.score > best.score {
                best = candidate;
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use crate::alignment::Alignment;
    use crate::model::{Jc69, UniformRate};
    use crate::phylo::PhyloTree;

    fn engine(seqs: &[(&str, &[u8])]) -> PhyloTree {
        let names: Vec<&str> = seqs.iter().map(|(n, _)| *n).collect();
        let data: Vec<&[u8]> = seqs.iter().map(|(_, s)| *s).collect();
        let aln = Alignment::from_sequences(&names, &data).unwrap();
        let mut pt = PhyloTree::new(aln);
        pt.set_model(
            Box::new(Jc69::new()),
            Box::new(Jc69::new()),
            Box::new(UniformRate::default()),
        );
        pt
    }

    fn quartet_data() -> Vec<(&'static str, &'static [u8])> {
        vec![
            ("A", b"ACGTACGTAC"),
            ("B", b"ACGTACGTAG"),
            ("C", b"ACGTACGTTC"),
            ("D", b"ACGTACGTTG"),
        ]
    }

    #[test]
    fn three_taxa_build_a_star() {
        let mut pt = engine(&[("A", b"ACGT"), ("B", b"ACGA"), ("C", b"ACTT")]);
        pt.grow_tree_mp().unwrap();
        assert_eq!(pt.tree.leaf_count(), 3);
        assert_eq!(pt.tree.internal_nodes().len(), 1);
        pt.tree.check_binary().unwrap();
    }

    #[test]
    fn mp_growth_reaches_optimal_score() {
        let mut pt = engine(&quartet_data());
        let score = pt.grow_tree_mp().unwrap();
        assert_eq!(pt.tree.leaf_count(), 4);
        pt.tree.check_binary().unwrap();
        // The best quartet for this alignment costs 3 changes.
        assert_eq!(score, 3);
    }

    #[test]
    fn mp_growth_matches_cached_parsimony() {
        let mut pt = engine(&quartet_data());
        let score = pt.grow_tree_mp().unwrap();
        assert_eq!(pt.compute_parsimony().unwrap(), score);
    }

    #[test]
    fn ml_growth_produces_valid_tree() {
        let mut pt = engine(&quartet_data());
        let lh = pt.grow_tree_ml().unwrap();
        assert!(lh.is_finite() && lh < 0.0);
        assert_eq!(pt.tree.leaf_count(), 4);
        pt.tree.check_binary().unwrap();
    }

    #[test]
    fn ml_growth_separates_clear_clades() {
        // Two well-separated pairs: (A, B) vs (C, D).
        let mut pt = engine(&[
            ("A", b"AAAAAAAACCCCCCCC"),
            ("B", b"AAAAAAAACCCCCCCG"),
            ("C", b"TTTTTTTTGGGGGGGG"),
            ("D", b"TTTTTTTTGGGGGGGA"),
        ]);
        pt.grow_tree_ml().unwrap();
        let splits: Vec<Vec<String>> = pt.tree.splits().into_iter().map(|(n, _)| n).collect();
        let ab = vec!["A".to_string(), "B".to_string()];
        let cd = vec!["C".to_string(), "D".to_string()];
        assert!(
            splits.contains(&ab) || splits.contains(&cd),
            "expected the AB|CD split, got {:?}",
            splits
        );
    }

    #[test]
    fn five_taxa_growth() {
        let mut pt = engine(&[
            ("A", b"AAAAAAAAAACCCCCCCCCC"),
            ("B", b"AAAAAAAAAACCCCCCCCCG"),
            ("C", b"AAAAAAAAAAGGGGGGGGGG"),
            ("D", b"TTTTTTTTTTGGGGGGGGGG"),
            ("E", b"TTTTTTTTTTGGGGGGGGGA"),
        ]);
        let score = pt.grow_tree_mp().unwrap();
        assert_eq!(pt.tree.leaf_count(), 5);
        pt.tree.check_binary().unwrap();
        assert!(score > 0);
    }
}
