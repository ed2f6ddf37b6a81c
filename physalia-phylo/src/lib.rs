//! Maximum-likelihood phylogenetic tree search.
//!
//! Provides the core inference engine: an unrooted binary tree store with
//! directional half-edge caches, a partial-likelihood engine with
//! numerical scaling, Fitch parsimony on bit-packed state sets,
//! branch-length optimization, stepwise-addition tree construction,
//! NNI and SPR topology search, the IQP perturbation loop, and SH-like
//! aLRT branch support with RELL resampling.
//!
//! # Quick start
//!
//! ```
//! use physalia_phylo::newick;
//!
//! let tree = newick::parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
//! assert_eq!(tree.leaf_count(), 4);
//! assert_eq!(tree.node_count(), 6);
//! ```

pub mod alignment;
pub mod config;
pub mod construct;
pub mod distance;
pub mod iqp;
pub mod likelihood;
pub mod minimizer;
pub mod model;
pub mod newick;
pub mod nni;
pub mod optimize;
pub mod parsimony;
pub mod phylo;
pub mod rng;
pub mod spr;
pub mod stateset;
pub mod stepwise;
pub mod support;
pub mod tree;

pub use alignment::{Alignment, Pattern, MAX_GENETIC_DIST, STATE_UNKNOWN};
pub use config::SearchConfig;
pub use construct::bionj_tree;
pub use distance::correct_dist;
pub use model::{
    CategorizedRate, Jc69, ModelFactory, SiteRate, SiteSpecificRate, SubstModel, UniformRate,
};
pub use nni::NniMove;
pub use phylo::{ModelStack, PhyloTree};
pub use rng::Xorshift64;
pub use spr::{SprMove, SprMoves};
pub use tree::{Neighbor, Node, NodeId, Tree};

/// Smallest admissible branch length.
pub const MIN_BRANCH_LEN: f64 = 1e-6;
/// Largest admissible branch length.
pub const MAX_BRANCH_LEN: f64 = 9.0;
/// Convergence tolerance for 1-D branch-length optimization.
pub const TOL_BRANCH_LEN: f64 = 1e-6;
/// Convergence tolerance on log-likelihood improvements.
pub const TOL_LIKELIHOOD: f64 = 1e-6;
/// Partial-likelihood entries below this trigger a scaling event.
pub const SCALING_THRESHOLD: f64 = 1e-100;
/// `ln(SCALING_THRESHOLD)`, accumulated per scaling event.
pub const LOG_SCALING_THRESHOLD: f64 = -230.258_509_299_404_58;
/// Site-specific rates at or above this mark a site as saturated.
pub const MAX_SITE_RATE: f64 = 10.0;
/// Capacity of the SPR candidate-move buffer.
pub const MAX_SPR_MOVES: usize = 20;
/// Minimum edge distance before SPR regraft points are considered.
pub const SPR_DEPTH: usize = 2;
