//! Search configuration.

/// Options controlling the tree search.
///
/// Every randomized step draws from a single PRNG seeded with `seed`, so a
/// fixed configuration reproduces the same search exactly.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchConfig {
    /// Per-leaf deletion probability in the IQP perturbation.
    pub p_delete: f64,
    /// Representative-leaf set size per subtree for quartet voting.
    pub k_represent: usize,
    /// Number of IQP outer iterations.
    pub iqpnni_iterations: usize,
    /// Maximum edge distance for SPR reinsertion.
    pub spr_radius: usize,
    /// Use Newton-Raphson instead of Brent for 1-D branch optimization.
    pub optimize_by_newton: bool,
    /// Drop patterns whose site-specific rate exceeds `MAX_SITE_RATE`.
    pub discard_saturated_site: bool,
    /// Fall back to the per-edge-greedy NNI instead of the fast variant.
    pub simple_nni: bool,
    /// Apply the lambda-blended simultaneous branch update after fast NNI.
    pub phyml_opt: bool,
    /// PRNG seed.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            p_delete: 0.3,
            k_represent: 4,
            iqpnni_iterations: 100,
            spr_radius: 10,
            optimize_by_newton: false,
            discard_saturated_site: true,
            simple_nni: false,
            phyml_opt: false,
            seed: 42,
        }
    }
}
