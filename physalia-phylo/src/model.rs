//! Substitution model, transition-matrix factory, and rate-heterogeneity
//! interfaces consumed by the likelihood engine, plus the Jukes-Cantor
//! implementation used by default and throughout the tests.
//!
//! Transition matrices are flat row-major `nstates * nstates` slices so a
//! state row can be addressed with a single offset in the hot loops.

use physalia_core::{PhysaliaError, Result};

/// A time-reversible substitution model.
pub trait SubstModel {
    /// Model name for reporting.
    fn name(&self) -> &str;

    /// Alphabet size.
    fn num_states(&self) -> usize;

    /// Equilibrium state frequencies, written into `out`.
    fn get_state_frequency(&self, out: &mut [f64]);

    /// Length of one transition matrix (`nstates * nstates`).
    fn get_trans_matrix_size(&self) -> usize {
        self.num_states() * self.num_states()
    }

    /// True if each pattern carries its own model.
    fn is_site_specific_model(&self) -> bool {
        false
    }

    /// Model id for a pattern (site-specific models only).
    fn get_ptn_model_id(&self, _ptn: usize) -> usize {
        0
    }
}

/// Computes transition probability matrices and their branch-length
/// derivatives for a model.
pub trait ModelFactory {
    /// `out[i*n + j] = P(t)[i, j]`.
    fn compute_trans_matrix(&self, t: f64, out: &mut [f64]);

    /// `out[i*n + j] = freq[i] * P(t)[i, j]`.
    fn compute_trans_matrix_freq(&self, t: f64, freq: &[f64], out: &mut [f64]);

    /// Probability matrix and its first and second derivatives in `t` for a
    /// branch of length `t` evolving at `rate`, each row-weighted by `freq`.
    fn compute_trans_derv_freq(
        &self,
        t: f64,
        rate: f64,
        freq: &[f64],
        p: &mut [f64],
        d1: &mut [f64],
        d2: &mut [f64],
    );
}

/// Among-site rate heterogeneity.
pub trait SiteRate {
    /// Rate model name for reporting.
    fn name(&self) -> &str;

    /// Number of rate categories.
    fn get_n_rate(&self) -> usize;

    /// Number of discrete categories with precomputable transitions.
    fn get_n_discrete_rate(&self) -> usize {
        self.get_n_rate()
    }

    /// Rate of a category.
    fn get_rate(&self, cat: usize) -> f64;

    /// Proportion of invariable sites.
    fn get_p_invar(&self) -> f64 {
        0.0
    }

    /// True if each pattern carries its own rate.
    fn is_site_specific_rate(&self) -> bool {
        false
    }

    /// Rate of a pattern (site-specific rates only).
    fn get_ptn_rate(&self, _ptn: usize) -> f64 {
        1.0
    }

    /// Category of a pattern, or a negative value when patterns are not
    /// pre-assigned to categories.
    fn get_ptn_cat(&self, _ptn: usize) -> isize {
        -1
    }
}

/// Jukes-Cantor 1969: equal base frequencies, one substitution rate.
///
/// `P(same) = 1/4 + 3/4 e^{-4t/3}`, `P(diff) = 1/4 - 1/4 e^{-4t/3}`,
/// with closed-form first and second derivatives in `t`.
#[derive(Debug, Clone, Default)]
pub struct Jc69;

impl Jc69 {
    pub fn new() -> Self {
        Self
    }

    fn fill(t: f64, out: &mut [f64], row_weight: &[f64; 4], deriv: u8) {
        let e = (-4.0 * t / 3.0).exp();
        let (same, diff) = match deriv {
            0 => (0.25 + 0.75 * e, 0.25 - 0.25 * e),
            1 => (-e, e / 3.0),
            _ => (4.0 / 3.0 * e, -4.0 / 9.0 * e),
        };
        for i in 0..4 {
            for j in 0..4 {
                out[i * 4 + j] = row_weight[i] * if i == j { same } else { diff };
            }
        }
    }
}

impl SubstModel for Jc69 {
    fn name(&self) -> &str {
        "JC"
    }

    fn num_states(&self) -> usize {
        4
    }

    fn get_state_frequency(&self, out: &mut [f64]) {
        out[..4].fill(0.25);
    }
}

impl ModelFactory for Jc69 {
    fn compute_trans_matrix(&self, t: f64, out: &mut [f64]) {
        Self::fill(t, out, &[1.0; 4], 0);
    }

    fn compute_trans_matrix_freq(&self, t: f64, freq: &[f64], out: &mut [f64]) {
        let w = [freq[0], freq[1], freq[2], freq[3]];
        Self::fill(t, out, &w, 0);
    }

    fn compute_trans_derv_freq(
        &self,
        t: f64,
        rate: f64,
        freq: &[f64],
        p: &mut [f64],
        d1: &mut [f64],
        d2: &mut [f64],
    ) {
        let u = t * rate;
        let w = [freq[0], freq[1], freq[2], freq[3]];
        Self::fill(u, p, &w, 0);
        let w1 = [w[0] * rate, w[1] * rate, w[2] * rate, w[3] * rate];
        Self::fill(u, d1, &w1, 1);
        let r2 = rate * rate;
        let w2 = [w[0] * r2, w[1] * r2, w[2] * r2, w[3] * r2];
        Self::fill(u, d2, &w2, 2);
    }
}

/// A single rate category, optionally with invariable sites.
#[derive(Debug, Clone)]
pub struct UniformRate {
    p_invar: f64,
}

impl UniformRate {
    pub fn new(p_invar: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&p_invar) {
            return Err(PhysaliaError::InvalidInput(format!(
                "p_invar {} outside [0, 1]",
                p_invar
            )));
        }
        Ok(Self { p_invar })
    }
}

impl Default for UniformRate {
    fn default() -> Self {
        Self { p_invar: 0.0 }
    }
}

impl SiteRate for UniformRate {
    fn name(&self) -> &str {
        ""
    }

    fn get_n_rate(&self) -> usize {
        1
    }

    fn get_rate(&self, _cat: usize) -> f64 {
        1.0
    }

    fn get_p_invar(&self) -> f64 {
        self.p_invar
    }
}

/// Discrete rate categories with equal weights (e.g. discretized gamma).
#[derive(Debug, Clone)]
pub struct CategorizedRate {
    rates: Vec<f64>,
    p_invar: f64,
}

impl CategorizedRate {
    pub fn new(rates: Vec<f64>, p_invar: f64) -> Result<Self> {
        if rates.is_empty() {
            return Err(PhysaliaError::InvalidInput("no rate categories".into()));
        }
        if rates.iter().any(|&r| r <= 0.0) {
            return Err(PhysaliaError::InvalidInput(
                "rate categories must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&p_invar) {
            return Err(PhysaliaError::InvalidInput(format!(
                "p_invar {} outside [0, 1]",
                p_invar
            )));
        }
        Ok(Self { rates, p_invar })
    }
}

impl SiteRate for CategorizedRate {
    fn name(&self) -> &str {
        "+R"
    }

    fn get_n_rate(&self) -> usize {
        self.rates.len()
    }

    fn get_rate(&self, cat: usize) -> f64 {
        self.rates[cat]
    }

    fn get_p_invar(&self) -> f64 {
        self.p_invar
    }
}

/// One rate per alignment pattern.
#[derive(Debug, Clone)]
pub struct SiteSpecificRate {
    ptn_rates: Vec<f64>,
}

impl SiteSpecificRate {
    pub fn new(ptn_rates: Vec<f64>) -> Result<Self> {
        if ptn_rates.iter().any(|&r| r < 0.0) {
            return Err(PhysaliaError::InvalidInput(
                "pattern rates must be non-negative".into(),
            ));
        }
        Ok(Self { ptn_rates })
    }
}

impl SiteRate for SiteSpecificRate {
    fn name(&self) -> &str {
        "+SSR"
    }

    fn get_n_rate(&self) -> usize {
        1
    }

    fn get_rate(&self, _cat: usize) -> f64 {
        1.0
    }

    fn is_site_specific_rate(&self) -> bool {
        true
    }

    fn get_ptn_rate(&self, ptn: usize) -> f64 {
        self.ptn_rates[ptn]
    }
}
