//! Alignment with deduplicated site patterns.
//!
//! The engine never sees raw sites: columns are deduplicated into
//! [`Pattern`]s, each carrying the number of original sites it represents.
//! A site-to-pattern map is kept for bootstrap resampling and per-site
//! reporting.
//!
//! State encoding for an alphabet of `nstates` characters:
//! - `0..nstates`: a definite state;
//! - `nstates - 1 + mask` for an ambiguity bit-mask with two or more bits
//!   (IUPAC codes for DNA/RNA);
//! - [`STATE_UNKNOWN`] for gaps and fully unknown characters.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use physalia_core::{PhysaliaError, Result, Summarizable};

use crate::rng::Xorshift64;

/// Sentinel for a completely unknown character (gap, `N`, `?`).
pub const STATE_UNKNOWN: u8 = u8::MAX;

/// Cap for pairwise distances beyond the saturation limit of the correction.
pub const MAX_GENETIC_DIST: f64 = 9.0;

/// One deduplicated alignment column.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pattern {
    /// Per-sequence encoded states.
    pub states: Vec<u8>,
    /// Number of original sites collapsed into this pattern.
    pub frequency: u32,
    /// True if every sequence shows the same state.
    pub is_const: bool,
}

/// A multiple-sequence alignment presented as patterns.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Alignment {
    names: Vec<String>,
    patterns: Vec<Pattern>,
    site_to_pattern: Vec<usize>,
    num_states: usize,
    nsite: usize,
}

/// Map a nucleotide byte to its encoded state.
///
/// Definite bases map to `0..4`, IUPAC ambiguity codes to `3 + mask`, and
/// gaps / `N` / `?` to [`STATE_UNKNOWN`].
pub fn encode_dna(b: u8) -> u8 {
    match b.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' | b'U' => 3,
        // mask bits: A=1, C=2, G=4, T=8; encoded as 3 + mask
        b'M' => 3 + 0b0011,
        b'R' => 3 + 0b0101,
        b'W' => 3 + 0b1001,
        b'S' => 3 + 0b0110,
        b'Y' => 3 + 0b1010,
        b'K' => 3 + 0b1100,
        b'V' => 3 + 0b0111,
        b'H' => 3 + 0b1011,
        b'D' => 3 + 0b1101,
        b'B' => 3 + 0b1110,
        _ => STATE_UNKNOWN,
    }
}

/// Decode a state into its bit-mask over the alphabet.
pub fn state_mask(state: u8, nstates: usize) -> u64 {
    if state == STATE_UNKNOWN {
        (1u64 << nstates) - 1
    } else if (state as usize) < nstates {
        1u64 << state
    } else {
        (state as u64) - (nstates as u64 - 1)
    }
}

impl Alignment {
    /// Build an alignment from raw DNA sequences, deduplicating columns.
    pub fn from_sequences(names: &[&str], seqs: &[&[u8]]) -> Result<Self> {
        if names.len() != seqs.len() {
            return Err(PhysaliaError::InvalidInput(format!(
                "{} names for {} sequences",
                names.len(),
                seqs.len()
            )));
        }
        if seqs.len() < 3 {
            return Err(PhysaliaError::InvalidInput(format!(
                "need at least 3 sequences, got {}",
                seqs.len()
            )));
        }
        let nsite = seqs[0].len();
        if nsite == 0 {
            return Err(PhysaliaError::InvalidInput("empty sequences".into()));
        }
        for (i, s) in seqs.iter().enumerate() {
            if s.len() != nsite {
                return Err(PhysaliaError::InvalidInput(format!(
                    "sequence {} has length {}, expected {}",
                    names[i],
                    s.len(),
                    nsite
                )));
            }
        }

        let encoded: Vec<Vec<u8>> = seqs
            .iter()
            .map(|s| s.iter().map(|&b| encode_dna(b)).collect())
            .collect();
        Self::from_encoded(
            names.iter().map(|s| s.to_string()).collect(),
            &encoded,
            4,
        )
    }

    /// Build an alignment from pre-encoded state columns.
    pub fn from_encoded(names: Vec<String>, seqs: &[Vec<u8>], num_states: usize) -> Result<Self> {
        let nsite = seqs[0].len();
        let nseq = seqs.len();
        let mut patterns: Vec<Pattern> = Vec::new();
        let mut site_to_pattern = Vec::with_capacity(nsite);

        for site in 0..nsite {
            let column: Vec<u8> = (0..nseq).map(|s| seqs[s][site]).collect();
            match patterns.iter().position(|p| p.states == column) {
                Some(id) => {
                    patterns[id].frequency += 1;
                    site_to_pattern.push(id);
                }
                None => {
                    let is_const = column.windows(2).all(|w| w[0] == w[1]);
                    site_to_pattern.push(patterns.len());
                    patterns.push(Pattern {
                        states: column,
                        frequency: 1,
                        is_const,
                    });
                }
            }
        }

        Ok(Self {
            names,
            patterns,
            site_to_pattern,
            num_states,
            nsite,
        })
    }

    /// Number of distinct patterns.
    pub fn size(&self) -> usize {
        self.patterns.len()
    }

    /// Number of original alignment sites.
    pub fn n_site(&self) -> usize {
        self.nsite
    }

    /// Number of sequences.
    pub fn n_seq(&self) -> usize {
        self.names.len()
    }

    /// Alphabet size.
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Sequence name by index.
    pub fn get_seq_name(&self, i: usize) -> &str {
        &self.names[i]
    }

    /// Index of a sequence by name.
    pub fn seq_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Pattern accessor.
    pub fn pattern(&self, p: usize) -> &Pattern {
        &self.patterns[p]
    }

    /// Encoded state of sequence `seq` at pattern `p`.
    pub fn state(&self, p: usize, seq: usize) -> u8 {
        self.patterns[p].states[seq]
    }

    /// Pattern id of an original site.
    pub fn get_pattern_id(&self, site: usize) -> usize {
        self.site_to_pattern[site]
    }

    /// Per-pattern frequencies.
    pub fn pattern_frequencies(&self) -> Vec<u32> {
        self.patterns.iter().map(|p| p.frequency).collect()
    }

    /// Jukes-Cantor distance between two sequences, capped at
    /// [`MAX_GENETIC_DIST`] beyond the saturation limit.
    pub fn compute_dist(&self, seq1: usize, seq2: usize) -> f64 {
        let p = self.compute_obs_dist(seq1, seq2);
        if p >= 0.75 {
            return MAX_GENETIC_DIST;
        }
        if p == 0.0 {
            return 0.0;
        }
        (-0.75 * (1.0 - 4.0 * p / 3.0).ln()).min(MAX_GENETIC_DIST)
    }

    /// Observed proportion of differing sites between two sequences,
    /// counted over sites where both states are definite.
    pub fn compute_obs_dist(&self, seq1: usize, seq2: usize) -> f64 {
        let mut diff = 0u64;
        let mut total = 0u64;
        let ns = self.num_states as u8;
        for p in &self.patterns {
            let a = p.states[seq1];
            let b = p.states[seq2];
            if a < ns && b < ns {
                total += p.frequency as u64;
                if a != b {
                    diff += p.frequency as u64;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            diff as f64 / total as f64
        }
    }

    /// Frequency-weighted bootstrap: draw `n_site` sites with replacement
    /// and return the resampled per-pattern frequencies.
    pub fn create_bootstrap_frequencies(&self, rng: &mut Xorshift64) -> Vec<u32> {
        let mut freq = vec![0u32; self.patterns.len()];
        for _ in 0..self.nsite {
            let site = rng.next_usize(self.nsite);
            freq[self.site_to_pattern[site]] += 1;
        }
        freq
    }

    /// Extract the sub-alignment over a subset of sequences.
    ///
    /// Sites with fewer than `min_informative` definite characters among the
    /// kept sequences are dropped; the remaining columns are re-deduplicated.
    pub fn extract_sub_alignment(&self, ids: &[usize], min_informative: usize) -> Result<Self> {
        if ids.len() < 3 {
            return Err(PhysaliaError::InvalidInput(
                "sub-alignment needs at least 3 sequences".into(),
            ));
        }
        for &id in ids {
            if id >= self.n_seq() {
                return Err(PhysaliaError::InvalidInput(format!(
                    "sequence index {} out of range ({})",
                    id,
                    self.n_seq()
                )));
            }
        }
        let names: Vec<String> = ids.iter().map(|&i| self.names[i].clone()).collect();
        let ns = self.num_states as u8;
        let mut cols: Vec<Vec<u8>> = vec![Vec::new(); ids.len()];
        for site in 0..self.nsite {
            let ptn = &self.patterns[self.site_to_pattern[site]];
            let informative = ids.iter().filter(|&&i| ptn.states[i] < ns).count();
            if informative < min_informative {
                continue;
            }
            for (k, &i) in ids.iter().enumerate() {
                cols[k].push(ptn.states[i]);
            }
        }
        if cols[0].is_empty() {
            return Err(PhysaliaError::InvalidInput(
                "no informative sites left in sub-alignment".into(),
            ));
        }
        Self::from_encoded(names, &cols, self.num_states)
    }

    /// Dump an `N x N` distance matrix in the plain text format
    /// (`count`, then one row per sequence: name followed by N values).
    pub fn print_dist(&self, path: &Path, mat: &[f64]) -> Result<()> {
        let n = self.n_seq();
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", n)?;
        for i in 0..n {
            write!(out, "{}", self.names[i])?;
            for j in 0..n {
                write!(out, " {:.10}", mat[i * n + j])?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Read a distance matrix written by [`Alignment::print_dist`].
    ///
    /// Rows may appear in any order; they are matched to sequences by name.
    /// Returns the longest distance seen.
    pub fn read_dist(&self, path: &Path, mat: &mut [f64]) -> Result<f64> {
        let n = self.n_seq();
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| PhysaliaError::Parse("empty distance file".into()))??;
        let count: usize = header
            .trim()
            .parse()
            .map_err(|_| PhysaliaError::Parse(format!("bad sequence count '{}'", header)))?;
        if count != n {
            return Err(PhysaliaError::InvalidInput(format!(
                "distance file has {} sequences, alignment has {}",
                count, n
            )));
        }
        let mut longest = 0.0f64;
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| PhysaliaError::Parse("missing row name".into()))?;
            let row = self.seq_index(name).ok_or_else(|| {
                PhysaliaError::InvalidInput(format!("sequence {} not in alignment", name))
            })?;
            for j in 0..n {
                let v: f64 = fields
                    .next()
                    .ok_or_else(|| PhysaliaError::Parse(format!("short row for {}", name)))?
                    .parse()
                    .map_err(|_| PhysaliaError::Parse(format!("bad distance in row {}", name)))?;
                mat[row * n + j] = v;
                longest = longest.max(v);
            }
        }
        Ok(longest)
    }
}

impl Summarizable for Alignment {
    fn summary(&self) -> String {
        format!(
            "Alignment: {} sequences, {} sites, {} patterns",
            self.n_seq(),
            self.nsite,
            self.patterns.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Alignment {
        Alignment::from_sequences(
            &["A", "B", "C", "D"],
            &[b"ACGTACGTAC", b"ACGTACGTAG", b"ACGTACGTTC", b"ACGTACGTTG"],
        )
        .unwrap()
    }

    #[test]
    fn encoding_definite_and_ambiguous() {
        assert_eq!(encode_dna(b'A'), 0);
        assert_eq!(encode_dna(b'c'), 1);
        assert_eq!(encode_dna(b'U'), 3);
        assert_eq!(encode_dna(b'R'), 3 + 0b0101);
        assert_eq!(encode_dna(b'N'), STATE_UNKNOWN);
        assert_eq!(encode_dna(b'-'), STATE_UNKNOWN);
    }

    #[test]
    fn state_mask_decoding() {
        assert_eq!(state_mask(0, 4), 0b0001);
        assert_eq!(state_mask(3, 4), 0b1000);
        assert_eq!(state_mask(encode_dna(b'R'), 4), 0b0101);
        assert_eq!(state_mask(STATE_UNKNOWN, 4), 0b1111);
    }

    #[test]
    fn pattern_dedup_counts_sites() {
        let aln = toy();
        assert_eq!(aln.n_site(), 10);
        let total: u32 = aln.pattern_frequencies().iter().sum();
        assert_eq!(total, 10);
        // Columns 1..=8 are shared across repeats; expect fewer patterns than sites.
        assert!(aln.size() < aln.n_site());
        for site in 0..aln.n_site() {
            assert!(aln.get_pattern_id(site) < aln.size());
        }
    }

    #[test]
    fn const_patterns_flagged() {
        let aln = toy();
        // Site 0 is 'A' in every sequence.
        let p0 = aln.get_pattern_id(0);
        assert!(aln.pattern(p0).is_const);
        // Site 8 differs (A/A/T/T).
        let p8 = aln.get_pattern_id(8);
        assert!(!aln.pattern(p8).is_const);
    }

    #[test]
    fn too_few_sequences_rejected() {
        assert!(Alignment::from_sequences(&["A", "B"], &[b"AC", b"AC"]).is_err());
    }

    #[test]
    fn length_mismatch_rejected() {
        assert!(
            Alignment::from_sequences(&["A", "B", "C"], &[b"ACGT", b"ACG", b"ACGT"]).is_err()
        );
    }

    #[test]
    fn obs_dist_is_proportion() {
        let aln = toy();
        // A vs B differ at exactly one of 10 sites.
        let d = aln.compute_obs_dist(0, 1);
        assert!((d - 0.1).abs() < 1e-12);
        assert_eq!(aln.compute_obs_dist(0, 0), 0.0);
    }

    #[test]
    fn jc_dist_matches_formula() {
        let aln = toy();
        let p = aln.compute_obs_dist(0, 1);
        let expected = -0.75 * (1.0 - 4.0 * p / 3.0f64).ln();
        assert!((aln.compute_dist(0, 1) - expected).abs() < 1e-12);
    }

    #[test]
    fn jc_dist_saturation_capped() {
        let aln = Alignment::from_sequences(
            &["A", "B", "C"],
            &[b"AAAA", b"CCCC", b"GGGG"],
        )
        .unwrap();
        assert_eq!(aln.compute_dist(0, 1), MAX_GENETIC_DIST);
    }

    #[test]
    fn bootstrap_frequencies_sum_to_nsite() {
        let aln = toy();
        let mut rng = Xorshift64::new(1);
        let freq = aln.create_bootstrap_frequencies(&mut rng);
        assert_eq!(freq.len(), aln.size());
        assert_eq!(freq.iter().sum::<u32>() as usize, aln.n_site());
    }

    #[test]
    fn bootstrap_deterministic_for_seed() {
        let aln = toy();
        let f1 = aln.create_bootstrap_frequencies(&mut Xorshift64::new(9));
        let f2 = aln.create_bootstrap_frequencies(&mut Xorshift64::new(9));
        assert_eq!(f1, f2);
    }

    #[test]
    fn sub_alignment_keeps_names_and_sites() {
        let aln = toy();
        let sub = aln.extract_sub_alignment(&[0, 2, 3], 2).unwrap();
        assert_eq!(sub.n_seq(), 3);
        assert_eq!(sub.get_seq_name(1), "C");
        assert_eq!(sub.n_site(), aln.n_site());
    }

    #[test]
    fn sub_alignment_drops_uninformative_sites() {
        let aln = Alignment::from_sequences(
            &["A", "B", "C", "D"],
            &[b"ANNT", b"ANNT", b"CNNT", b"CNNT"],
        )
        .unwrap();
        let sub = aln.extract_sub_alignment(&[0, 1, 2], 2).unwrap();
        // The two all-N columns fail the informative filter.
        assert_eq!(sub.n_site(), 2);
    }

    #[test]
    fn dist_file_round_trip() {
        let aln = toy();
        let n = aln.n_seq();
        let mut mat = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    mat[i * n + j] = aln.compute_dist(i, j);
                }
            }
        }
        let dir = std::env::temp_dir();
        let path = dir.join("physalia_dist_roundtrip.jcdist");
        aln.print_dist(&path, &mat).unwrap();
        let mut back = vec![0.0; n * n];
        aln.read_dist(&path, &mut back).unwrap();
        std::fs::remove_file(&path).ok();
        for (a, b) in mat.iter().zip(&back) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
