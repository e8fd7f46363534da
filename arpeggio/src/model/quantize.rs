//! Lossy quantization of stored probabilities and backoffs.
//!
//! Values are binned with equal population (Federico and Bertoldi 2006):
//! the observed values of each order are sorted, split into `2^bits` bins
//! of equal share, and each bin is represented by its mean. A stored code
//! is an index into the per-order table; decoding is a table lookup.
//! Unigram values are never quantized.

use rkyv::{Archive, Deserialize, Serialize};

use crate::errors::{ArpeggioError, Result};

/// Quantization bit widths for stored values.
///
/// Applies to the trie backend only. Each width must be in 1..=25.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantConfig {
    /// Bits per stored probability code.
    pub prob_bits: u8,

    /// Bits per stored backoff code.
    pub backoff_bits: u8,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            prob_bits: 8,
            backoff_bits: 8,
        }
    }
}

pub(crate) const MAX_QUANT_BITS: u8 = 25;

impl QuantConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for (name, bits) in [("prob_bits", self.prob_bits), ("backoff_bits", self.backoff_bits)] {
            if bits == 0 || bits > MAX_QUANT_BITS {
                return Err(ArpeggioError::invalid_config(
                    name,
                    format!("quantization widths must be in 1..={MAX_QUANT_BITS}, got {bits}"),
                ));
            }
        }
        Ok(())
    }
}

/// Per-order codebooks. For each order 2..=N there is a probability table;
/// for each order 2..N there is additionally a backoff table. Tables are
/// indexed by middle level (order minus two).
#[derive(Archive, Serialize, Deserialize)]
pub(crate) struct QuantTables {
    prob_bits: u8,
    backoff_bits: u8,
    prob_tables: Vec<Vec<f32>>,
    backoff_tables: Vec<Vec<f32>>,
}

impl QuantTables {
    /// Trains codebooks from the observed values of each order. The value
    /// vectors are consumed and sorted in place.
    pub(crate) fn train(
        config: QuantConfig,
        mut probs_per_order: Vec<Vec<f32>>,
        mut backoffs_per_order: Vec<Vec<f32>>,
    ) -> Self {
        let prob_tables = probs_per_order
            .iter_mut()
            .map(|values| train_centers(values, config.prob_bits))
            .collect();
        let backoff_tables = backoffs_per_order
            .iter_mut()
            .map(|values| train_centers(values, config.backoff_bits))
            .collect();
        Self {
            prob_bits: config.prob_bits,
            backoff_bits: config.backoff_bits,
            prob_tables,
            backoff_tables,
        }
    }

    #[inline(always)]
    pub(crate) fn prob_bits(&self) -> u8 {
        self.prob_bits
    }

    #[inline(always)]
    pub(crate) fn backoff_bits(&self) -> u8 {
        self.backoff_bits
    }

    #[inline(always)]
    pub(crate) fn encode_middle_prob(&self, level: usize, value: f32) -> u64 {
        encode_nearest(&self.prob_tables[level], value)
    }

    #[inline(always)]
    pub(crate) fn encode_middle_backoff(&self, level: usize, value: f32) -> u64 {
        encode_nearest(&self.backoff_tables[level], value)
    }

    #[inline(always)]
    pub(crate) fn encode_longest_prob(&self, value: f32) -> u64 {
        encode_nearest(&self.prob_tables[self.prob_tables.len() - 1], value)
    }

    #[inline(always)]
    pub(crate) fn decode_middle(&self, level: usize, prob_code: u64, backoff_code: u64) -> (f32, f32) {
        (
            self.prob_tables[level][prob_code as usize],
            self.backoff_tables[level][backoff_code as usize],
        )
    }

    #[inline(always)]
    pub(crate) fn decode_longest(&self, prob_code: u64) -> f32 {
        let table = &self.prob_tables[self.prob_tables.len() - 1];
        table[prob_code as usize]
    }
}

impl ArchivedQuantTables {
    #[inline(always)]
    pub(crate) fn decode_middle(&self, level: usize, prob_code: u64, backoff_code: u64) -> (f32, f32) {
        (
            self.prob_tables[level][prob_code as usize].to_native(),
            self.backoff_tables[level][backoff_code as usize].to_native(),
        )
    }

    #[inline(always)]
    pub(crate) fn decode_longest(&self, prob_code: u64) -> f32 {
        let table = &self.prob_tables[self.prob_tables.len() - 1];
        table[prob_code as usize].to_native()
    }
}

/// Sorts `values` and returns `2^bits` nondecreasing bin centers.
///
/// Bins beyond the number of observed values repeat the nearest trained
/// center so the table stays sorted; such codes are simply never produced
/// by the encoder.
fn train_centers(values: &mut [f32], bits: u8) -> Vec<f32> {
    values.sort_unstable_by(f32::total_cmp);
    let bins = 1usize << bits;
    let mut centers = Vec::with_capacity(bins);
    let mut last = values.first().copied().unwrap_or(0.0);
    let mut start = 0usize;
    for i in 0..bins {
        let finish = values.len() * (i + 1) / bins;
        if finish > start {
            let sum: f64 = values[start..finish].iter().map(|&v| f64::from(v)).sum();
            last = (sum / (finish - start) as f64) as f32;
            start = finish;
        }
        centers.push(last);
    }
    centers
}

/// Index of the center nearest to `value`.
fn encode_nearest(centers: &[f32], value: f32) -> u64 {
    let idx = centers.partition_point(|&c| c < value);
    if idx == 0 {
        return 0;
    }
    if idx == centers.len() {
        return (centers.len() - 1) as u64;
    }
    if value - centers[idx - 1] < centers[idx] - value {
        (idx - 1) as u64
    } else {
        idx as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_population_centers() {
        let mut values = vec![-1.0f32, -4.0, -2.0, -3.0];
        let centers = train_centers(&mut values, 1);
        assert_eq!(centers, vec![-3.5, -1.5]);
    }

    #[test]
    fn test_encode_picks_nearest() {
        let centers = [-3.5f32, -1.5];
        assert_eq!(encode_nearest(&centers, -4.0), 0);
        assert_eq!(encode_nearest(&centers, -3.5), 0);
        assert_eq!(encode_nearest(&centers, -2.6), 0);
        assert_eq!(encode_nearest(&centers, -2.4), 1);
        assert_eq!(encode_nearest(&centers, -0.1), 1);
    }

    #[test]
    fn test_sparse_values_are_exact() {
        // With fewer distinct values than bins, every value becomes its
        // own center and quantization is lossless.
        let config = QuantConfig::default();
        let tables = QuantTables::train(
            config,
            vec![vec![-0.3f32, -0.9, -0.6], vec![-0.1f32, -0.2]],
            vec![vec![-0.4f32, 0.0]],
        );
        for &v in &[-0.3f32, -0.9, -0.6] {
            let code = tables.encode_middle_prob(0, v);
            assert!(code < 256);
            let (p, _) = tables.decode_middle(0, code, 0);
            assert_eq!(p, v);
        }
        for &v in &[-0.1f32, -0.2] {
            let code = tables.encode_longest_prob(v);
            assert_eq!(tables.decode_longest(code), v);
        }
        for &v in &[-0.4f32, 0.0] {
            let code = tables.encode_middle_backoff(0, v);
            let (_, b) = tables.decode_middle(0, 0, code);
            assert_eq!(b, v);
        }
    }

    #[test]
    fn test_bounded_error() {
        let mut values: Vec<f32> = (0..1000).map(|i| -(i as f32) / 100.0).collect();
        let centers = train_centers(&mut values.clone(), 4);
        // Widest gap between adjacent centers bounds the error.
        let max_gap = centers
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        for &v in &values {
            let code = encode_nearest(&centers, v) as usize;
            assert!((centers[code] - v).abs() <= max_gap);
        }
    }

    #[test]
    fn test_invalid_widths_rejected() {
        assert!(QuantConfig { prob_bits: 0, backoff_bits: 8 }.validate().is_err());
        assert!(QuantConfig { prob_bits: 8, backoff_bits: 26 }.validate().is_err());
        assert!(QuantConfig::default().validate().is_ok());
    }
}
