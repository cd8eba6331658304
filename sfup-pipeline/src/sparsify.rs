//! Rand-K sparsification
//!
//! For each parameter of length `n`, `k = ⌈ρ·n⌉` unique indices are drawn
//! from the public substream keyed by `(worker_id, round, parameter_name)`.
//! Selection is data-independent, which is what keeps the DP sensitivity
//! analysis valid, and the aggregator re-derives the same index sets from
//! the substream tag announced in the manifest.

use sfup_crypto::csprng::{draw_indices, rand_k_tag};

/// A sparsified tensor: ascending unique indices and their values; every
/// other entry is implicitly zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor {
    /// Selected indices, ascending.
    pub indices: Vec<u32>,
    /// Values at the selected indices.
    pub values: Vec<f32>,
    /// Length of the dense tensor.
    pub dense_len: usize,
    /// Public substream tag the indices derive from.
    pub substream_tag: String,
}

impl SparseTensor {
    /// Scatters back to a dense vector.
    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0f32; self.dense_len];
        for (&i, &v) in self.indices.iter().zip(self.values.iter()) {
            dense[i as usize] = v;
        }
        dense
    }
}

/// Rand-K sparsifier with ratio ρ.
#[derive(Debug, Clone, Copy)]
pub struct RandKSparsifier {
    ratio: f64,
}

impl RandKSparsifier {
    /// Creates a sparsifier; ρ is validated by the envelope.
    pub fn new(ratio: f64) -> Self {
        Self { ratio }
    }

    /// The configured ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Number of kept entries for a tensor of length `n`.
    pub fn k_of(&self, n: usize) -> usize {
        ((self.ratio * n as f64).ceil() as usize).min(n)
    }

    /// Sparsifies one dense tensor for `(worker, round, parameter)`.
    pub fn sparsify(
        &self,
        worker: &str,
        round: u64,
        parameter: &str,
        dense: &[f32],
    ) -> SparseTensor {
        let tag = rand_k_tag(worker, round, parameter);
        let k = self.k_of(dense.len());
        let indices = draw_indices(&tag, dense.len(), k);
        let values = indices.iter().map(|&i| dense[i as usize]).collect();
        SparseTensor {
            indices,
            values,
            dense_len: dense.len(),
            substream_tag: tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k_ceiling() {
        let sparsifier = RandKSparsifier::new(0.01);
        assert_eq!(sparsifier.k_of(100), 1);
        assert_eq!(sparsifier.k_of(101), 2);
        assert_eq!(sparsifier.k_of(1), 1);
        let dense = RandKSparsifier::new(1.0);
        assert_eq!(dense.k_of(7), 7);
    }

    #[test]
    fn test_indices_unique_and_ascending() {
        let indices = draw_indices("randk/w/1/p", 1000, 50);
        assert_eq!(indices.len(), 50);
        for pair in indices.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_deterministic_per_tag() {
        let a = draw_indices("randk/w/1/p", 256, 16);
        let b = draw_indices("randk/w/1/p", 256, 16);
        assert_eq!(a, b);
        let c = draw_indices("randk/w/2/p", 256, 16);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sparsify_values_match_dense() {
        let sparsifier = RandKSparsifier::new(0.5);
        let dense: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let sparse = sparsifier.sparsify("w1", 3, "p", &dense);
        assert_eq!(sparse.indices.len(), 8);
        for (&i, &v) in sparse.indices.iter().zip(sparse.values.iter()) {
            assert_eq!(v, dense[i as usize]);
        }
        assert_eq!(sparse.substream_tag, "randk/w1/3/p");
    }

    #[test]
    fn test_full_density_keeps_everything() {
        let sparsifier = RandKSparsifier::new(1.0);
        let dense = vec![1.0f32, 2.0, 3.0, 4.0];
        let sparse = sparsifier.sparsify("w1", 1, "p", &dense);
        assert_eq!(sparse.indices, vec![0, 1, 2, 3]);
        assert_eq!(sparse.to_dense(), dense);
    }

    #[test]
    fn test_scatter_round_trip() {
        let sparsifier = RandKSparsifier::new(0.25);
        let dense: Vec<f32> = (0..64).map(|i| (i as f32).sin()).collect();
        let sparse = sparsifier.sparsify("w1", 9, "p", &dense);
        let scattered = sparse.to_dense();
        for (&i, &v) in sparse.indices.iter().zip(sparse.values.iter()) {
            assert_eq!(scattered[i as usize], v);
        }
        let untouched = scattered
            .iter()
            .enumerate()
            .filter(|(i, _)| !sparse.indices.contains(&(*i as u32)))
            .all(|(_, &v)| v == 0.0);
        assert!(untouched);
    }
}
