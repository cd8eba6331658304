//! Error-feedback memory
//!
//! The residual of sparsification (`clipped − scatter(sparse)`) carries
//! over to the next round so dropped gradient mass is eventually
//! transmitted. Residuals are per worker, created lazily on a parameter's
//! first appearance and evicted after ten consecutive absent rounds.

use std::collections::BTreeMap;

use sfup_common::GradientSet;
use tracing::debug;

use crate::sparsify::SparseTensor;

/// Rounds a parameter may stay absent before its residual is evicted.
pub const MAX_STALE_ROUNDS: u64 = 10;

/// Per-worker residual store.
#[derive(Debug, Clone, Default)]
pub struct ErrorFeedbackMemory {
    residuals: BTreeMap<String, Vec<f32>>,
    last_seen: BTreeMap<String, u64>,
}

impl ErrorFeedbackMemory {
    /// Creates an empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds stored residuals into the gradient for every parameter present
    /// in both.
    pub fn apply(&self, gradient: &mut GradientSet) {
        for (name, residual) in &self.residuals {
            if let Some(values) = gradient.get_mut(name) {
                for (v, r) in values.iter_mut().zip(residual.iter()) {
                    *v += *r;
                }
            }
        }
    }

    /// Replaces residuals after sparsification:
    /// `mem[p] ← clipped[p] − scatter(indices, values)`.
    pub fn update(
        &mut self,
        round: u64,
        clipped: &GradientSet,
        sparse: &BTreeMap<String, SparseTensor>,
    ) {
        for (name, tensor) in sparse {
            let Some(clipped_values) = clipped.get(name) else {
                continue;
            };
            let mut residual = clipped_values.clone();
            for (&i, &v) in tensor.indices.iter().zip(tensor.values.iter()) {
                residual[i as usize] -= v;
            }
            self.residuals.insert(name.clone(), residual);
            self.last_seen.insert(name.clone(), round);
        }
        self.prune(round);
    }

    /// Evicts residuals of parameters absent for more than
    /// [`MAX_STALE_ROUNDS`] rounds.
    pub fn prune(&mut self, current_round: u64) {
        let stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, &seen)| current_round.saturating_sub(seen) > MAX_STALE_ROUNDS)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            debug!(parameter = %name, "evicting stale error-feedback residual");
            self.residuals.remove(&name);
            self.last_seen.remove(&name);
        }
    }

    /// Residual for a parameter, if stored.
    pub fn residual(&self, name: &str) -> Option<&Vec<f32>> {
        self.residuals.get(name)
    }

    /// L2 norm of one residual, zero when absent.
    pub fn residual_norm(&self, name: &str) -> f64 {
        self.residuals
            .get(name)
            .map(|r| {
                r.iter()
                    .map(|&x| f64::from(x) * f64::from(x))
                    .sum::<f64>()
                    .sqrt()
            })
            .unwrap_or(0.0)
    }

    /// Number of parameters with stored residuals.
    pub fn len(&self) -> usize {
        self.residuals.len()
    }

    /// True when no residuals are stored.
    pub fn is_empty(&self) -> bool {
        self.residuals.is_empty()
    }
}
