//! Expert gating and gradient combining
//!
//! Experts below the gate threshold are dropped; surviving experts
//! contribute their gradients scaled by their gate weight, summed into a
//! single gradient set.

use std::collections::BTreeMap;

use sfup_common::{ExpertGradients, GradientSet};
use tracing::debug;

/// Drops weak experts and combines the rest.
#[derive(Debug, Clone, Copy)]
pub struct ExpertGater {
    threshold: f32,
}

impl ExpertGater {
    /// Creates a gater with the given threshold.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Gate and combine into one gradient set.
    ///
    /// Returns the combined gradients and the gate weights of the experts
    /// that survived, which travel in the package manifest.
    pub fn combine(&self, input: &ExpertGradients) -> (GradientSet, BTreeMap<String, f32>) {
        let mut combined = GradientSet::new();
        let mut kept = BTreeMap::new();

        for (expert, grads) in &input.experts {
            let weight = input.gate_weights.get(expert).copied().unwrap_or(0.0);
            if weight < self.threshold {
                debug!(expert, weight, threshold = self.threshold, "expert gated out");
                continue;
            }
            let mut weighted = grads.clone();
            weighted.scale(weight);
            combined.add_assign(&weighted);
            kept.insert(expert.clone(), weight);
        }

        (combined, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expert(values: Vec<f32>) -> GradientSet {
        let mut set = GradientSet::new();
        set.insert("w", values);
        set
    }

    #[test]
    fn test_weak_expert_dropped() {
        let gater = ExpertGater::new(0.15);
        let mut input = ExpertGradients::default();
        input.insert("strong", expert(vec![1.0, 1.0]), 0.8);
        input.insert("weak", expert(vec![100.0, 100.0]), 0.1);

        let (combined, kept) = gater.combine(&input);
        assert_eq!(combined.get("w").unwrap(), &vec![0.8, 0.8]);
        assert!(kept.contains_key("strong"));
        assert!(!kept.contains_key("weak"));
    }

    #[test]
    fn test_surviving_experts_sum_weighted() {
        let gater = ExpertGater::new(0.15);
        let mut input = ExpertGradients::default();
        input.insert("a", expert(vec![1.0, 2.0]), 0.5);
        input.insert("b", expert(vec![2.0, 2.0]), 0.25);

        let (combined, kept) = gater.combine(&input);
        assert_eq!(combined.get("w").unwrap(), &vec![1.0, 1.5]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_all_dropped_yields_empty_set() {
        let gater = ExpertGater::new(0.5);
        let mut input = ExpertGradients::default();
        input.insert("a", expert(vec![1.0]), 0.2);
        let (combined, kept) = gater.combine(&input);
        assert!(combined.is_empty());
        assert!(kept.is_empty());
    }

    #[test]
    fn test_threshold_is_inclusive_boundary() {
        let gater = ExpertGater::new(0.15);
        let mut input = ExpertGradients::default();
        input.insert("edge", expert(vec![1.0]), 0.15);
        let (_, kept) = gater.combine(&input);
        // Exactly at threshold survives; only strictly below is dropped.
        assert!(kept.contains_key("edge"));
    }
}
