//! MAD outlier rejection
//!
//! Byzantine-robust filtering over ciphertext-free metadata: each package
//! reports its pre-clip gradient L2 norm in the safety statistics, and any
//! reporter deviating from the median by more than `k` median absolute
//! deviations is excluded before the homomorphic sum.

use std::collections::BTreeMap;

use sfup_common::WorkerId;
use tracing::warn;

/// Result of one filtering pass.
#[derive(Debug, Clone)]
pub struct MadOutcome {
    /// Workers that survived, in id order.
    pub kept: Vec<WorkerId>,
    /// Workers flagged as outliers, in id order.
    pub excluded: Vec<WorkerId>,
    /// Median of the reported norms.
    pub median: f64,
    /// Median absolute deviation of the reported norms.
    pub mad: f64,
}

/// Median-absolute-deviation filter with multiplier `k`.
#[derive(Debug, Clone, Copy)]
pub struct MadFilter {
    k: f64,
}

impl MadFilter {
    /// Creates a filter with the given multiplier.
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    /// Filters reporters by `|x − median| > k · MAD`.
    ///
    /// With a zero MAD (all reporters agree) any deviation at all is
    /// flagged, which is the behavior the degenerate case calls for.
    pub fn filter(&self, reports: &BTreeMap<WorkerId, f64>) -> MadOutcome {
        let values: Vec<f64> = reports.values().copied().collect();
        let med = median(&values);
        let deviations: Vec<f64> = values.iter().map(|&x| (x - med).abs()).collect();
        let mad = median(&deviations);
        let threshold = self.k * mad;

        let mut kept = Vec::new();
        let mut excluded = Vec::new();
        for (worker, &x) in reports {
            if (x - med).abs() > threshold {
                warn!(worker = %worker, norm = x, median = med, mad, "outlier excluded");
                excluded.push(worker.clone());
            } else {
                kept.push(worker.clone());
            }
        }

        MadOutcome {
            kept,
            excluded,
            median: med,
            mad,
        }
    }
}

/// Median of a slice; the mean of the two middle values for even lengths.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("norms are finite"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports(pairs: &[(&str, f64)]) -> BTreeMap<WorkerId, f64> {
        pairs
            .iter()
            .map(|(id, v)| (WorkerId::new(*id), *v))
            .collect()
    }

    #[test]
    fn test_no_outliers_in_tight_cluster() {
        let filter = MadFilter::new(3.0);
        let outcome = filter.filter(&reports(&[("a", 5.0), ("b", 5.2), ("c", 4.9)]));
        assert_eq!(outcome.kept.len(), 3);
        assert!(outcome.excluded.is_empty());
    }

    #[test]
    fn test_extreme_reporter_flagged() {
        let filter = MadFilter::new(3.0);
        let outcome = filter.filter(&reports(&[
            ("a", 5.477),
            ("b", 4.0),
            ("c", 4.690),
            ("d", 1_000_000.0),
        ]));
        assert_eq!(outcome.excluded, vec![WorkerId::new("d")]);
        assert_eq!(outcome.kept.len(), 3);
    }

    #[test]
    fn test_zero_mad_flags_any_deviation() {
        let filter = MadFilter::new(3.0);
        let outcome = filter.filter(&reports(&[("a", 5.0), ("b", 5.0), ("c", 1000.0)]));
        assert_eq!(outcome.excluded, vec![WorkerId::new("c")]);
        assert_eq!(outcome.mad, 0.0);
    }

    #[test]
    fn test_median_even_count() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median(&[2.0, 1.0]), 1.5);
        assert_eq!(median(&[7.0]), 7.0);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_single_reporter_kept() {
        let filter = MadFilter::new(3.0);
        let outcome = filter.filter(&reports(&[("only", 42.0)]));
        assert_eq!(outcome.kept, vec![WorkerId::new("only")]);
    }
}
