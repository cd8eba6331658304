//! Post-aggregation evaluation gate
//!
//! A pure decision over (current metrics, reference metrics, thresholds).
//! The aggregator consults it between DECRYPTED and GATED; a failed gate
//! fails the round before anything is published.

use serde::{Deserialize, Serialize};

/// Recognized gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateThresholds {
    /// Minimum acceptable success rate of contributing evaluations.
    pub min_success_rate: f64,
    /// Maximum acceptable KL divergence vs the reference delta.
    pub max_kl_divergence: f64,
    /// Maximum acceptable L2 norm of the aggregated delta.
    pub max_delta_norm: f64,
    /// Whether loss must not increase vs the reference.
    pub require_monotone_loss: bool,
}

/// Metrics the gate evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    /// Fraction of successful evaluations in `[0, 1]`.
    pub success_rate: f64,
    /// KL-divergence proxy vs the previous delta; zero when no reference
    /// exists.
    pub kl_divergence: f64,
    /// L2 norm of the aggregated delta.
    pub delta_norm: f64,
    /// Evaluation loss.
    pub loss: f64,
}

/// Gate decision: pass, or the list of failed checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Whether every check passed.
    pub passed: bool,
    /// Failed checks, human-readable.
    pub failures: Vec<String>,
}

/// The evaluation gate.
#[derive(Debug, Clone)]
pub struct EvaluationGate {
    thresholds: GateThresholds,
}

impl EvaluationGate {
    /// Creates a gate with explicit thresholds.
    pub fn new(thresholds: GateThresholds) -> Self {
        Self { thresholds }
    }

    /// The configured thresholds.
    pub fn thresholds(&self) -> &GateThresholds {
        &self.thresholds
    }

    /// Evaluates metrics against the thresholds. Pure.
    pub fn evaluate(
        &self,
        current: &GateMetrics,
        reference: Option<&GateMetrics>,
    ) -> GateDecision {
        let mut failures = Vec::new();

        if current.success_rate < self.thresholds.min_success_rate {
            failures.push(format!(
                "success rate {} below minimum {}",
                current.success_rate, self.thresholds.min_success_rate
            ));
        }
        if current.kl_divergence > self.thresholds.max_kl_divergence {
            failures.push(format!(
                "KL divergence {} above maximum {}",
                current.kl_divergence, self.thresholds.max_kl_divergence
            ));
        }
        if current.delta_norm > self.thresholds.max_delta_norm {
            failures.push(format!(
                "delta norm {} above maximum {}",
                current.delta_norm, self.thresholds.max_delta_norm
            ));
        }
        if self.thresholds.require_monotone_loss {
            if let Some(reference) = reference {
                if current.loss > reference.loss {
                    failures.push(format!(
                        "loss {} increased from {}",
                        current.loss, reference.loss
                    ));
                }
            }
        }

        GateDecision {
            passed: failures.is_empty(),
            failures,
        }
    }
}
