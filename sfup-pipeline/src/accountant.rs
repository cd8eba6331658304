//! Differential-privacy accountant
//!
//! Tracks cumulative ε per worker and enforces the hard stop. The
//! per-round ε derives from the Skellam mechanism's Gaussian-approximation
//! bound given μ, the clip norm and the post-sparsification sensitivity;
//! deployments that account externally pin `epsilon_per_round` in the
//! envelope and the accountant uses that value verbatim.

use sfup_common::OperatingEnvelope;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// Per-worker privacy ledger.
#[derive(Debug, Clone)]
pub struct DpAccountant {
    consumed: f64,
    cap: f64,
    delta: f64,
    hard_stop: bool,
}

impl DpAccountant {
    /// Creates a ledger from the envelope's budget fields.
    pub fn new(envelope: &OperatingEnvelope) -> Self {
        Self {
            consumed: 0.0,
            cap: envelope.epsilon_cap,
            delta: envelope.delta,
            hard_stop: envelope.hard_stop_enabled,
        }
    }

    /// ε consumed so far.
    pub fn consumed(&self) -> f64 {
        self.consumed
    }

    /// ε remaining before the cap.
    pub fn remaining(&self) -> f64 {
        (self.cap - self.consumed).max(0.0)
    }

    /// The δ parameter of the ledger.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Whether a round costing `round_epsilon` may proceed.
    pub fn can_submit(&self, round_epsilon: f64) -> bool {
        if !self.hard_stop {
            return true;
        }
        self.consumed + round_epsilon <= self.cap
    }

    /// Checks and fails with `PrivacyBudgetExhausted` when the hard stop
    /// forbids the round. Called before any other round work.
    pub fn check(&self, round_epsilon: f64) -> PipelineResult<()> {
        if !self.can_submit(round_epsilon) {
            warn!(
                consumed = self.consumed,
                cap = self.cap,
                round_epsilon,
                "privacy budget exhausted"
            );
            return Err(PipelineError::PrivacyBudgetExhausted {
                consumed: self.consumed,
                cap: self.cap,
            });
        }
        Ok(())
    }

    /// Records a spent round.
    pub fn record(&mut self, round_epsilon: f64) {
        self.consumed += round_epsilon;
        debug!(
            round_epsilon,
            consumed = self.consumed,
            remaining = self.remaining(),
            "recorded privacy spend"
        );
    }

    /// Per-round ε for the envelope's mechanism parameters.
    ///
    /// With `epsilon_per_round` pinned the pinned value is returned.
    /// Otherwise the Gaussian-approximation bound of the Skellam mechanism
    /// applies: `ε = Δ_q · sqrt(2·ln(1.25/δ)) / σ` with `σ = sqrt(2μ)` in
    /// quantized units, sensitivity `Δ_q = clip_norm·sqrt(ρ) / scale_ref`
    /// and the worst-case reference scale
    /// `scale_ref = 2·clip_norm / (2^bits − 1)`.
    pub fn round_epsilon(envelope: &OperatingEnvelope) -> f64 {
        if let Some(pinned) = envelope.epsilon_per_round {
            return pinned;
        }
        let q_max = f64::from((1u32 << envelope.bits) - 1);
        let scale_ref = 2.0 * envelope.clip_norm / q_max;
        let sensitivity_q = envelope.clip_norm * envelope.sparsity_ratio.sqrt() / scale_ref;
        let sigma = (2.0 * envelope.mu).sqrt();
        sensitivity_q * (2.0 * (1.25 / envelope.delta).ln()).sqrt() / sigma
    }
}
