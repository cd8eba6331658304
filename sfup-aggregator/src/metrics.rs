//! Round metrics and participant contribution tracking
//!
//! Operational counters for the aggregator: per-round latency and
//! participation, per-worker contribution history with a reliability score
//! (fraction of entered rounds the worker survived into the sum).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sfup_common::{RoundNumber, WorkerId};

/// Metrics for one completed or failed round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// Round number.
    pub round: RoundNumber,
    /// Packages accepted before filtering.
    pub accepted: usize,
    /// Workers excluded by the outlier filter.
    pub excluded_outliers: usize,
    /// Workers whose contributions entered the sum.
    pub contributors: usize,
    /// Whether the round published.
    pub published: bool,
    /// L2 norm of the published delta, zero for failed rounds.
    pub delta_norm: f64,
    /// Wall-clock duration of the round in milliseconds.
    pub duration_ms: u64,
}

/// Per-worker contribution history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantContribution {
    /// Rounds this worker submitted a valid package to.
    pub rounds_entered: u64,
    /// Rounds this worker's contribution entered the sum.
    pub rounds_contributed: u64,
    /// Rounds this worker was excluded as an outlier.
    pub rounds_excluded: u64,
}

impl ParticipantContribution {
    /// Fraction of entered rounds that survived into the sum.
    pub fn reliability(&self) -> f64 {
        if self.rounds_entered == 0 {
            return 0.0;
        }
        self.rounds_contributed as f64 / self.rounds_entered as f64
    }
}

/// Aggregator-side metrics collector.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    history: Vec<RoundMetrics>,
    contributions: BTreeMap<WorkerId, ParticipantContribution>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished round.
    pub fn record_round(
        &mut self,
        metrics: RoundMetrics,
        contributors: &[WorkerId],
        excluded: &[WorkerId],
    ) {
        for worker in contributors {
            let entry = self.contributions.entry(worker.clone()).or_default();
            entry.rounds_entered += 1;
            entry.rounds_contributed += 1;
        }
        for worker in excluded {
            let entry = self.contributions.entry(worker.clone()).or_default();
            entry.rounds_entered += 1;
            entry.rounds_excluded += 1;
        }
        self.history.push(metrics);
    }

    /// Round history, oldest first.
    pub fn history(&self) -> &[RoundMetrics] {
        &self.history
    }

    /// Contribution record for one worker.
    pub fn contribution(&self, worker: &WorkerId) -> Option<&ParticipantContribution> {
        self.contributions.get(worker)
    }

    /// Fraction of recorded rounds that published.
    pub fn publish_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let published = self.history.iter().filter(|m| m.published).count();
        published as f64 / self.history.len() as f64
    }
}
