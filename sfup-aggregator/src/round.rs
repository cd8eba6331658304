//! Per-round protocol state machine
//!
//! COLLECTING → QUORUM_REACHED → FILTERED → SUMMED → DECRYPTED → GATED →
//! PUBLISHED, with terminal FAILED reachable from every non-terminal phase.
//! Packages are only accepted while collecting; a deadline with quorum
//! flushes the round into the filter/sum path, without quorum it fails.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sfup_common::{KeyId, RoundNumber, WorkerId};
use sfup_package::UpdatePackage;
use tracing::debug;

use crate::error::{AggregatorError, AggregatorResult};

/// Protocol phase of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Accepting packages, quorum not yet reached.
    Collecting,
    /// Accepting packages, quorum reached.
    QuorumReached,
    /// Outlier filter applied.
    Filtered,
    /// Ciphertexts summed.
    Summed,
    /// Sum decrypted.
    Decrypted,
    /// Evaluation gate passed.
    Gated,
    /// Model delta published. Terminal.
    Published,
    /// Round failed. Terminal.
    Failed,
}

impl RoundPhase {
    /// Phase name for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            RoundPhase::Collecting => "COLLECTING",
            RoundPhase::QuorumReached => "QUORUM_REACHED",
            RoundPhase::Filtered => "FILTERED",
            RoundPhase::Summed => "SUMMED",
            RoundPhase::Decrypted => "DECRYPTED",
            RoundPhase::Gated => "GATED",
            RoundPhase::Published => "PUBLISHED",
            RoundPhase::Failed => "FAILED",
        }
    }

    /// Whether the round is finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundPhase::Published | RoundPhase::Failed)
    }

    fn successor(self) -> Option<RoundPhase> {
        match self {
            RoundPhase::Collecting => Some(RoundPhase::QuorumReached),
            RoundPhase::QuorumReached => Some(RoundPhase::Filtered),
            RoundPhase::Filtered => Some(RoundPhase::Summed),
            RoundPhase::Summed => Some(RoundPhase::Decrypted),
            RoundPhase::Decrypted => Some(RoundPhase::Gated),
            RoundPhase::Gated => Some(RoundPhase::Published),
            RoundPhase::Published | RoundPhase::Failed => None,
        }
    }
}

/// Control-plane view of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundStatusReport {
    /// Key id the round is scoped to.
    pub key_id: KeyId,
    /// Round number.
    pub round: RoundNumber,
    /// Current phase.
    pub phase: RoundPhase,
    /// Valid packages accepted so far.
    pub received: usize,
    /// Quorum threshold.
    pub required: usize,
    /// Failure description for FAILED rounds.
    pub failure: Option<String>,
}

/// Mutable state of one round in flight.
#[derive(Debug)]
pub struct RoundState {
    /// Key the round is scoped to.
    pub key_id: KeyId,
    /// Round number.
    pub round: RoundNumber,
    phase: RoundPhase,
    packages: BTreeMap<WorkerId, UpdatePackage>,
    quorum_threshold: usize,
    deadline: Instant,
    failure: Option<String>,
}

impl RoundState {
    /// Opens a round in COLLECTING with the given deadline.
    pub fn new(
        key_id: KeyId,
        round: RoundNumber,
        quorum_threshold: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            key_id,
            round,
            phase: RoundPhase::Collecting,
            packages: BTreeMap::new(),
            quorum_threshold,
            deadline: Instant::now() + timeout,
            failure: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Accepted package count.
    pub fn received_count(&self) -> usize {
        self.packages.len()
    }

    /// Accepted packages by worker.
    pub fn packages(&self) -> &BTreeMap<WorkerId, UpdatePackage> {
        &self.packages
    }

    /// Whether the collection deadline has passed.
    pub fn is_timed_out(&self) -> bool {
        Instant::now() > self.deadline
    }

    /// Whether quorum is satisfied by the accepted packages.
    pub fn quorum_reached(&self) -> bool {
        self.packages.len() >= self.quorum_threshold
    }

    /// Accepts a validated package while collecting.
    ///
    /// Rejects duplicates by worker id and packages addressed to a
    /// different key or round. Reaching quorum promotes the phase.
    pub fn accept(&mut self, package: UpdatePackage) -> AggregatorResult<()> {
        if !matches!(
            self.phase,
            RoundPhase::Collecting | RoundPhase::QuorumReached
        ) {
            return Err(AggregatorError::WrongPhase {
                phase: self.phase.name(),
                operation: "accept a package",
            });
        }
        let package_key = KeyId::new(package.header.key_id.clone());
        if package_key != self.key_id {
            return Err(AggregatorError::KeyMismatch {
                expected: self.key_id.clone(),
                got: package_key,
            });
        }
        if package.header.round != self.round.0 {
            return Err(AggregatorError::RoundMismatch {
                expected: self.round.0,
                got: package.header.round,
            });
        }
        let worker = WorkerId::new(package.header.worker_id.clone());
        if self.packages.contains_key(&worker) {
            return Err(AggregatorError::DuplicateWorker(worker));
        }

        self.packages.insert(worker, package);
        if self.phase == RoundPhase::Collecting && self.quorum_reached() {
            debug!(round = %self.round, "quorum reached");
            self.phase = RoundPhase::QuorumReached;
        }
        Ok(())
    }

    /// Advances to the next phase in protocol order.
    pub fn advance(&mut self, to: RoundPhase) -> AggregatorResult<()> {
        if self.phase.successor() != Some(to) {
            return Err(AggregatorError::WrongPhase {
                phase: self.phase.name(),
                operation: to.name(),
            });
        }
        debug!(round = %self.round, from = self.phase.name(), to = to.name(), "round transition");
        self.phase = to;
        Ok(())
    }

    /// Removes excluded workers' packages after filtering.
    pub fn exclude(&mut self, workers: &[WorkerId]) {
        for worker in workers {
            self.packages.remove(worker);
        }
    }

    /// Transitions to FAILED with a reason. Idempotent on terminal rounds.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.phase.is_terminal() {
            self.phase = RoundPhase::Failed;
            self.failure = Some(reason.into());
        }
    }

    /// Control-plane snapshot.
    pub fn status(&self) -> RoundStatusReport {
        RoundStatusReport {
            key_id: self.key_id.clone(),
            round: self.round,
            phase: self.phase,
            received: self.packages.len(),
            required: self.quorum_threshold,
            failure: self.failure.clone(),
        }
    }
}
