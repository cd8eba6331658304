//! Error kinds shared across the SFUP workspace
//!
//! Each crate defines its own `thiserror` enum; every variant maps onto one
//! of the kinds here so callers embedding the pipeline can translate any
//! failure into an exit code and an evidence event without matching on
//! crate-level detail.

use serde::{Deserialize, Serialize};

use crate::types::{RoundNumber, WorkerId};

/// Coarse failure classification for every error in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed package, missing manifest field, size over envelope.
    Validation,
    /// Decryption failure, signature mismatch, hash mismatch.
    Crypto,
    /// Differential-privacy or noise budget exhausted.
    Budget,
    /// Not enough valid packages by the round deadline.
    Quorum,
    /// Evidence chain mismatch on verification.
    Integrity,
    /// Backpressure, disk full, channel closed.
    Resource,
    /// Missing production secret, malformed envelope.
    Config,
}

impl ErrorKind {
    /// Process exit code when the pipeline is embedded in a host binary.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Validation => 1,
            ErrorKind::Crypto => 2,
            ErrorKind::Budget => 3,
            ErrorKind::Quorum => 4,
            ErrorKind::Resource => 5,
            // Integrity and config failures halt the process before any
            // round-level exit path is meaningful.
            ErrorKind::Integrity => 2,
            ErrorKind::Config => 1,
        }
    }

    /// Whether the failure ends only the current round (the next round may
    /// proceed) as opposed to the session or the whole process.
    pub fn is_round_fatal_only(self) -> bool {
        matches!(self, ErrorKind::Quorum | ErrorKind::Validation)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Budget => "budget",
            ErrorKind::Quorum => "quorum",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Resource => "resource",
            ErrorKind::Config => "config",
        };
        write!(f, "{s}")
    }
}

/// Structured, user-visible description of a failure.
///
/// Every failure surfaced to an operator carries its kind, the round and
/// worker it concerns (when applicable), and a remediation hint. This is the
/// payload recorded alongside evidence events for failed operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Round the failure occurred in, if round-scoped.
    pub round: Option<RoundNumber>,
    /// Worker the failure concerns, if worker-scoped.
    pub worker_id: Option<WorkerId>,
    /// Human-readable summary of what went wrong.
    pub detail: String,
    /// Suggested operator action.
    pub remediation: String,
}

impl Fault {
    /// Creates a fault with no round or worker scope.
    pub fn new(kind: ErrorKind, detail: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            kind,
            round: None,
            worker_id: None,
            detail: detail.into(),
            remediation: remediation.into(),
        }
    }

    /// Scopes the fault to a round.
    pub fn with_round(mut self, round: RoundNumber) -> Self {
        self.round = Some(round);
        self
    }

    /// Scopes the fault to a worker.
    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker_id = Some(worker);
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)?;
        if let Some(round) = self.round {
            write!(f, " (round {round})")?;
        }
        if let Some(worker) = &self.worker_id {
            write!(f, " (worker {worker})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::Validation.exit_code(), 1);
        assert_eq!(ErrorKind::Crypto.exit_code(), 2);
        assert_eq!(ErrorKind::Budget.exit_code(), 3);
        assert_eq!(ErrorKind::Quorum.exit_code(), 4);
        assert_eq!(ErrorKind::Resource.exit_code(), 5);
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::new(ErrorKind::Quorum, "2 of 3 packages", "lower quorum_threshold")
            .with_round(RoundNumber(7));
        let s = fault.to_string();
        assert!(s.contains("[quorum]"));
        assert!(s.contains("round 7"));
    }

    #[test]
    fn test_round_fatal_classification() {
        assert!(ErrorKind::Quorum.is_round_fatal_only());
        assert!(!ErrorKind::Integrity.is_round_fatal_only());
        assert!(!ErrorKind::Budget.is_round_fatal_only());
    }
}
