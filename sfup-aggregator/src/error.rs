//! Error types for the aggregator

use sfup_common::{ErrorKind, KeyId, WorkerId};
use sfup_crypto::CryptoError;
use sfup_evidence::EvidenceError;
use sfup_keys::KeyError;
use sfup_package::PackageError;
use thiserror::Error;

/// Aggregator error types
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// Too few valid packages to commit the round.
    #[error("quorum not reached: {got} valid packages, {required} required")]
    QuorumNotReached {
        /// Valid packages on hand.
        got: usize,
        /// Envelope quorum threshold.
        required: usize,
    },

    /// A worker submitted twice in one round.
    #[error("duplicate package from worker {0}")]
    DuplicateWorker(WorkerId),

    /// The package references a different key than the round.
    #[error("key mismatch: round is scoped to {expected}, package references {got}")]
    KeyMismatch {
        /// Round key.
        expected: KeyId,
        /// Package key.
        got: KeyId,
    },

    /// The package is for a different round.
    #[error("round mismatch: expected {expected}, package is for {got}")]
    RoundMismatch {
        /// Active round.
        expected: u64,
        /// Package round.
        got: u64,
    },

    /// The key exists but its lifecycle state forbids this use.
    #[error("key {key_id} is not usable here: {reason}")]
    KeyUnusable {
        /// Key id.
        key_id: KeyId,
        /// Why it is refused.
        reason: String,
    },

    /// A state-machine transition was attempted out of order.
    #[error("round in phase {phase} cannot {operation}")]
    WrongPhase {
        /// Current phase name.
        phase: &'static str,
        /// Attempted operation.
        operation: &'static str,
    },

    /// Summing this many contributions would wrap the plaintext modulus.
    #[error("plaintext overflow: total weight {total_weight} at {bits} bits exceeds slot headroom")]
    PlaintextOverflow {
        /// Sum of contribution weights.
        total_weight: u64,
        /// Quantization bit width.
        bits: u8,
    },

    /// Packages disagree on slot layout for a parameter.
    #[error("slot layout mismatch for {parameter}: expected {expected} slots, got {got}")]
    SlotMismatch {
        /// Parameter name.
        parameter: String,
        /// Expected slot count.
        expected: usize,
        /// Observed slot count.
        got: usize,
    },

    /// No published identity for the submitting worker.
    #[error("no published identity for worker {0}")]
    UnknownWorker(WorkerId),

    /// The evaluation gate rejected the aggregate.
    #[error("evaluation gate failed: {failures:?}")]
    GateFailed {
        /// Human-readable failed checks.
        failures: Vec<String>,
    },

    /// The receive queue is full.
    #[error("aggregator receive queue full; retry later")]
    Backpressure,

    /// The service task is gone.
    #[error("aggregator service unavailable")]
    ServiceUnavailable,

    /// Package framing, hash or signature failure.
    #[error(transparent)]
    Package(#[from] PackageError),

    /// Key provider failure.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Ciphertext arithmetic or decryption failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Evidence append failure; the aggregator fails closed.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

impl AggregatorError {
    /// Maps onto the workspace-wide error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AggregatorError::QuorumNotReached { .. } => ErrorKind::Quorum,
            AggregatorError::Backpressure | AggregatorError::ServiceUnavailable => {
                ErrorKind::Resource
            }
            AggregatorError::Package(e) => e.kind(),
            AggregatorError::Key(e) => e.kind(),
            AggregatorError::Crypto(e) => e.kind(),
            AggregatorError::Evidence(e) => e.kind(),
            AggregatorError::PlaintextOverflow { .. } => ErrorKind::Crypto,
            _ => ErrorKind::Validation,
        }
    }
}

/// Result type for aggregator operations
pub type AggregatorResult<T> = Result<T, AggregatorError>;
