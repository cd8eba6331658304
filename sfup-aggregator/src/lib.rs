//! Central aggregator for the Secure Federated Update Pipeline
//!
//! Consumes sealed update packages for a round, validates them, rejects
//! outliers on ciphertext-free metadata, sums the surviving ciphertexts
//! homomorphically, decrypts with the shared key, inverts the compression,
//! gates the result on quality thresholds, and publishes the model delta.
//! Rounds within a key id run strictly sequentially; every state transition
//! is recorded in the evidence log.

pub mod delta_store;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod outlier;
pub mod recover;
pub mod round;
pub mod service;
pub mod sum;
pub mod validate;

pub use delta_store::{DeltaMetadata, DeltaStore, DeltaStoreError};
pub use error::{AggregatorError, AggregatorResult};
pub use gate::{EvaluationGate, GateDecision, GateMetrics, GateThresholds};
pub use metrics::{MetricsCollector, ParticipantContribution, RoundMetrics};
pub use outlier::{MadFilter, MadOutcome};
pub use recover::{kl_divergence_proxy, recover_delta};
pub use round::{RoundPhase, RoundState, RoundStatusReport};
pub use service::{AggregatorConfig, AggregatorHandle, AggregatorService, SubmitOutcome};
pub use sum::{sum_ciphertexts, SummedParameter, SummedRound};
pub use validate::PackageValidator;
