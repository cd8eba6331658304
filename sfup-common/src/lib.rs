//! Common types and utilities for the Secure Federated Update Pipeline
//!
//! This crate provides the shared vocabulary of the SFUP workspace: worker,
//! key and round identifiers, gradient tensor sets with a fixed parameter
//! schema, the immutable operating envelope, environment configuration, and
//! the error kinds every subsystem maps onto.

pub mod envelope;
pub mod error;
pub mod logging;
pub mod types;

pub use envelope::{DeploymentEnvironment, EnvConfig, OperatingEnvelope};
pub use error::{ErrorKind, Fault};
pub use logging::{init_logging, init_logging_with_filter, LogLevel};
pub use types::{
    AggregationWeights, ExpertGradients, GradientSet, KeyId, ModelDelta, RoundNumber,
    TensorSchema, WorkerId,
};
