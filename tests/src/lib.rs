//! Cross-crate integration tests for the Secure Federated Update Pipeline
//!
//! This crate exercises end-to-end scenarios across the workspace:
//! - Worker pipeline through the wire format into the aggregator
//! - MAD outlier rejection on reported statistics
//! - Noise-budget exposure under heavy homomorphic accumulation
//! - DP hard-stop behavior across rounds
//! - Evidence chain tamper detection
//! - The full async aggregator service with key store and evidence log

#[cfg(test)]
mod end_to_end;
#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod scenarios;
