//! Package header and manifest model
//!
//! Struct fields are declared in lexicographic order: serde_json emits
//! object keys in declaration order, and the wire format requires sorted-key
//! JSON so that parse-then-seal is byte-identical.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Signature algorithm identifier carried in the header.
pub const SIG_ALG_HYBRID: &str = "ed25519+ml-dsa-65";

/// Package header: identity and addressing of one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageHeader {
    /// Key id the payload is encrypted under.
    pub key_id: String,
    /// Round number.
    pub round: u64,
    /// Signature algorithm identifier.
    pub sig_alg: String,
    /// Seal time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Producing worker.
    pub worker_id: String,
}

/// Safety statistics reported alongside every update.
///
/// `gradient_l2_pre_clip` feeds the aggregator's MAD outlier filter, so it
/// travels outside the ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyStats {
    /// Clipping factor actually applied this round.
    pub clip_norm_applied: f64,
    /// Cumulative ε consumed by this worker including this round.
    pub dp_epsilon_consumed: f64,
    /// L2 norm of the combined gradient before clipping.
    pub gradient_l2_pre_clip: f64,
    /// Serialized plaintext payload size before compression, in bytes.
    pub payload_bytes_precompression: u64,
    /// Rand-K sparsity ratio used.
    pub sparsity_ratio: f64,
}

/// Per-parameter compression metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionMeta {
    /// Quantization bit width.
    pub bits: u8,
    /// Ciphertext slots this parameter occupies.
    pub n_slots: usize,
    /// Dequantization scale.
    pub scale: f64,
    /// Public substream tag the Rand-K indices derive from.
    pub substream_tag: String,
    /// Quantization zero point.
    pub zero_point: u32,
}

/// Training metadata for audit and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingMeta {
    /// Optimizer learning rate.
    pub learning_rate: f64,
    /// Training objective description.
    pub objective: String,
    /// Optimizer name.
    pub optimizer: String,
    /// Local optimization steps taken this round.
    pub steps: u64,
}

/// The package manifest: everything the aggregator needs besides the
/// ciphertexts themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Compression metadata per parameter name.
    pub compression_meta: BTreeMap<String, CompressionMeta>,
    /// Gate weight per expert name for this round.
    pub expert_weights: BTreeMap<String, f32>,
    /// Safety statistics.
    pub safety_stats: SafetyStats,
    /// Training metadata.
    pub training_meta: TrainingMeta,
}

impl Manifest {
    /// Total ciphertext slot count across all parameters.
    pub fn total_slots(&self) -> usize {
        self.compression_meta.values().map(|m| m.n_slots).sum()
    }
}
