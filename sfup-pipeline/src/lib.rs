//! Worker-side gradient pipeline for SFUP
//!
//! Per round: gate and combine expert gradients, clip, add error feedback,
//! Rand-K sparsify, update the residual memory, quantize, pack, encrypt and
//! seal a signed update package. Given identical inputs and the same
//! process seed the sealed package is byte-identical across reruns.
//!
//! The pipeline owns the DP accountant and consults it before any other
//! round work; a worker past its ε cap fails with
//! `PrivacyBudgetExhausted` before any gradient is touched.

pub mod accountant;
pub mod clip;
pub mod error;
pub mod gate;
pub mod memory;
pub mod quantize;
pub mod sparsify;

use std::collections::BTreeMap;

use tracing::{debug, info};

use sfup_common::{
    ExpertGradients, GradientSet, KeyId, OperatingEnvelope, RoundNumber, TensorSchema, WorkerId,
};
use sfup_crypto::n2he::EncryptionContext;
use sfup_crypto::{Csprng, HybridKeyPair, N2heCipher};
use sfup_package::{
    CompressionMeta, Manifest, PackageHeader, SafetyStats, TrainingMeta, UpdatePackage,
    SIG_ALG_HYBRID,
};

pub use accountant::DpAccountant;
pub use clip::{ClipOutcome, GradientClipper};
pub use error::{PipelineError, PipelineResult};
pub use gate::ExpertGater;
pub use memory::ErrorFeedbackMemory;
pub use quantize::{QuantizedTensor, Quantizer};
pub use sparsify::{RandKSparsifier, SparseTensor};

/// Inputs for one pipeline round.
#[derive(Debug, Clone)]
pub struct RoundInput {
    /// Round number.
    pub round: RoundNumber,
    /// Per-expert gradients with gate weights.
    pub experts: ExpertGradients,
    /// Training metadata for the manifest.
    pub training_meta: TrainingMeta,
    /// Seal timestamp; injected so output bytes are reproducible.
    pub timestamp_ms: u64,
}

/// The worker-side pipeline.
pub struct GradientPipeline {
    envelope: OperatingEnvelope,
    schema: TensorSchema,
    worker_id: WorkerId,
    key_id: KeyId,
    csprng: Csprng,
    cipher: N2heCipher,
    signer: HybridKeyPair,
    accountant: DpAccountant,
    gater: ExpertGater,
    clipper: GradientClipper,
    sparsifier: RandKSparsifier,
    quantizer: Quantizer,
    memory: ErrorFeedbackMemory,
}

impl GradientPipeline {
    /// Builds a pipeline against a validated envelope.
    pub fn new(
        envelope: OperatingEnvelope,
        schema: TensorSchema,
        worker_id: WorkerId,
        key_id: KeyId,
        csprng: Csprng,
        cipher: N2heCipher,
        signer: HybridKeyPair,
    ) -> Self {
        let accountant = DpAccountant::new(&envelope);
        let gater = ExpertGater::new(envelope.gate_threshold);
        let clipper = GradientClipper::new(envelope.clip_norm);
        let sparsifier = RandKSparsifier::new(envelope.sparsity_ratio);
        let quantizer = Quantizer::new(envelope.bits, envelope.max_quality_mse, envelope.clip_norm);
        Self {
            envelope,
            schema,
            worker_id,
            key_id,
            csprng,
            cipher,
            signer,
            accountant,
            gater,
            clipper,
            sparsifier,
            quantizer,
            memory: ErrorFeedbackMemory::new(),
        }
    }

    /// The privacy ledger.
    pub fn accountant(&self) -> &DpAccountant {
        &self.accountant
    }

    /// The error-feedback memory.
    pub fn memory(&self) -> &ErrorFeedbackMemory {
        &self.memory
    }

    /// ε this pipeline spends per non-empty round.
    pub fn round_epsilon(&self) -> f64 {
        DpAccountant::round_epsilon(&self.envelope)
    }

    /// Runs one round and seals the update package.
    ///
    /// The caller serializes rounds: `&mut self` guarantees no two rounds of
    /// the same worker run concurrently, and a dropped call leaves no
    /// partial package behind.
    pub fn process_round(&mut self, input: RoundInput) -> PipelineResult<UpdatePackage> {
        let round_epsilon = self.round_epsilon();
        // Budget gate runs before any gradient work or I/O.
        self.accountant.check(round_epsilon)?;

        let (mut gradient, kept_weights) = self.gater.combine(&input.experts);
        self.schema
            .check(&gradient)
            .map_err(PipelineError::Schema)?;

        if gradient.is_empty() {
            debug!(worker = %self.worker_id, round = %input.round, "no surviving gradients; sealing empty package");
            return self.seal(
                &input,
                BTreeMap::new(),
                kept_weights,
                Vec::new(),
                0.0,
                1.0,
                0,
            );
        }

        // Clip, then fold in last round's residuals and re-check.
        let clip = self.clipper.clip(&mut gradient);
        self.memory.apply(&mut gradient);
        let augmented_norm = gradient.l2_norm();
        if augmented_norm > 2.0 * self.envelope.clip_norm {
            return Err(PipelineError::ClipNormExceeded {
                norm: augmented_norm,
                clip_norm: self.envelope.clip_norm,
            });
        }
        if augmented_norm > self.envelope.clip_norm {
            let factor = self.envelope.clip_norm / (augmented_norm + 1e-12);
            gradient.scale(factor as f32);
        }

        // Rand-K per tensor; the index streams are keyed by
        // (worker, round, parameter) and re-derivable by the aggregator.
        let mut sparse_map: BTreeMap<String, SparseTensor> = BTreeMap::new();
        for (name, values) in gradient.iter() {
            let sparse = self.sparsifier.sparsify(
                self.worker_id.as_str(),
                input.round.0,
                name,
                values,
            );
            sparse_map.insert(name.clone(), sparse);
        }

        self.memory.update(input.round.0, &gradient, &sparse_map);

        let mut quantized: BTreeMap<String, QuantizedTensor> = BTreeMap::new();
        for (name, sparse) in &sparse_map {
            quantized.insert(name.clone(), self.quantizer.quantize(name, sparse)?);
        }

        // Pack: codes are at most 8 bits wide, so each occupies one
        // t-sized slot; parameters concatenate in name order.
        let slots: Vec<u16> = quantized
            .values()
            .flat_map(|q| q.codes.iter().copied())
            .collect();

        let ctx = EncryptionContext {
            key_id: self.key_id.as_str(),
            round: input.round.0,
            worker: self.worker_id.as_str(),
        };
        let payload = self.cipher.encrypt_vector(&slots, &self.csprng, &ctx)?;

        let precompression_bytes = 4 * gradient.total_elements() as u64;
        self.accountant.record(round_epsilon);

        let package = self.seal(
            &input,
            quantized,
            kept_weights,
            payload,
            clip.pre_clip_norm,
            clip.factor,
            precompression_bytes,
        )?;

        info!(
            worker = %self.worker_id,
            round = %input.round,
            slots = package.manifest.total_slots(),
            epsilon_consumed = self.accountant.consumed(),
            "sealed update package"
        );
        Ok(package)
    }

    #[allow(clippy::too_many_arguments)]
    fn seal(
        &self,
        input: &RoundInput,
        quantized: BTreeMap<String, QuantizedTensor>,
        expert_weights: BTreeMap<String, f32>,
        payload: Vec<sfup_crypto::Ciphertext>,
        pre_clip_norm: f64,
        clip_factor: f64,
        precompression_bytes: u64,
    ) -> PipelineResult<UpdatePackage> {
        let compression_meta: BTreeMap<String, CompressionMeta> = quantized
            .into_iter()
            .map(|(name, q)| {
                (
                    name,
                    CompressionMeta {
                        bits: q.bits,
                        n_slots: q.codes.len(),
                        scale: q.scale,
                        substream_tag: q.substream_tag,
                        zero_point: q.zero_point,
                    },
                )
            })
            .collect();

        let header = PackageHeader {
            key_id: self.key_id.as_str().to_string(),
            round: input.round.0,
            sig_alg: SIG_ALG_HYBRID.to_string(),
            timestamp_ms: input.timestamp_ms,
            worker_id: self.worker_id.as_str().to_string(),
        };
        let manifest = Manifest {
            compression_meta,
            expert_weights,
            safety_stats: SafetyStats {
                clip_norm_applied: clip_factor,
                dp_epsilon_consumed: self.accountant.consumed(),
                gradient_l2_pre_clip: pre_clip_norm,
                payload_bytes_precompression: precompression_bytes,
                sparsity_ratio: self.envelope.sparsity_ratio,
            },
            training_meta: input.training_meta.clone(),
        };

        let package = UpdatePackage::seal(header, manifest, payload, &self.signer)?;
        let bytes = package.to_bytes()?;
        let limit = self.envelope.max_update_size_bytes();
        if bytes.len() > limit {
            return Err(PipelineError::PayloadTooLarge {
                bytes: bytes.len(),
                limit,
            });
        }
        Ok(package)
    }
}

impl std::fmt::Debug for GradientPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradientPipeline")
            .field("worker_id", &self.worker_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfup_crypto::{N2heParams, SecretKey, SecurityLevel};

    fn test_envelope() -> OperatingEnvelope {
        OperatingEnvelope {
            clip_norm: 100.0,
            sparsity_ratio: 1.0,
            bits: 8,
            epsilon_cap: 10.0,
            epsilon_per_round: Some(0.5),
            max_update_size_kb: 65_536,
            max_quality_mse: 1.0,
            ..Default::default()
        }
    }

    fn test_pipeline(envelope: OperatingEnvelope) -> GradientPipeline {
        let csprng = Csprng::from_seed([42u8; 32]);
        let params = N2heParams::new(SecurityLevel::Bits128, envelope.mu).unwrap();
        let key = SecretKey::generate(&params, &csprng, "key-1").unwrap();
        let cipher = N2heCipher::new(params, key).unwrap();
        let schema = TensorSchema::new([("p".to_string(), 4), ("q".to_string(), 8)]);
        GradientPipeline::new(
            envelope,
            schema,
            WorkerId::new("worker-1"),
            KeyId::new("key-1"),
            csprng,
            cipher,
            HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]),
        )
    }

    fn round_input(round: u64, values: Vec<f32>) -> RoundInput {
        let mut grads = GradientSet::new();
        grads.insert("p", values);
        let mut experts = ExpertGradients::default();
        experts.insert("expert-a", grads, 1.0);
        RoundInput {
            round: RoundNumber(round),
            experts,
            training_meta: TrainingMeta {
                learning_rate: 1e-4,
                objective: "imitation".to_string(),
                optimizer: "adamw".to_string(),
                steps: 5,
            },
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_round_produces_valid_package() {
        let mut pipeline = test_pipeline(test_envelope());
        let package = pipeline
            .process_round(round_input(1, vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        assert_eq!(package.header.worker_id, "worker-1");
        assert_eq!(package.header.round, 1);
        assert_eq!(package.manifest.total_slots(), 4);
        assert_eq!(package.payload.len(), 4);
        assert!(package.manifest.safety_stats.gradient_l2_pre_clip > 0.0);
    }

    #[test]
    fn test_determinism_given_seed() {
        let mut a = test_pipeline(test_envelope());
        let mut b = test_pipeline(test_envelope());
        let pkg_a = a.process_round(round_input(1, vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        let pkg_b = b.process_round(round_input(1, vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(pkg_a.to_bytes().unwrap(), pkg_b.to_bytes().unwrap());
    }

    #[test]
    fn test_budget_hard_stop_before_work() {
        let mut envelope = test_envelope();
        envelope.epsilon_cap = 1.0;
        envelope.epsilon_per_round = Some(0.3);
        let mut pipeline = test_pipeline(envelope);
        for round in 1..=3 {
            pipeline
                .process_round(round_input(round, vec![1.0, 0.0, 0.0, 0.0]))
                .unwrap();
        }
        assert!(matches!(
            pipeline.process_round(round_input(4, vec![1.0, 0.0, 0.0, 0.0])),
            Err(PipelineError::PrivacyBudgetExhausted { .. })
        ));
    }

    #[test]
    fn test_empty_round_costs_no_epsilon() {
        let mut envelope = test_envelope();
        envelope.gate_threshold = 0.9;
        let mut pipeline = test_pipeline(envelope);
        let mut input = round_input(1, vec![1.0, 2.0, 3.0, 4.0]);
        // Gate weight 1.0 survives a 0.9 threshold, so rebuild with a weak
        // expert only.
        input.experts = ExpertGradients::default();
        let mut grads = GradientSet::new();
        grads.insert("p", vec![1.0, 2.0, 3.0, 4.0]);
        input.experts.insert("weak", grads, 0.1);

        let package = pipeline.process_round(input).unwrap();
        assert!(package.payload.is_empty());
        assert_eq!(package.manifest.safety_stats.dp_epsilon_consumed, 0.0);
        assert_eq!(pipeline.accountant().consumed(), 0.0);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut pipeline = test_pipeline(test_envelope());
        let mut input = round_input(1, vec![1.0; 4]);
        let mut grads = GradientSet::new();
        grads.insert("mystery", vec![1.0]);
        input.experts.insert("expert-b", grads, 1.0);
        assert!(matches!(
            pipeline.process_round(input),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn test_clipping_applied_and_recorded() {
        let mut envelope = test_envelope();
        envelope.clip_norm = 1.0;
        let mut pipeline = test_pipeline(envelope);
        let package = pipeline
            .process_round(round_input(1, vec![3.0, 4.0, 0.0, 0.0]))
            .unwrap();
        let stats = &package.manifest.safety_stats;
        assert!((stats.gradient_l2_pre_clip - 5.0).abs() < 1e-6);
        assert!((stats.clip_norm_applied - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_error_feedback_memory_populated_on_sparse_round() {
        let mut envelope = test_envelope();
        envelope.sparsity_ratio = 0.25;
        let mut pipeline = test_pipeline(envelope);
        pipeline
            .process_round(round_input(1, vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        // 3 of 4 entries were dropped; their mass is in the residual.
        assert!(pipeline.memory().residual_norm("p") > 0.0);
    }

    #[test]
    fn test_payload_size_limit_enforced() {
        let mut envelope = test_envelope();
        envelope.max_update_size_kb = 1;
        let mut pipeline = test_pipeline(envelope);
        assert!(matches!(
            pipeline.process_round(round_input(1, vec![1.0, 2.0, 3.0, 4.0])),
            Err(PipelineError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_package_round_trip_through_wire() {
        let mut pipeline = test_pipeline(test_envelope());
        let package = pipeline
            .process_round(round_input(1, vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let bytes = package.to_bytes().unwrap();
        let parsed = UpdatePackage::parse(&bytes, 1024).unwrap();
        assert_eq!(parsed.manifest, package.manifest);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }
}
