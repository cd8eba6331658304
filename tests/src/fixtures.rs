//! Shared fixtures for the integration tests
//!
//! Workers and the aggregator share one process seed, so the LWE secret for
//! the fixture key id is identical on both sides, the way a deployed fleet
//! shares key material through the key provider.

use std::collections::BTreeMap;

use sfup_aggregator::{recover_delta, sum_ciphertexts, MadFilter};
use sfup_common::{
    AggregationWeights, ExpertGradients, GradientSet, KeyId, ModelDelta, OperatingEnvelope,
    RoundNumber, TensorSchema, WorkerId,
};
use sfup_crypto::{Csprng, HybridKeyPair, N2heCipher, N2heParams, SecretKey, SecurityLevel};
use sfup_package::{TrainingMeta, UpdatePackage};
use sfup_pipeline::{GradientPipeline, RoundInput};

/// Key id every fixture round is scoped to.
pub const KEY_ID: &str = "key-fixture";

/// Process seed shared by workers and the aggregator.
pub const PROCESS_SEED: [u8; 32] = [42u8; 32];

pub fn envelope(quorum: usize) -> OperatingEnvelope {
    OperatingEnvelope {
        clip_norm: 100.0,
        sparsity_ratio: 1.0,
        bits: 8,
        epsilon_cap: 100.0,
        epsilon_per_round: Some(0.1),
        quorum_threshold: quorum,
        max_quality_mse: 1.0,
        min_round_interval_secs: 0,
        round_timeout_secs: 3600,
        ..Default::default()
    }
}

pub fn schema_p4() -> TensorSchema {
    TensorSchema::new([("p".to_string(), 4)])
}

pub fn csprng() -> Csprng {
    Csprng::from_seed(PROCESS_SEED)
}

pub fn params(envelope: &OperatingEnvelope) -> N2heParams {
    N2heParams::new(SecurityLevel::Bits128, envelope.mu)
        .unwrap()
        .with_noise_budget_constant(envelope.noise_budget_constant)
}

pub fn shared_cipher(envelope: &OperatingEnvelope) -> N2heCipher {
    let params = params(envelope);
    let key = SecretKey::generate(&params, &csprng(), KEY_ID).unwrap();
    N2heCipher::new(params, key).unwrap()
}

/// Deterministic signing identity per worker name.
pub fn signer(worker: &str) -> HybridKeyPair {
    let mut ed_seed = [0u8; 32];
    let mut ml_seed = [1u8; 32];
    for (i, b) in worker.bytes().enumerate() {
        ed_seed[i % 32] ^= b;
        ml_seed[(i + 7) % 32] ^= b;
    }
    HybridKeyPair::from_seeds(ed_seed, ml_seed)
}

pub fn worker_pipeline(
    worker: &str,
    envelope: &OperatingEnvelope,
    schema: &TensorSchema,
) -> GradientPipeline {
    GradientPipeline::new(
        envelope.clone(),
        schema.clone(),
        WorkerId::new(worker),
        KeyId::new(KEY_ID),
        csprng(),
        shared_cipher(envelope),
        signer(worker),
    )
}

pub fn training_meta() -> TrainingMeta {
    TrainingMeta {
        learning_rate: 1e-4,
        objective: "imitation".to_string(),
        optimizer: "adamw".to_string(),
        steps: 5,
    }
}

pub fn round_input(round: u64, tensors: Vec<(&str, Vec<f32>)>) -> RoundInput {
    let mut grads = GradientSet::new();
    for (name, values) in tensors {
        grads.insert(name, values);
    }
    let mut experts = ExpertGradients::default();
    experts.insert("expert-a", grads, 1.0);
    RoundInput {
        round: RoundNumber(round),
        experts,
        training_meta: training_meta(),
        timestamp_ms: 1_700_000_000_000,
    }
}

/// Runs one worker's round over a single `p` tensor.
pub fn run_worker(
    worker: &str,
    round: u64,
    values: Vec<f32>,
    envelope: &OperatingEnvelope,
    schema: &TensorSchema,
) -> UpdatePackage {
    let mut pipeline = worker_pipeline(worker, envelope, schema);
    pipeline
        .process_round(round_input(round, vec![("p", values)]))
        .unwrap()
}

/// Synchronous aggregation path: MAD filter, homomorphic sum, decrypt,
/// inverse compression. Mirrors what the service task does per round.
pub fn aggregate(
    envelope: &OperatingEnvelope,
    schema: &TensorSchema,
    packages: Vec<UpdatePackage>,
    round: u64,
) -> ModelDelta {
    let mut by_worker: BTreeMap<WorkerId, UpdatePackage> = packages
        .into_iter()
        .map(|p| (WorkerId::new(p.header.worker_id.clone()), p))
        .collect();

    let reports: BTreeMap<WorkerId, f64> = by_worker
        .iter()
        .map(|(w, p)| (w.clone(), p.manifest.safety_stats.gradient_l2_pre_clip))
        .collect();
    let outcome = MadFilter::new(envelope.mad_k).filter(&reports);
    for excluded in &outcome.excluded {
        by_worker.remove(excluded);
    }
    assert!(
        by_worker.len() >= envelope.quorum_threshold,
        "post-filter quorum violated"
    );

    let weights = AggregationWeights::uniform(by_worker.keys().cloned());
    let summed = sum_ciphertexts(&params(envelope), schema, &by_worker, &weights).unwrap();
    recover_delta(
        &shared_cipher(envelope),
        &summed,
        KeyId::new(KEY_ID),
        RoundNumber(round),
    )
    .unwrap()
}
