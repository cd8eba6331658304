//! Full-service integration: key store, evidence log, aggregator task
//!
//! Drives the async control plane the way a transport layer would: submit
//! raw package bytes, poll round status, close the round, fetch the
//! published delta, and verify the evidence chain afterwards.

use std::collections::BTreeMap;

use sfup_aggregator::{
    AggregatorConfig, AggregatorError, AggregatorHandle, AggregatorService, RoundPhase,
    SubmitOutcome,
};
use sfup_common::{
    ExpertGradients, GradientSet, KeyId, OperatingEnvelope, RoundNumber, TensorSchema, WorkerId,
};
use sfup_crypto::{N2heCipher, SecretKey, SecurityLevel};
use sfup_evidence::{EvidenceHandle, EvidenceLog, EvidenceWriter};
use sfup_keys::{FileKeyStore, KeyProvider};
use sfup_package::UpdatePackage;
use sfup_pipeline::{GradientPipeline, RoundInput};

use crate::fixtures::{csprng, envelope, params, schema_p4, signer, training_meta};

struct Harness {
    key_id: KeyId,
    envelope: OperatingEnvelope,
    schema: TensorSchema,
    handle: AggregatorHandle,
    evidence: EvidenceHandle,
    _dir: tempfile::TempDir,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Harness {
    async fn start(quorum: usize, workers: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let envelope = envelope(quorum);
        let schema = schema_p4();

        let log = EvidenceLog::open(dir.path().join("evidence.log")).unwrap();
        let (evidence, _writer_task) = EvidenceWriter::spawn(log, 128);

        let mut store = FileKeyStore::open(
            dir.path().join("keys"),
            Some([0x22u8; 32]),
            csprng(),
        )
        .unwrap()
        .with_evidence(evidence.clone());
        let key_id = store.generate(128, "fleet-test").unwrap();
        store.activate(&key_id).unwrap();

        let identities: BTreeMap<WorkerId, _> = workers
            .iter()
            .map(|w| (WorkerId::new(*w), signer(w).public_key().clone()))
            .collect();

        let config = AggregatorConfig {
            envelope: envelope.clone(),
            schema: schema.clone(),
            security_level: SecurityLevel::Bits128,
            key_id: key_id.clone(),
            identities,
            weights: None,
            gate_thresholds: AggregatorConfig::default_gate(&envelope),
            queue_capacity: 32,
            first_round: RoundNumber(1),
            delta_retention: 8,
        };
        let (handle, _service_task) =
            AggregatorService::spawn(config, Box::new(store), evidence.clone()).unwrap();

        Self {
            key_id,
            envelope,
            schema,
            handle,
            evidence,
            _dir: dir,
        }
    }

    /// Seals a package for `worker` with the shared key from the store.
    fn seal(&self, worker: &str, round: u64, values: Vec<f32>) -> UpdatePackage {
        // Workers derive the identical secret from the shared process seed
        // and key id, the same way the store generated it.
        let n2he = params(&self.envelope);
        let secret = SecretKey::generate(&n2he, &csprng(), self.key_id.as_str()).unwrap();
        let cipher = N2heCipher::new(n2he, secret).unwrap();
        let mut pipeline = GradientPipeline::new(
            self.envelope.clone(),
            self.schema.clone(),
            WorkerId::new(worker),
            self.key_id.clone(),
            csprng(),
            cipher,
            signer(worker),
        );

        let mut grads = GradientSet::new();
        grads.insert("p", values);
        let mut experts = ExpertGradients::default();
        experts.insert("expert-a", grads, 1.0);
        pipeline
            .process_round(RoundInput {
                round: RoundNumber(round),
                experts,
                training_meta: training_meta(),
                timestamp_ms: now_ms(),
            })
            .unwrap()
    }

    async fn submit(&self, package: &UpdatePackage) -> SubmitOutcome {
        self.handle
            .submit(package.to_bytes().unwrap())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn service_publishes_a_quorate_round() {
    let harness = Harness::start(2, &["w1", "w2", "w3"]).await;

    let p1 = harness.seal("w1", 1, vec![1.0, 2.0, 3.0, 4.0]);
    let p2 = harness.seal("w2", 1, vec![2.0, 2.0, 2.0, 2.0]);
    let p3 = harness.seal("w3", 1, vec![3.0, 0.0, 3.0, 0.0]);
    let scale = p1.manifest.compression_meta["p"].scale;

    assert_eq!(harness.submit(&p1).await, SubmitOutcome::Accepted);
    assert_eq!(harness.submit(&p2).await, SubmitOutcome::Accepted);
    assert_eq!(harness.submit(&p3).await, SubmitOutcome::Accepted);

    // Duplicate submissions bounce.
    assert!(matches!(
        harness.submit(&p1).await,
        SubmitOutcome::Rejected(reason) if reason.contains("duplicate")
    ));

    let status = harness.handle.round_status().await.unwrap();
    assert_eq!(status.phase, RoundPhase::QuorumReached);
    assert_eq!(status.received, 3);

    let delta = harness.handle.close_round().await.unwrap();
    assert_eq!(delta.participant_count, 3);
    let expected = [2.0f64, 4.0 / 3.0, 8.0 / 3.0, 2.0];
    for (i, &e) in expected.iter().enumerate() {
        let got = f64::from(delta.tensors["p"][i]);
        assert!(
            (got - e).abs() <= 3.0 * scale,
            "element {i}: {got} vs {e}"
        );
    }

    // The published delta is queryable and the past round reads PUBLISHED.
    let fetched = harness.handle.model_delta(RoundNumber(1)).await.unwrap();
    assert!(fetched.is_some());
    let past = harness
        .handle
        .round_status_of(Some(RoundNumber(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(past.phase, RoundPhase::Published);

    // The next round opened, sequentially numbered.
    let current = harness.handle.round_status().await.unwrap();
    assert_eq!(current.round, RoundNumber(2));
    assert_eq!(current.phase, RoundPhase::Collecting);

    // The whole run left a verifiable evidence chain.
    let events = harness.evidence.verify().await.unwrap();
    assert!(events >= 6, "expected a populated chain, got {events}");
}

#[tokio::test]
async fn single_worker_below_quorum_is_refused() {
    let harness = Harness::start(2, &["w1"]).await;
    let p1 = harness.seal("w1", 1, vec![1.0, 0.0, 0.0, 0.0]);
    assert_eq!(harness.submit(&p1).await, SubmitOutcome::Accepted);

    let err = harness.handle.close_round().await.unwrap_err();
    assert!(matches!(
        err,
        AggregatorError::QuorumNotReached {
            got: 1,
            required: 2
        }
    ));
    let past = harness
        .handle
        .round_status_of(Some(RoundNumber(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(past.phase, RoundPhase::Failed);
}

#[tokio::test]
async fn tampered_and_unknown_packages_rejected() {
    let harness = Harness::start(2, &["w1", "w2"]).await;

    // Bit-flipped payload fails the hash check.
    let p1 = harness.seal("w1", 1, vec![1.0, 0.0, 0.0, 0.0]);
    let mut bytes = p1.to_bytes().unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    assert!(matches!(
        harness.handle.submit(bytes).await.unwrap(),
        SubmitOutcome::Rejected(_)
    ));

    // A worker with no published identity is refused.
    let stranger = harness.seal("w9", 1, vec![1.0, 0.0, 0.0, 0.0]);
    assert!(matches!(
        harness.submit(&stranger).await,
        SubmitOutcome::Rejected(reason) if reason.contains("identity")
    ));
}

#[tokio::test]
async fn empty_package_rejected_by_aggregator() {
    let harness = Harness::start(1, &["w1"]).await;

    // Gate threshold above every expert weight: the pipeline seals an empty
    // package with zero epsilon cost, and the aggregator bounces it.
    let n2he = params(&harness.envelope);
    let secret = SecretKey::generate(&n2he, &csprng(), harness.key_id.as_str()).unwrap();
    let cipher = N2heCipher::new(n2he, secret).unwrap();
    let mut strict = harness.envelope.clone();
    strict.gate_threshold = 0.99;
    let mut pipeline = GradientPipeline::new(
        strict,
        harness.schema.clone(),
        WorkerId::new("w1"),
        harness.key_id.clone(),
        csprng(),
        cipher,
        signer("w1"),
    );
    let mut grads = GradientSet::new();
    grads.insert("p", vec![1.0, 0.0, 0.0, 0.0]);
    let mut experts = ExpertGradients::default();
    experts.insert("weak", grads, 0.5);
    let package = pipeline
        .process_round(RoundInput {
            round: RoundNumber(1),
            experts,
            training_meta: training_meta(),
            timestamp_ms: now_ms(),
        })
        .unwrap();
    assert!(package.payload.is_empty());
    assert_eq!(package.manifest.safety_stats.dp_epsilon_consumed, 0.0);

    assert!(matches!(
        harness.submit(&package).await,
        SubmitOutcome::Rejected(reason) if reason.contains("empty")
    ));
}
