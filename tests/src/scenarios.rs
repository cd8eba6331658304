//! Deterministic end-to-end scenarios
//!
//! Each test pins seeds, so every run exercises identical ciphertexts,
//! index sets and noise draws.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use sfup_crypto::n2he::EncryptionContext;
use sfup_crypto::{draw_indices, CryptoError};
use sfup_evidence::{verify_file, EventType, EvidenceError, EvidenceLog};
use sfup_pipeline::PipelineError;

use crate::fixtures::*;

/// Scenario 1: three workers, no clipping, dense transmission, uniform
/// weights. The aggregate is the element-wise mean within a few
/// quantization steps.
#[test]
fn happy_path_sum() {
    let envelope = envelope(3);
    let schema = schema_p4();

    let packages = vec![
        run_worker("worker-1", 1, vec![1.0, 2.0, 3.0, 4.0], &envelope, &schema),
        run_worker("worker-2", 1, vec![2.0, 2.0, 2.0, 2.0], &envelope, &schema),
        run_worker("worker-3", 1, vec![3.0, 0.0, 3.0, 0.0], &envelope, &schema),
    ];
    let scale = packages[0].manifest.compression_meta["p"].scale;

    let delta = aggregate(&envelope, &schema, packages, 1);
    let expected = [2.0f64, 4.0 / 3.0, 8.0 / 3.0, 2.0];
    let tolerance = 3.0 * scale;
    for (i, &e) in expected.iter().enumerate() {
        let got = f64::from(delta.tensors["p"][i]);
        assert!(
            (got - e).abs() <= tolerance,
            "element {i}: got {got}, expected {e} +/- {tolerance}"
        );
    }
    assert_eq!(delta.participant_count, 3);
}

/// Scenario 2: a fourth worker reporting an absurd pre-clip norm is
/// excluded by the MAD filter and the aggregate matches scenario 1.
#[test]
fn outlier_rejection() {
    let envelope = envelope(3);
    let schema = schema_p4();

    let honest = vec![
        run_worker("worker-1", 1, vec![1.0, 2.0, 3.0, 4.0], &envelope, &schema),
        run_worker("worker-2", 1, vec![2.0, 2.0, 2.0, 2.0], &envelope, &schema),
        run_worker("worker-3", 1, vec![3.0, 0.0, 3.0, 0.0], &envelope, &schema),
    ];
    let baseline = aggregate(&envelope, &schema, honest.clone(), 1);

    // Reported gradient_l2_pre_clip of 1e6; clipping shrinks the payload to
    // the clip ball, but the metadata alone flags the worker.
    let attacker = run_worker(
        "worker-4",
        1,
        vec![1_000_000.0, 0.0, 0.0, 0.0],
        &envelope,
        &schema,
    );
    assert_eq!(
        attacker.manifest.safety_stats.gradient_l2_pre_clip,
        1_000_000.0
    );

    let mut with_attacker = honest;
    with_attacker.push(attacker);
    let filtered = aggregate(&envelope, &schema, with_attacker, 1);

    assert_eq!(filtered.participant_count, 3);
    for i in 0..4 {
        assert_eq!(filtered.tensors["p"][i], baseline.tensors["p"][i]);
    }
}

/// Scenario 3: heavy accumulation stays decryptable up to the noise
/// budget and surfaces `NoiseBudgetExhausted` beyond it, never silently
/// corrupting.
#[test]
fn noise_budget_stress() {
    let envelope = envelope(1);
    let n2he = params(&envelope);
    let cipher = shared_cipher(&envelope);
    let budget = n2he.max_additions();
    assert!(budget >= 100_000, "budget {budget} below the stress target");

    let ctx = EncryptionContext {
        key_id: KEY_ID,
        round: 1,
        worker: "worker-1",
    };
    let fresh = cipher.encrypt_vector(&[3], &csprng(), &ctx).unwrap();

    let mut acc = fresh[0].clone();
    for _ in 1..100_000u64 {
        n2he.add_assign(&mut acc, &fresh[0]).unwrap();
    }
    assert_eq!(acc.accumulated, 100_000);

    // Summing one fresh ciphertext with itself accumulates its noise
    // coherently, so allow the rounding drift that coherent noise causes;
    // the budget's variance model assumes independent summands.
    let decrypted = i64::from(cipher.decrypt(&acc).unwrap());
    let expected = (100_000i64 * 3) % 65_536;
    assert!(
        (decrypted - expected).abs() <= 64,
        "decrypted {decrypted}, expected near {expected}"
    );

    // One past the budget must refuse, both at addition and at decryption.
    let mut over = acc.clone();
    over.accumulated = budget;
    assert!(matches!(
        n2he.add_assign(&mut over, &fresh[0]),
        Err(CryptoError::NoiseBudgetExhausted { .. })
    ));
    let mut corrupt = acc;
    corrupt.accumulated = budget + 1;
    assert!(matches!(
        cipher.decrypt(&corrupt),
        Err(CryptoError::NoiseBudgetExhausted { .. })
    ));
}

/// Scenario 4: ε cap 1.0 at 0.3 per round: rounds 1-3 succeed, round 4 is
/// rejected before any gradient work.
#[test]
fn dp_hard_stop() {
    let mut envelope = envelope(1);
    envelope.epsilon_cap = 1.0;
    envelope.epsilon_per_round = Some(0.3);
    let schema = schema_p4();
    let mut pipeline = worker_pipeline("worker-1", &envelope, &schema);

    for round in 1..=3 {
        pipeline
            .process_round(round_input(round, vec![("p", vec![1.0, 0.0, 0.0, 0.0])]))
            .unwrap();
    }
    assert!((pipeline.accountant().consumed() - 0.9).abs() < 1e-9);

    let err = pipeline
        .process_round(round_input(4, vec![("p", vec![1.0, 0.0, 0.0, 0.0])]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::PrivacyBudgetExhausted { .. }));
}

/// Scenario 5: flipping one byte of event 50 in a 100-event chain is
/// reported at exactly sequence 50 and halts further writes.
#[test]
fn evidence_tamper() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evidence.log");

    let mut log = EvidenceLog::open(&path).unwrap();
    for i in 0..100 {
        log.append(EventType::PackageAccepted, "aggregator", &format!("pkg-{i}"))
            .unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    lines[50] = lines[50].replace("pkg-50", "pkg-5X");
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    match verify_file(&path).unwrap_err() {
        EvidenceError::ChainMismatch {
            sequence,
            expected,
            actual,
        } => {
            assert_eq!(sequence, 50);
            assert_ne!(expected, actual);
        }
        other => panic!("expected ChainMismatch, got {other:?}"),
    }

    assert!(log.verify_chain().is_err());
    assert!(matches!(
        log.append(EventType::PackageAccepted, "aggregator", "pkg-after"),
        Err(EvidenceError::Halted)
    ));
}

/// Scenario 6: random gradient under seed 42, clipped at 1.0, Rand-K at
/// ρ = 0.01, quantized at 8 bits, encrypted, summed (n = 1), recovered;
/// per-element MSE of the surviving coordinates stays under 0.05.
#[test]
fn round_trip_seed_42() {
    let mut envelope = envelope(1);
    envelope.clip_norm = 1.0;
    envelope.sparsity_ratio = 0.01;
    envelope.max_quality_mse = 0.05;
    let n = 1000usize;
    let schema = sfup_common::TensorSchema::new([("p".to_string(), n)]);

    let mut rng = ChaCha20Rng::seed_from_u64(42);
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();

    let package = run_worker("worker-1", 1, values.clone(), &envelope, &schema);
    let meta = package.manifest.compression_meta["p"].clone();
    assert_eq!(meta.n_slots, 10);

    let delta = aggregate(&envelope, &schema, vec![package], 1);

    // Reference: the clipped gradient at the worker's selected indices.
    let norm = values
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt();
    let factor = (1.0 / (norm + 1e-12)).min(1.0) as f32;
    let indices = draw_indices(&meta.substream_tag, n, 10);

    let mut total_sq = 0.0f64;
    for &i in &indices {
        let expected = f64::from(values[i as usize] * factor);
        let got = f64::from(delta.tensors["p"][i as usize]);
        total_sq += (got - expected).powi(2);
    }
    let mse = total_sq / indices.len() as f64;
    assert!(mse <= 0.05, "round-trip MSE {mse} exceeds 0.05");

    // Unselected coordinates stay exactly zero.
    let selected: std::collections::BTreeSet<u32> = indices.into_iter().collect();
    for (i, &v) in delta.tensors["p"].iter().enumerate() {
        if !selected.contains(&(i as u32)) {
            assert_eq!(v, 0.0);
        }
    }
}

/// ρ = 1 is plain dense transmission: every coordinate of a single-worker
/// round reconstructs within half a quantization step.
#[test]
fn full_density_matches_dense_transmission() {
    let envelope = envelope(1);
    let schema = schema_p4();
    let values = vec![1.5f32, -0.75, 0.0, 42.0];
    let package = run_worker("worker-1", 1, values.clone(), &envelope, &schema);
    let scale = package.manifest.compression_meta["p"].scale;

    let delta = aggregate(&envelope, &schema, vec![package], 1);
    for (i, &v) in values.iter().enumerate() {
        let got = f64::from(delta.tensors["p"][i]);
        assert!(
            (got - f64::from(v)).abs() <= scale / 2.0 + 1e-9,
            "element {i}: {got} vs {v}"
        );
    }
}
