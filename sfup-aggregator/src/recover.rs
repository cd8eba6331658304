//! Decryption and inverse compression
//!
//! Each summed element decrypts to `Σ wᵢ·qᵢ mod t` (exact, because the
//! headroom check bounds the true sum below `t`). Dequantization inverts
//! the affine encoding with the weighted-average scale and the summed zero
//! points, then divides by the element's weight sum, which is the
//! per-element contributor denominator Rand-K coverage requires.

use std::collections::BTreeMap;

use sfup_common::{KeyId, ModelDelta, RoundNumber};
use sfup_crypto::N2heCipher;

use crate::error::AggregatorResult;
use crate::sum::SummedRound;

/// Decrypts a summed round and reconstructs the model delta.
pub fn recover_delta(
    cipher: &N2heCipher,
    summed: &SummedRound,
    key_id: KeyId,
    round: RoundNumber,
) -> AggregatorResult<ModelDelta> {
    let mut tensors = BTreeMap::new();

    for (name, param) in &summed.parameters {
        let mut dense = vec![0.0f32; param.dense_len];
        for i in 0..param.dense_len {
            let Some(ct) = &param.slots[i] else {
                continue;
            };
            let weight = param.weight_sum[i];
            if weight == 0 {
                continue;
            }
            let q_sum = i64::from(cipher.decrypt(ct)?);
            let zp_sum = param.zero_point_sum[i] as i64;
            let scale_avg = param.scale_weighted_sum[i] / f64::from(weight);
            dense[i] = ((q_sum - zp_sum) as f64 * scale_avg / f64::from(weight)) as f32;
        }
        tensors.insert(name.clone(), dense);
    }

    Ok(ModelDelta {
        round,
        key_id,
        tensors,
        participant_count: summed.contributors.len(),
    })
}

/// KL-divergence proxy between two deltas.
///
/// Each delta's absolute values normalize to a distribution over elements;
/// the proxy is `Σ p·ln(p/q)` with additive smoothing so disjoint supports
/// stay finite. Returns 0 when either side is empty.
pub fn kl_divergence_proxy(current: &ModelDelta, reference: &ModelDelta) -> f64 {
    const SMOOTHING: f64 = 1e-9;

    let flatten = |delta: &ModelDelta| -> Vec<f64> {
        delta
            .tensors
            .values()
            .flat_map(|v| v.iter().map(|&x| f64::from(x).abs() + SMOOTHING))
            .collect()
    };

    let p_raw = flatten(current);
    let q_raw = flatten(reference);
    if p_raw.is_empty() || p_raw.len() != q_raw.len() {
        return 0.0;
    }

    let p_total: f64 = p_raw.iter().sum();
    let q_total: f64 = q_raw.iter().sum();
    p_raw
        .iter()
        .zip(q_raw.iter())
        .map(|(&p, &q)| {
            let p_norm = p / p_total;
            let q_norm = q / q_total;
            p_norm * (p_norm / q_norm).ln()
        })
        .sum()
}
