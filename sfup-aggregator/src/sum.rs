//! Homomorphic summation across surviving packages
//!
//! Ciphertext slots are aligned by dense element position: each worker's
//! Rand-K index set is re-derived from the substream tag announced in its
//! manifest, and slot `i` of a package lands on dense index `indices[i]` of
//! its parameter. Elements accumulate componentwise mod `q` over however
//! many workers covered them; the per-element weight sum becomes the
//! denominator at recovery time.
//!
//! Integer aggregation weights are applied by repeated ciphertext addition,
//! which keeps the implicit plaintext sum an integer mod `t`. The fold is
//! exactly associative mod `q`, so accumulation order never affects the
//! result.

use std::collections::BTreeMap;

use sfup_common::{AggregationWeights, TensorSchema, WorkerId};
use sfup_crypto::{draw_indices, Ciphertext, N2heParams};
use sfup_package::UpdatePackage;
use tracing::debug;

use crate::error::{AggregatorError, AggregatorResult};

/// Accumulated ciphertexts and metadata for one parameter.
#[derive(Debug)]
pub struct SummedParameter {
    /// Dense tensor length.
    pub dense_len: usize,
    /// Summed ciphertext per dense element; `None` where no worker
    /// contributed.
    pub slots: Vec<Option<Ciphertext>>,
    /// Sum of contribution weights per element.
    pub weight_sum: Vec<u32>,
    /// Sum of `weight · zero_point` per element.
    pub zero_point_sum: Vec<u64>,
    /// Sum of `weight · scale` per element.
    pub scale_weighted_sum: Vec<f64>,
}

impl SummedParameter {
    fn new(dense_len: usize) -> Self {
        Self {
            dense_len,
            slots: (0..dense_len).map(|_| None).collect(),
            weight_sum: vec![0; dense_len],
            zero_point_sum: vec![0; dense_len],
            scale_weighted_sum: vec![0.0; dense_len],
        }
    }
}

/// All accumulated parameters of a round.
#[derive(Debug)]
pub struct SummedRound {
    /// Per-parameter accumulation.
    pub parameters: BTreeMap<String, SummedParameter>,
    /// Workers folded into the sum, in id order.
    pub contributors: Vec<WorkerId>,
}

/// Folds the surviving packages into per-element ciphertext sums.
pub fn sum_ciphertexts(
    params: &N2heParams,
    schema: &TensorSchema,
    packages: &BTreeMap<WorkerId, UpdatePackage>,
    weights: &AggregationWeights,
) -> AggregatorResult<SummedRound> {
    // Plaintext headroom: the largest possible slot sum must stay below t.
    let max_bits = packages
        .values()
        .flat_map(|p| p.manifest.compression_meta.values())
        .map(|m| m.bits)
        .max()
        .unwrap_or(8);
    let total_weight: u64 = packages
        .keys()
        .map(|w| u64::from(weights.numerator(w)))
        .sum();
    let code_max = (1u64 << max_bits) - 1;
    if total_weight * code_max >= sfup_crypto::n2he::PLAINTEXT_MODULUS {
        return Err(AggregatorError::PlaintextOverflow {
            total_weight,
            bits: max_bits,
        });
    }

    let mut parameters: BTreeMap<String, SummedParameter> = BTreeMap::new();
    let mut contributors = Vec::new();

    for (worker, package) in packages {
        let weight = weights.numerator(worker);
        if weight == 0 {
            debug!(worker = %worker, "zero-weight worker skipped");
            continue;
        }
        contributors.push(worker.clone());

        let mut offset = 0usize;
        for (name, meta) in &package.manifest.compression_meta {
            let dense_len = schema.len_of(name).ok_or_else(|| {
                AggregatorError::SlotMismatch {
                    parameter: name.clone(),
                    expected: 0,
                    got: meta.n_slots,
                }
            })?;
            let indices = draw_indices(&meta.substream_tag, dense_len, meta.n_slots);
            if indices.len() != meta.n_slots {
                return Err(AggregatorError::SlotMismatch {
                    parameter: name.clone(),
                    expected: meta.n_slots,
                    got: indices.len(),
                });
            }
            if offset + meta.n_slots > package.payload.len() {
                return Err(AggregatorError::SlotMismatch {
                    parameter: name.clone(),
                    expected: meta.n_slots,
                    got: package.payload.len().saturating_sub(offset),
                });
            }
            let slots = &package.payload[offset..offset + meta.n_slots];
            offset += meta.n_slots;

            let entry = parameters
                .entry(name.clone())
                .or_insert_with(|| SummedParameter::new(dense_len));

            for (ct, &dense_idx) in slots.iter().zip(indices.iter()) {
                let i = dense_idx as usize;
                // Weight w folds the same fresh ciphertext w times.
                match &mut entry.slots[i] {
                    Some(acc) => {
                        for _ in 0..weight {
                            params.add_assign(acc, ct)?;
                        }
                    }
                    slot @ None => {
                        let mut acc = ct.clone();
                        for _ in 1..weight {
                            params.add_assign(&mut acc, ct)?;
                        }
                        *slot = Some(acc);
                    }
                }
                entry.weight_sum[i] += weight;
                entry.zero_point_sum[i] += u64::from(weight) * u64::from(meta.zero_point);
                entry.scale_weighted_sum[i] += f64::from(weight) * meta.scale;
            }
        }
    }

    Ok(SummedRound {
        parameters,
        contributors,
    })
}
