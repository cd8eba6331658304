//! Affine quantization with an empirical quality monitor
//!
//! Values quantize as `q = clamp(round(v/scale) + zero_point, 0, 2^bits−1)`
//! and reconstruct as `v ≈ (q − zero_point)·scale`. The range is the
//! deployment's symmetric clipping interval `[−clip_norm, +clip_norm]`, so
//! `scale = 2·clip_norm/(2^bits−1)` and every worker carries identical
//! metadata per round. Identical metadata is what keeps the homomorphic sum
//! invertible: the aggregator's weighted-combination dequantization is exact
//! when scales agree, approximate otherwise.
//!
//! Every tensor's actual mean-squared error is measured against the
//! envelope ceiling, not just bound-checked analytically.

use tracing::trace;

use crate::error::{PipelineError, PipelineResult};
use crate::sparsify::SparseTensor;

/// A quantized sparse tensor plus its dequantization metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    /// Selected indices, ascending (copied from the sparse tensor).
    pub indices: Vec<u32>,
    /// Quantized codes, each in `[0, 2^bits)`.
    pub codes: Vec<u16>,
    /// Dequantization scale.
    pub scale: f64,
    /// Dequantization zero point.
    pub zero_point: u32,
    /// Bit width.
    pub bits: u8,
    /// Dense tensor length.
    pub dense_len: usize,
    /// Public substream tag (copied from the sparse tensor).
    pub substream_tag: String,
    /// Measured mean-squared reconstruction error.
    pub mse: f64,
}

impl QuantizedTensor {
    /// Reconstructs the sparse values.
    pub fn dequantize(&self) -> Vec<f32> {
        self.codes
            .iter()
            .map(|&q| ((f64::from(q) - f64::from(self.zero_point)) * self.scale) as f32)
            .collect()
    }
}

/// Quantizer over the symmetric range `[−range_radius, +range_radius]`.
#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    bits: u8,
    max_mse: f64,
    range_radius: f64,
}

impl Quantizer {
    /// Creates a quantizer; `bits` is validated by the envelope and
    /// `range_radius` is the deployment clip norm.
    pub fn new(bits: u8, max_mse: f64, range_radius: f64) -> Self {
        Self {
            bits,
            max_mse,
            range_radius,
        }
    }

    /// Highest representable code.
    fn q_max(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Scale shared by every tensor this quantizer touches.
    pub fn scale(&self) -> f64 {
        2.0 * self.range_radius / f64::from(self.q_max())
    }

    /// Zero point shared by every tensor this quantizer touches.
    pub fn zero_point(&self) -> u32 {
        ((self.range_radius / self.scale()).round() as u32).min(self.q_max())
    }

    /// Quantizes one sparse tensor, measuring reconstruction error.
    pub fn quantize(
        &self,
        parameter: &str,
        sparse: &SparseTensor,
    ) -> PipelineResult<QuantizedTensor> {
        let scale = self.scale();
        let zero_point = self.zero_point();
        let codes = Self::requantize(&sparse.values, scale, zero_point, self.bits);
        let mse = mean_squared_error(&sparse.values, &codes, scale, zero_point);
        trace!(parameter, mse, scale, zero_point, "quantized tensor");
        if mse > self.max_mse {
            return Err(PipelineError::QuantizationQualityLoss {
                parameter: parameter.to_string(),
                mse,
                max_mse: self.max_mse,
            });
        }

        Ok(QuantizedTensor {
            indices: sparse.indices.clone(),
            codes,
            scale,
            zero_point,
            bits: self.bits,
            dense_len: sparse.dense_len,
            substream_tag: sparse.substream_tag.clone(),
            mse,
        })
    }

    /// Quantizes values under explicit metadata. Applying this to a
    /// tensor's own dequantization reproduces the codes exactly.
    pub fn requantize(values: &[f32], scale: f64, zero_point: u32, bits: u8) -> Vec<u16> {
        let q_max = f64::from((1u32 << bits) - 1);
        values
            .iter()
            .map(|&v| {
                let q = (f64::from(v) / scale).round() + f64::from(zero_point);
                q.clamp(0.0, q_max) as u16
            })
            .collect()
    }
}

fn mean_squared_error(values: &[f32], codes: &[u16], scale: f64, zero_point: u32) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values
        .iter()
        .zip(codes.iter())
        .map(|(&v, &q)| {
            let rec = (f64::from(q) - f64::from(zero_point)) * scale;
            (f64::from(v) - rec).powi(2)
        })
        .sum::<f64>()
        / values.len() as f64
}
