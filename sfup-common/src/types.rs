//! Core identifier and tensor types shared by workers and the aggregator
//!
//! Gradient sets are parameter-name-indexed maps over dense `f32` vectors.
//! `BTreeMap` is used throughout so iteration order (and therefore norm
//! computation, packing and serialization) is deterministic across
//! participants.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable worker identity within a fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Creates a worker id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a shared encryption key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub String);

impl KeyId {
    /// Creates a key id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone round counter, scoped to a key id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RoundNumber(pub u64);

impl RoundNumber {
    /// The next round.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RoundNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed parameter shapes for a deployment.
///
/// Shapes are loaded once at initialization and shared by every participant;
/// a gradient set whose tensors do not match the schema is rejected before
/// it enters the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSchema {
    /// Flattened element count per parameter name.
    pub shapes: BTreeMap<String, usize>,
}

impl TensorSchema {
    /// Builds a schema from `(name, len)` pairs.
    pub fn new(shapes: impl IntoIterator<Item = (String, usize)>) -> Self {
        Self {
            shapes: shapes.into_iter().collect(),
        }
    }

    /// Returns the flattened length of a parameter, if known.
    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.shapes.get(name).copied()
    }

    /// Checks a gradient set against the schema.
    ///
    /// Every tensor in the set must be named in the schema with a matching
    /// length. The set may cover a subset of the schema (experts touch
    /// different parameters per round).
    pub fn check(&self, set: &GradientSet) -> Result<(), String> {
        for (name, values) in set.iter() {
            match self.shapes.get(name) {
                None => return Err(format!("unknown parameter: {name}")),
                Some(&len) if len != values.len() => {
                    return Err(format!(
                        "parameter {name}: expected {len} elements, got {}",
                        values.len()
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Total element count across the schema.
    pub fn total_elements(&self) -> usize {
        self.shapes.values().sum()
    }
}

/// Dense gradient tensors indexed by parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GradientSet {
    tensors: BTreeMap<String, Vec<f32>>,
}

impl GradientSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tensor.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(name.into(), values);
    }

    /// Returns a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Vec<f32>> {
        self.tensors.get(name)
    }

    /// Returns a mutable tensor by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        self.tensors.get_mut(name)
    }

    /// Iterates tensors in parameter-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.tensors.iter()
    }

    /// Iterates tensors mutably in parameter-name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Vec<f32>)> {
        self.tensors.iter_mut()
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True when the set holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Removes a tensor, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<Vec<f32>> {
        self.tensors.remove(name)
    }

    /// L2 norm over all tensors concatenated in name order.
    pub fn l2_norm(&self) -> f64 {
        self.tensors
            .values()
            .flat_map(|v| v.iter())
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt()
    }

    /// Scales every element in place.
    pub fn scale(&mut self, factor: f32) {
        for values in self.tensors.values_mut() {
            for v in values.iter_mut() {
                *v *= factor;
            }
        }
    }

    /// Adds `other` elementwise; tensors present only in `other` are copied.
    ///
    /// Tensors that exist in both sets must have equal lengths; the caller
    /// validates against the schema first.
    pub fn add_assign(&mut self, other: &GradientSet) {
        for (name, values) in other.iter() {
            match self.tensors.get_mut(name) {
                Some(existing) => {
                    for (a, b) in existing.iter_mut().zip(values.iter()) {
                        *a += *b;
                    }
                }
                None => {
                    self.tensors.insert(name.clone(), values.clone());
                }
            }
        }
    }

    /// Total element count.
    pub fn total_elements(&self) -> usize {
        self.tensors.values().map(Vec::len).sum()
    }
}

impl FromIterator<(String, Vec<f32>)> for GradientSet {
    fn from_iter<I: IntoIterator<Item = (String, Vec<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Per-expert gradient sets with their gate weights for one round.
#[derive(Debug, Clone, Default)]
pub struct ExpertGradients {
    /// Gradient set per expert name.
    pub experts: BTreeMap<String, GradientSet>,
    /// Gate weight in `[0, 1]` per expert name.
    pub gate_weights: BTreeMap<String, f32>,
}

impl ExpertGradients {
    /// Adds an expert's gradients with its gate weight.
    pub fn insert(&mut self, expert: impl Into<String>, grads: GradientSet, weight: f32) {
        let expert = expert.into();
        self.experts.insert(expert.clone(), grads);
        self.gate_weights.insert(expert, weight);
    }
}

/// Integer aggregation weights over a common denominator.
///
/// Worker `i` contributes with weight `numerators[i] / denominator`. Keeping
/// the numerators integral keeps the implicit homomorphic sum an integer
/// modulo the plaintext modulus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationWeights {
    /// Integer numerator per worker.
    pub numerators: BTreeMap<WorkerId, u32>,
    /// Shared denominator, > 0.
    pub denominator: u32,
}

impl AggregationWeights {
    /// Uniform weights `1/n` over the given workers.
    pub fn uniform(workers: impl IntoIterator<Item = WorkerId>) -> Self {
        let numerators: BTreeMap<WorkerId, u32> =
            workers.into_iter().map(|w| (w, 1)).collect();
        let denominator = numerators.len().max(1) as u32;
        Self {
            numerators,
            denominator,
        }
    }

    /// Numerator for a worker, zero when absent.
    pub fn numerator(&self, worker: &WorkerId) -> u32 {
        self.numerators.get(worker).copied().unwrap_or(0)
    }
}

/// Aggregated model delta published at the end of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDelta {
    /// Round that produced the delta.
    pub round: RoundNumber,
    /// Key id the round was scoped to.
    pub key_id: KeyId,
    /// Dense delta tensors per parameter.
    pub tensors: BTreeMap<String, Vec<f32>>,
    /// Number of workers that survived filtering and contributed.
    pub participant_count: usize,
}

impl ModelDelta {
    /// L2 norm over all delta tensors.
    pub fn l2_norm(&self) -> f64 {
        self.tensors
            .values()
            .flat_map(|v| v.iter())
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt()
    }
}
