//! Versioned store of published model deltas
//!
//! Backs the `model_delta(key_id, round)` control-plane query and the
//! evaluation gate's reference lookup. Old deltas are pruned beyond a
//! configured retention depth.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sfup_common::{KeyId, ModelDelta, RoundNumber};
use thiserror::Error;

/// Error types for delta store operations
#[derive(Debug, Error)]
pub enum DeltaStoreError {
    /// No delta stored for this round.
    #[error("no delta for key {key_id} round {round}")]
    NotFound {
        /// Key id queried.
        key_id: KeyId,
        /// Round queried.
        round: RoundNumber,
    },
}

/// Metadata kept alongside each stored delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMetadata {
    /// Round number.
    pub round: RoundNumber,
    /// Publication time, ms since the Unix epoch.
    pub published_at_ms: u64,
    /// Contributor count.
    pub participant_count: usize,
    /// Delta L2 norm.
    pub delta_norm: f64,
}

/// In-memory delta store with bounded retention per key.
pub struct DeltaStore {
    deltas: BTreeMap<KeyId, BTreeMap<RoundNumber, (ModelDelta, DeltaMetadata)>>,
    max_versions: usize,
}

impl DeltaStore {
    /// Creates a store retaining at most `max_versions` rounds per key.
    pub fn new(max_versions: usize) -> Self {
        Self {
            deltas: BTreeMap::new(),
            max_versions: max_versions.max(1),
        }
    }

    /// Stores a published delta.
    pub fn store(&mut self, delta: ModelDelta, published_at_ms: u64) {
        let metadata = DeltaMetadata {
            round: delta.round,
            published_at_ms,
            participant_count: delta.participant_count,
            delta_norm: delta.l2_norm(),
        };
        let per_key = self.deltas.entry(delta.key_id.clone()).or_default();
        per_key.insert(delta.round, (delta, metadata));
        while per_key.len() > self.max_versions {
            let oldest = *per_key.keys().next().expect("non-empty map");
            per_key.remove(&oldest);
        }
    }

    /// Fetches a delta by key and round.
    pub fn get(&self, key_id: &KeyId, round: RoundNumber) -> Result<&ModelDelta, DeltaStoreError> {
        self.deltas
            .get(key_id)
            .and_then(|per_key| per_key.get(&round))
            .map(|(delta, _)| delta)
            .ok_or_else(|| DeltaStoreError::NotFound {
                key_id: key_id.clone(),
                round,
            })
    }

    /// Latest stored delta for a key.
    pub fn latest(&self, key_id: &KeyId) -> Option<&ModelDelta> {
        self.deltas
            .get(key_id)
            .and_then(|per_key| per_key.values().next_back())
            .map(|(delta, _)| delta)
    }

    /// Metadata for a stored delta.
    pub fn metadata(&self, key_id: &KeyId, round: RoundNumber) -> Option<&DeltaMetadata> {
        self.deltas
            .get(key_id)
            .and_then(|per_key| per_key.get(&round))
            .map(|(_, meta)| meta)
    }

    /// Number of retained deltas for a key.
    pub fn len(&self, key_id: &KeyId) -> usize {
        self.deltas.get(key_id).map_or(0, BTreeMap::len)
    }

    /// True when nothing is stored for the key.
    pub fn is_empty(&self, key_id: &KeyId) -> bool {
        self.len(key_id) == 0
    }
}
