//! External KMS back-end
//!
//! The provider holds only opaque handles; secret material never rests
//! locally and is unwrapped per operation through the [`KmsClient`]
//! capability. Encryption itself always happens locally with the unwrapped
//! material.

use std::collections::BTreeMap;

use sfup_common::KeyId;
use sfup_evidence::{EventType, EvidenceHandle};
use tracing::{info, warn};

use crate::provider::{now_ms, KeyError, KeyMaterial, KeyMetadata, KeyProvider, KeyState};

/// Minimal surface an external KMS must offer.
///
/// Real deployments implement this against their KMS API; tests use an
/// in-memory double.
pub trait KmsClient {
    /// Creates a key remotely, returning an opaque handle.
    fn create_key(&mut self, security_level: u16) -> Result<String, KeyError>;

    /// Unwraps the secret material behind a handle for one local operation.
    fn unwrap_material(&self, handle: &str) -> Result<Vec<u8>, KeyError>;

    /// Schedules remote destruction of a handle.
    fn destroy(&mut self, handle: &str) -> Result<(), KeyError>;
}

/// Key provider backed by an external KMS.
pub struct KmsKeyProvider<C: KmsClient> {
    client: C,
    keys: BTreeMap<KeyId, KeyMetadata>,
    handles: BTreeMap<KeyId, String>,
    evidence: Option<EvidenceHandle>,
    max_uses: u64,
    next_serial: u64,
}

impl<C: KmsClient> KmsKeyProvider<C> {
    /// Wraps a KMS client.
    pub fn new(client: C) -> Self {
        Self {
            client,
            keys: BTreeMap::new(),
            handles: BTreeMap::new(),
            evidence: None,
            max_uses: 10_000,
            next_serial: 1,
        }
    }

    /// Attaches the evidence writer.
    pub fn with_evidence(mut self, handle: EvidenceHandle) -> Self {
        self.evidence = Some(handle);
        self
    }

    /// Overrides the per-key usage ceiling.
    pub fn with_max_uses(mut self, max_uses: u64) -> Self {
        self.max_uses = max_uses;
        self
    }

    /// Key metadata, for inspection.
    pub fn metadata(&self, key_id: &KeyId) -> Option<&KeyMetadata> {
        self.keys.get(key_id)
    }

    fn record(&self, event_type: EventType, key_id: &KeyId) {
        if let Some(evidence) = &self.evidence {
            if let Err(e) = evidence.try_append(event_type, "kms-provider", key_id.as_str()) {
                warn!(key_id = %key_id, error = %e, "failed to record key evidence");
            }
        }
    }
}

impl<C: KmsClient> KeyProvider for KmsKeyProvider<C> {
    fn generate(&mut self, security_level: u16, owner: &str) -> Result<KeyId, KeyError> {
        if !matches!(security_level, 128 | 192) {
            return Err(KeyError::UnsupportedLevel(security_level));
        }
        let handle = self.client.create_key(security_level)?;
        let key_id = KeyId::new(format!("kms-{:06}", self.next_serial));
        self.next_serial += 1;

        self.keys.insert(
            key_id.clone(),
            KeyMetadata {
                key_id: key_id.clone(),
                state: KeyState::Registered,
                security_level,
                owner: owner.to_string(),
                created_at_ms: now_ms(),
                activation_time_ms: None,
                expiry_time_ms: None,
                usage_count: 0,
                max_uses: self.max_uses,
            },
        );
        self.handles.insert(key_id.clone(), handle);
        self.record(EventType::KeyGenerated, &key_id);
        info!(key_id = %key_id, security_level, "generated KMS-backed key");
        Ok(key_id)
    }

    fn activate(&mut self, key_id: &KeyId) -> Result<(), KeyError> {
        let meta = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        if meta.state != KeyState::Registered {
            return Err(KeyError::WrongState {
                key_id: key_id.clone(),
                state: meta.state,
                required: "REGISTERED",
            });
        }
        meta.state = KeyState::Active;
        meta.activation_time_ms = Some(now_ms());
        self.record(EventType::KeyActivated, key_id);
        Ok(())
    }

    fn rotate(&mut self, old_id: &KeyId) -> Result<KeyId, KeyError> {
        let (owner, level) = {
            let meta = self
                .keys
                .get(old_id)
                .ok_or_else(|| KeyError::NotFound(old_id.clone()))?;
            if meta.state != KeyState::Active {
                return Err(KeyError::WrongState {
                    key_id: old_id.clone(),
                    state: meta.state,
                    required: "ACTIVE",
                });
            }
            (meta.owner.clone(), meta.security_level)
        };

        let new_id = self.generate(level, &owner)?;
        self.activate(&new_id)?;

        let old_meta = self.keys.get_mut(old_id).expect("checked present above");
        old_meta.state = KeyState::Expired;
        old_meta.expiry_time_ms = Some(now_ms());
        self.record(EventType::KeyRotated, old_id);
        Ok(new_id)
    }

    fn revoke(&mut self, key_id: &KeyId) -> Result<(), KeyError> {
        let meta = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        meta.state = KeyState::Revoked;
        if let Some(handle) = self.handles.get(key_id) {
            let handle = handle.clone();
            self.client.destroy(&handle)?;
        }
        self.record(EventType::KeyRevoked, key_id);
        warn!(key_id = %key_id, "revoked KMS-backed key");
        Ok(())
    }

    fn lookup(&self, key_id: &KeyId) -> Result<(KeyMetadata, KeyMaterial), KeyError> {
        let meta = self
            .keys
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        if !meta.can_decrypt() {
            return Err(KeyError::WrongState {
                key_id: key_id.clone(),
                state: meta.state,
                required: "non-REVOKED",
            });
        }
        let handle = self
            .handles
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        let secret = self.client.unwrap_material(handle)?;
        Ok((meta.clone(), KeyMaterial { secret }))
    }

    fn record_use(&mut self, key_id: &KeyId) -> Result<(), KeyError> {
        let meta = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        if meta.usage_count >= meta.max_uses {
            return Err(KeyError::UsageExceeded {
                key_id: key_id.clone(),
                max_uses: meta.max_uses,
            });
        }
        meta.usage_count += 1;
        Ok(())
    }
}
