//! Local file-backed key store
//!
//! One encrypted blob per key id (`<key_id>.enc`, AES-256-GCM under the
//! deployment master secret, 12-byte nonce prefix) with a plaintext
//! metadata sidecar (`<key_id>.meta.json`). Without a master secret the
//! store refuses to persist material unless explicitly allowed for
//! development, in which case it stores plaintext and logs a warning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sfup_common::KeyId;
use sfup_crypto::{Csprng, N2heParams, SecretKey, SecurityLevel};
use sfup_evidence::{EventType, EvidenceHandle};
use tracing::{info, warn};

use crate::provider::{now_ms, KeyError, KeyMaterial, KeyMetadata, KeyProvider, KeyState};

/// AES-GCM nonce length.
const NONCE_LEN: usize = 12;

/// Default encryption-use ceiling before rotation is forced.
const DEFAULT_MAX_USES: u64 = 10_000;

/// File-backed key store with encryption at rest.
pub struct FileKeyStore {
    dir: PathBuf,
    master_secret: Option<[u8; 32]>,
    allow_plaintext: bool,
    csprng: Csprng,
    keys: BTreeMap<KeyId, KeyMetadata>,
    evidence: Option<EvidenceHandle>,
    max_uses: u64,
}

impl FileKeyStore {
    /// Opens (or creates) a store rooted at `dir`.
    ///
    /// With `master_secret = None` the store only works when
    /// [`allow_plaintext`](Self::with_plaintext_fallback) is enabled; that
    /// path is for development and logs a warning on every write.
    pub fn open(
        dir: impl AsRef<Path>,
        master_secret: Option<[u8; 32]>,
        csprng: Csprng,
    ) -> Result<Self, KeyError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut keys = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(_key_id) = name.strip_suffix(".meta.json") {
                let raw = std::fs::read_to_string(&path)?;
                let meta: KeyMetadata = serde_json::from_str(&raw)?;
                keys.insert(meta.key_id.clone(), meta);
            }
        }

        info!(dir = %dir.display(), keys = keys.len(), "file key store opened");

        Ok(Self {
            dir,
            master_secret,
            allow_plaintext: false,
            csprng,
            keys,
            evidence: None,
            max_uses: DEFAULT_MAX_USES,
        })
    }

    /// Attaches the evidence writer; every state transition is recorded.
    pub fn with_evidence(mut self, handle: EvidenceHandle) -> Self {
        self.evidence = Some(handle);
        self
    }

    /// Overrides the per-key usage ceiling.
    pub fn with_max_uses(mut self, max_uses: u64) -> Self {
        self.max_uses = max_uses;
        self
    }

    /// Permits unencrypted material on disk. Development only.
    pub fn with_plaintext_fallback(mut self) -> Self {
        self.allow_plaintext = true;
        self
    }

    /// Known key metadata, for inspection.
    pub fn metadata(&self, key_id: &KeyId) -> Option<&KeyMetadata> {
        self.keys.get(key_id)
    }

    /// All key ids in the store.
    pub fn key_ids(&self) -> impl Iterator<Item = &KeyId> {
        self.keys.keys()
    }

    fn record(&self, event_type: EventType, key_id: &KeyId) {
        if let Some(evidence) = &self.evidence {
            if let Err(e) = evidence.try_append(event_type, "key-provider", key_id.as_str()) {
                warn!(key_id = %key_id, error = %e, "failed to record key evidence");
            }
        }
    }

    fn blob_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.enc", key_id.as_str()))
    }

    fn meta_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.meta.json", key_id.as_str()))
    }

    fn persist_meta(&self, meta: &KeyMetadata) -> Result<(), KeyError> {
        let json = serde_json::to_string_pretty(meta)?;
        std::fs::write(self.meta_path(&meta.key_id), json)?;
        Ok(())
    }

    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        match &self.master_secret {
            Some(secret) => {
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret));
                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ciphertext = cipher
                    .encrypt(nonce, plaintext)
                    .map_err(|e| KeyError::Protection(e.to_string()))?;
                let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                blob.extend_from_slice(&nonce_bytes);
                blob.extend_from_slice(&ciphertext);
                Ok(blob)
            }
            None if self.allow_plaintext => {
                warn!("storing key material unencrypted; development only");
                Ok(plaintext.to_vec())
            }
            None => Err(KeyError::MasterSecretRequired),
        }
    }

    fn unprotect(&self, blob: &[u8]) -> Result<Vec<u8>, KeyError> {
        match &self.master_secret {
            Some(secret) => {
                if blob.len() < NONCE_LEN {
                    return Err(KeyError::Protection("blob shorter than nonce".to_string()));
                }
                let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret));
                cipher
                    .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                    .map_err(|e| KeyError::Protection(e.to_string()))
            }
            None if self.allow_plaintext => Ok(blob.to_vec()),
            None => Err(KeyError::MasterSecretRequired),
        }
    }

    fn fresh_key_id(&self) -> KeyId {
        let mut raw = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        KeyId::new(format!("key-{}", hex::encode(raw)))
    }
}

impl KeyProvider for FileKeyStore {
    fn generate(&mut self, security_level: u16, owner: &str) -> Result<KeyId, KeyError> {
        let level = SecurityLevel::try_from(security_level)
            .map_err(|_| KeyError::UnsupportedLevel(security_level))?;
        // μ is irrelevant to key generation; the parameter set only fixes
        // the LWE dimension here.
        let params = N2heParams::new(level, 3.19)
            .map_err(|e| KeyError::Protection(e.to_string()))?;

        let key_id = self.fresh_key_id();
        let secret = SecretKey::generate(&params, &self.csprng, key_id.as_str())
            .map_err(|e| KeyError::Protection(e.to_string()))?;

        let blob = self.protect(&secret.to_bytes())?;
        std::fs::write(self.blob_path(&key_id), blob)?;

        let meta = KeyMetadata {
            key_id: key_id.clone(),
            state: KeyState::Registered,
            security_level,
            owner: owner.to_string(),
            created_at_ms: now_ms(),
            activation_time_ms: None,
            expiry_time_ms: None,
            usage_count: 0,
            max_uses: self.max_uses,
        };
        self.persist_meta(&meta)?;
        self.keys.insert(key_id.clone(), meta);

        self.record(EventType::KeyGenerated, &key_id);
        info!(key_id = %key_id, security_level, "generated key");
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
        let meta = meta.clone();
        self.persist_meta(&meta)?;
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

        let old_meta = self
            .keys
            .get_mut(old_id)
            .expect("checked present above");
        old_meta.state = KeyState::Expired;
        old_meta.expiry_time_ms = Some(now_ms());
        let old_meta = old_meta.clone();
        self.persist_meta(&old_meta)?;

        self.record(EventType::KeyRotated, old_id);
        info!(old = %old_id, new = %new_id, "rotated key");
        Ok(new_id)
    }

    fn revoke(&mut self, key_id: &KeyId) -> Result<(), KeyError> {
        let meta = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.clone()))?;
        meta.state = KeyState::Revoked;
        let meta = meta.clone();
        self.persist_meta(&meta)?;
        self.record(EventType::KeyRevoked, key_id);
        warn!(key_id = %key_id, "revoked key");
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
        let blob = std::fs::read(self.blob_path(key_id))?;
        let secret = self.unprotect(&blob)?;
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
        let meta = meta.clone();
        self.persist_meta(&meta)?;
        Ok(())
    }
}
