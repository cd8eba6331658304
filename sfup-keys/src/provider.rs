//! Key provider capability trait and lifecycle model

use serde::{Deserialize, Serialize};
use sfup_common::{ErrorKind, KeyId};
use thiserror::Error;

/// Key provider errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No key with this id.
    #[error("key not found: {0}")]
    NotFound(KeyId),

    /// The key is in the wrong state for the operation.
    #[error("key {key_id} is {state:?}; operation requires {required}")]
    WrongState {
        /// Key id.
        key_id: KeyId,
        /// Current state.
        state: KeyState,
        /// Required state description.
        required: &'static str,
    },

    /// The key reached its usage ceiling and must rotate.
    #[error("key {key_id} exceeded {max_uses} uses; rotate before encrypting again")]
    UsageExceeded {
        /// Key id.
        key_id: KeyId,
        /// Configured ceiling.
        max_uses: u64,
    },

    /// Disk I/O failed.
    #[error("key storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    /// Metadata sidecar failed to parse.
    #[error("malformed key metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Encryption or decryption of stored material failed.
    #[error("key material protection error: {0}")]
    Protection(String),

    /// The store requires a master secret it does not have.
    #[error("master secret required: set SFUP_MASTER_SECRET to 64 hex chars in production")]
    MasterSecretRequired,

    /// The security level is not supported.
    #[error("unsupported security level {0}; expected 128 or 192")]
    UnsupportedLevel(u16),

    /// The external KMS rejected or failed an operation.
    #[error("KMS back-end error: {0}")]
    Kms(String),
}

impl KeyError {
    /// Maps onto the workspace-wide error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyError::Storage(_) | KeyError::Kms(_) => ErrorKind::Resource,
            KeyError::MasterSecretRequired | KeyError::UnsupportedLevel(_) => ErrorKind::Config,
            KeyError::Protection(_) => ErrorKind::Crypto,
            _ => ErrorKind::Validation,
        }
    }
}

/// Lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyState {
    /// Created but not yet enabled for encryption.
    Registered,
    /// Enabled for encryption and decryption.
    Active,
    /// Aged out (rotation or expiry time); decrypt-only.
    Expired,
    /// Forcibly disabled; decrypt refused too.
    Revoked,
}

/// Metadata persisted in the plaintext sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Stable identifier.
    pub key_id: KeyId,
    /// Lifecycle state.
    pub state: KeyState,
    /// LWE security level in bits, 128 or 192.
    pub security_level: u16,
    /// Owning principal.
    pub owner: String,
    /// Creation time, ms since the Unix epoch.
    pub created_at_ms: u64,
    /// Activation time, set by `activate`.
    pub activation_time_ms: Option<u64>,
    /// Expiry time; a key past this is treated as EXPIRED.
    pub expiry_time_ms: Option<u64>,
    /// Encryption operations performed under this key.
    pub usage_count: u64,
    /// Ceiling after which rotation is forced.
    pub max_uses: u64,
}

impl KeyMetadata {
    /// Whether this key may encrypt at `now_ms`.
    pub fn can_encrypt(&self, now_ms: u64) -> bool {
        self.state == KeyState::Active
            && self.usage_count < self.max_uses
            && self.expiry_time_ms.map_or(true, |t| now_ms < t)
    }

    /// Whether this key may decrypt historical packages.
    ///
    /// Revocation is the only state that forbids decryption.
    pub fn can_decrypt(&self) -> bool {
        self.state != KeyState::Revoked
    }
}

/// Secret key material unwrapped for one operation.
pub struct KeyMaterial {
    /// Serialized LWE secret coefficients.
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print material.
        f.debug_struct("KeyMaterial")
            .field("len", &self.secret.len())
            .finish_non_exhaustive()
    }
}

/// Pluggable key storage and lifecycle capability.
pub trait KeyProvider {
    /// Creates a key at the given security level in the REGISTERED state.
    fn generate(&mut self, security_level: u16, owner: &str) -> Result<KeyId, KeyError>;

    /// REGISTERED → ACTIVE.
    fn activate(&mut self, key_id: &KeyId) -> Result<(), KeyError>;

    /// Expires `old_id` and returns a fresh ACTIVE key with the same owner
    /// and level.
    fn rotate(&mut self, old_id: &KeyId) -> Result<KeyId, KeyError>;

    /// Any state → REVOKED. Revoked keys refuse decryption too.
    fn revoke(&mut self, key_id: &KeyId) -> Result<(), KeyError>;

    /// Returns metadata and unwrapped secret material.
    fn lookup(&self, key_id: &KeyId) -> Result<(KeyMetadata, KeyMaterial), KeyError>;

    /// Records one encryption use; fails once the ceiling is reached.
    fn record_use(&mut self, key_id: &KeyId) -> Result<(), KeyError>;
}

/// Current wall-clock in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(state: KeyState) -> KeyMetadata {
        KeyMetadata {
            key_id: KeyId::new("k1"),
            state,
            security_level: 128,
            owner: "fleet-a".to_string(),
            created_at_ms: 1000,
            activation_time_ms: Some(2000),
            expiry_time_ms: None,
            usage_count: 0,
            max_uses: 1_000,
        }
    }

    #[test]
    fn test_only_active_encrypts() {
        assert!(meta(KeyState::Active).can_encrypt(5000));
        assert!(!meta(KeyState::Registered).can_encrypt(5000));
        assert!(!meta(KeyState::Expired).can_encrypt(5000));
        assert!(!meta(KeyState::Revoked).can_encrypt(5000));
    }

    #[test]
    fn test_expiry_time_blocks_encrypt() {
        let mut m = meta(KeyState::Active);
        m.expiry_time_ms = Some(4000);
        assert!(m.can_encrypt(3999));
        assert!(!m.can_encrypt(4000));
    }

    #[test]
    fn test_usage_ceiling_blocks_encrypt() {
        let mut m = meta(KeyState::Active);
        m.usage_count = m.max_uses;
        assert!(!m.can_encrypt(5000));
    }

    #[test]
    fn test_revoked_cannot_decrypt() {
        assert!(meta(KeyState::Registered).can_decrypt());
        assert!(meta(KeyState::Expired).can_decrypt());
        assert!(!meta(KeyState::Revoked).can_decrypt());
    }
}
