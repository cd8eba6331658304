//! Hybrid classical + post-quantum detached signatures
//!
//! Package signatures combine Ed25519 with ML-DSA-65 (FIPS 204): the wire
//! signature is the 64-byte Ed25519 signature followed by the ML-DSA
//! signature, and verification requires both halves to pass. The scheme
//! stays sound as long as at least one of the underlying primitives remains
//! unbroken.

use ed25519_dalek::{Signer as _, Verifier as _};
use ml_dsa::signature::{Signer as _, Verifier as _};
use ml_dsa::{EncodedSignature, EncodedVerifyingKey, Keypair, MlDsa65};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};

/// Ed25519 signature length in bytes; the split point of the hybrid blob.
const ED25519_SIG_LEN: usize = 64;

/// Seed length for both key halves.
const SEED_LEN: usize = 32;

/// Published verification identity of a worker or fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridPublicKey {
    /// Ed25519 verifying key bytes.
    pub ed25519: [u8; 32],
    /// Encoded ML-DSA-65 verifying key bytes.
    pub ml_dsa: Vec<u8>,
}

/// Detached hybrid signature: classical half followed by the PQC half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridSignature(pub Vec<u8>);

impl HybridSignature {
    /// The opaque wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Signing identity holding the seeds of both halves.
///
/// Only seeds are retained; the expanded signing keys are rebuilt per
/// operation.
pub struct HybridKeyPair {
    ed25519_seed: [u8; SEED_LEN],
    ml_dsa_seed: [u8; SEED_LEN],
    public: HybridPublicKey,
}

impl HybridKeyPair {
    /// Generates a fresh key pair from OS entropy.
    pub fn generate() -> Self {
        let mut ed25519_seed = [0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut ed25519_seed);
        let mut ml_dsa_seed = [0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut ml_dsa_seed);
        Self::from_seeds(ed25519_seed, ml_dsa_seed)
    }

    /// Rebuilds a key pair from stored seeds.
    pub fn from_seeds(ed25519_seed: [u8; SEED_LEN], ml_dsa_seed: [u8; SEED_LEN]) -> Self {
        let ed_sk = ed25519_dalek::SigningKey::from_bytes(&ed25519_seed);
        let ml_sk = ml_dsa::SigningKey::<MlDsa65>::from_seed((&ml_dsa_seed).into());
        let public = HybridPublicKey {
            ed25519: ed_sk.verifying_key().to_bytes(),
            ml_dsa: ml_sk.verifying_key().encode().to_vec(),
        };
        Self {
            ed25519_seed,
            ml_dsa_seed,
            public,
        }
    }

    /// The published verification identity.
    pub fn public_key(&self) -> &HybridPublicKey {
        &self.public
    }

    /// Seeds for persistence in the key store.
    pub fn seeds(&self) -> ([u8; SEED_LEN], [u8; SEED_LEN]) {
        (self.ed25519_seed, self.ml_dsa_seed)
    }

    /// Signs a message (the package content hash) with both halves.
    pub fn sign(&self, message: &[u8]) -> HybridSignature {
        let ed_sk = ed25519_dalek::SigningKey::from_bytes(&self.ed25519_seed);
        let ed_sig = ed_sk.sign(message);

        let ml_sk = ml_dsa::SigningKey::<MlDsa65>::from_seed((&self.ml_dsa_seed).into());
        let ml_sig = ml_sk.sign(message).encode().to_vec();

        let mut bytes = Vec::with_capacity(ED25519_SIG_LEN + ml_sig.len());
        bytes.extend_from_slice(&ed_sig.to_bytes());
        bytes.extend_from_slice(&ml_sig);
        HybridSignature(bytes)
    }
}

impl std::fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print seeds.
        f.debug_struct("HybridKeyPair")
            .field("public", &"<hybrid public key>")
            .finish_non_exhaustive()
    }
}

impl HybridPublicKey {
    /// Verifies a hybrid signature; both halves must pass.
    pub fn verify(&self, message: &[u8], signature: &HybridSignature) -> CryptoResult<()> {
        let bytes = signature.as_bytes();
        if bytes.len() <= ED25519_SIG_LEN {
            return Err(CryptoError::Signature(format!(
                "hybrid signature too short: {} bytes",
                bytes.len()
            )));
        }
        let (ed_bytes, ml_bytes) = bytes.split_at(ED25519_SIG_LEN);

        let ed_vk = ed25519_dalek::VerifyingKey::from_bytes(&self.ed25519)
            .map_err(|e| CryptoError::Signature(format!("invalid Ed25519 key: {e}")))?;
        let ed_sig = ed25519_dalek::Signature::from_slice(ed_bytes)
            .map_err(|e| CryptoError::Signature(format!("invalid Ed25519 signature: {e}")))?;
        ed_vk
            .verify(message, &ed_sig)
            .map_err(|_| CryptoError::Signature("Ed25519 verification failed".to_string()))?;

        let vk_encoded: &EncodedVerifyingKey<MlDsa65> =
            self.ml_dsa.as_slice().try_into().map_err(|_| {
                CryptoError::Signature(format!(
                    "invalid ML-DSA-65 verifying key length: {}",
                    self.ml_dsa.len()
                ))
            })?;
        let ml_vk = ml_dsa::VerifyingKey::<MlDsa65>::decode(vk_encoded);
        let sig_encoded: &EncodedSignature<MlDsa65> = ml_bytes.try_into().map_err(|_| {
            CryptoError::Signature(format!(
                "invalid ML-DSA-65 signature length: {}",
                ml_bytes.len()
            ))
        })?;
        let ml_sig = ml_dsa::Signature::<MlDsa65>::decode(sig_encoded).ok_or_else(|| {
            CryptoError::Signature("failed to decode ML-DSA-65 signature".to_string())
        })?;
        ml_vk
            .verify(message, &ml_sig)
            .map_err(|_| CryptoError::Signature("ML-DSA-65 verification failed".to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]);
        let message = b"content hash stand-in";
        let signature = keypair.sign(message);
        keypair.public_key().verify(message, &signature).unwrap();
    }

    #[test]
    fn test_tampered_message_fails() {
        let keypair = HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]);
        let signature = keypair.sign(b"original");
        assert!(keypair
            .public_key()
            .verify(b"tampered", &signature)
            .is_err());
    }

    #[test]
    fn test_tampered_classical_half_fails() {
        let keypair = HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]);
        let message = b"msg";
        let mut signature = keypair.sign(message);
        signature.0[0] ^= 0x01;
        assert!(keypair.public_key().verify(message, &signature).is_err());
    }

    #[test]
    fn test_tampered_pqc_half_fails() {
        let keypair = HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]);
        let message = b"msg";
        let mut signature = keypair.sign(message);
        let last = signature.0.len() - 1;
        signature.0[last] ^= 0x01;
        assert!(keypair.public_key().verify(message, &signature).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]);
        let other = HybridKeyPair::from_seeds([3u8; 32], [4u8; 32]);
        let message = b"msg";
        let signature = keypair.sign(message);
        assert!(other.public_key().verify(message, &signature).is_err());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let keypair = HybridKeyPair::from_seeds([1u8; 32], [2u8; 32]);
        let signature = keypair.sign(b"msg");
        let truncated = HybridSignature(signature.0[..40].to_vec());
        assert!(matches!(
            keypair.public_key().verify(b"msg", &truncated),
            Err(CryptoError::Signature(_))
        ));
    }

    #[test]
    fn test_seed_persistence_round_trip() {
        let keypair = HybridKeyPair::from_seeds([7u8; 32], [8u8; 32]);
        let (ed, ml) = keypair.seeds();
        let restored = HybridKeyPair::from_seeds(ed, ml);
        assert_eq!(restored.public_key(), keypair.public_key());
    }
}
