//! Byte-exact wire format of the update package
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! offset  size  field
//! 0       6     magic = "TGUE\x02\x00"
//! 6       1     format_version (u8, currently 2)
//! 7       4     header_len (u32)
//! 11      H     header JSON
//! 11+H    4     manifest_len (u32)
//! ...     M     manifest JSON
//! ...     8     payload_len (u64)
//! ...     P     ciphertexts: (A: [u32; n_lwe], b: u32) each
//! ...     32    content_hash = SHA-256(bytes[0 .. payload_end])
//! ...     2     sig_len (u16)
//! ...     S     hybrid signature over content_hash
//! ```

use sfup_common::ErrorKind;
use sfup_crypto::{Ciphertext, CryptoError, HybridKeyPair, HybridPublicKey, HybridSignature};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::manifest::{Manifest, PackageHeader};

/// Envelope magic bytes.
pub const MAGIC: [u8; 6] = *b"TGUE\x02\x00";

/// Current envelope format version.
pub const FORMAT_VERSION: u8 = 2;

/// Content hash length in bytes.
const HASH_LEN: usize = 32;

/// Package framing and verification errors.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The envelope does not start with the magic bytes.
    #[error("bad magic: {0}")]
    BadMagic(String),

    /// The format version is not supported.
    #[error("unsupported format version {0}, expected {FORMAT_VERSION}")]
    UnsupportedVersion(u8),

    /// The buffer ends before a declared field.
    #[error("truncated package: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        /// Bytes the field requires.
        needed: usize,
        /// Offset the read started at.
        offset: usize,
        /// Bytes remaining.
        available: usize,
    },

    /// The header JSON failed to parse.
    #[error("malformed header JSON: {0}")]
    HeaderJson(#[source] serde_json::Error),

    /// The manifest JSON failed to parse.
    #[error("malformed manifest JSON: {0}")]
    ManifestJson(#[source] serde_json::Error),

    /// The payload length is not a whole number of ciphertexts.
    #[error("payload length {len} is not a multiple of ciphertext size {ciphertext_size}")]
    PayloadSize {
        /// Declared payload length.
        len: u64,
        /// Expected bytes per ciphertext, `4·(n_lwe + 1)`.
        ciphertext_size: usize,
    },

    /// The stored content hash does not match the recomputed hash.
    #[error("content hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch {
        /// Hash carried in the package (hex).
        stored: String,
        /// Hash recomputed over the received bytes (hex).
        computed: String,
    },

    /// Signature verification failed.
    #[error("package signature invalid: {0}")]
    Signature(#[from] CryptoError),

    /// Serialized size exceeds the operating envelope.
    #[error("package of {got} bytes exceeds envelope limit of {limit} bytes")]
    TooLarge {
        /// Serialized size.
        got: usize,
        /// Envelope limit.
        limit: usize,
    },
}

impl PackageError {
    /// Maps onto the workspace-wide error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackageError::HashMismatch { .. } | PackageError::Signature(_) => ErrorKind::Crypto,
            _ => ErrorKind::Validation,
        }
    }
}

/// A parsed (or freshly sealed) update package.
#[derive(Debug, Clone)]
pub struct UpdatePackage {
    /// Header JSON contents.
    pub header: PackageHeader,
    /// Manifest JSON contents.
    pub manifest: Manifest,
    /// Ciphertext payload, one entry per plaintext slot.
    pub payload: Vec<Ciphertext>,
    /// SHA-256 over everything preceding the hash field.
    pub content_hash: [u8; HASH_LEN],
    /// Hybrid signature over the content hash.
    pub signature: HybridSignature,
}

impl UpdatePackage {
    /// Seals a package: frames the fields, hashes, signs.
    pub fn seal(
        header: PackageHeader,
        manifest: Manifest,
        payload: Vec<Ciphertext>,
        keypair: &HybridKeyPair,
    ) -> Result<Self, PackageError> {
        let prefix = encode_prefix(&header, &manifest, &payload)?;
        let content_hash: [u8; HASH_LEN] = Sha256::digest(&prefix).into();
        let signature = keypair.sign(&content_hash);
        Ok(Self {
            header,
            manifest,
            payload,
            content_hash,
            signature,
        })
    }

    /// Serializes the package. Sealing a parsed package with an unchanged
    /// manifest reproduces the received bytes exactly.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PackageError> {
        let mut bytes = encode_prefix(&self.header, &self.manifest, &self.payload)?;
        bytes.extend_from_slice(&self.content_hash);
        let sig = self.signature.as_bytes();
        bytes.extend_from_slice(&(sig.len() as u16).to_be_bytes());
        bytes.extend_from_slice(sig);
        Ok(bytes)
    }

    /// Parses an envelope: magic and version, then header and manifest JSON,
    /// then the content hash over everything preceding it.
    ///
    /// Signature, key-activation and size checks follow at the receiver,
    /// which holds the published identity and the operating envelope.
    pub fn parse(bytes: &[u8], n_lwe: usize) -> Result<Self, PackageError> {
        let mut offset = 0usize;

        let magic = take(bytes, &mut offset, MAGIC.len())?;
        if magic != MAGIC {
            return Err(PackageError::BadMagic(hex::encode(magic)));
        }
        let version = take(bytes, &mut offset, 1)?[0];
        if version != FORMAT_VERSION {
            return Err(PackageError::UnsupportedVersion(version));
        }

        let header_len = read_u32(bytes, &mut offset)? as usize;
        let header_bytes = take(bytes, &mut offset, header_len)?;
        let header: PackageHeader =
            serde_json::from_slice(header_bytes).map_err(PackageError::HeaderJson)?;

        let manifest_len = read_u32(bytes, &mut offset)? as usize;
        let manifest_bytes = take(bytes, &mut offset, manifest_len)?;
        let manifest: Manifest =
            serde_json::from_slice(manifest_bytes).map_err(PackageError::ManifestJson)?;

        let payload_len = read_u64(bytes, &mut offset)?;
        let ciphertext_size = 4 * (n_lwe + 1);
        if payload_len % ciphertext_size as u64 != 0 {
            return Err(PackageError::PayloadSize {
                len: payload_len,
                ciphertext_size,
            });
        }
        let payload_bytes = take(bytes, &mut offset, payload_len as usize)?;
        let payload = decode_payload(payload_bytes, n_lwe);
        let payload_end = offset;

        let stored_hash: [u8; HASH_LEN] = take(bytes, &mut offset, HASH_LEN)?
            .try_into()
            .expect("take returned exactly HASH_LEN bytes");
        let computed: [u8; HASH_LEN] = Sha256::digest(&bytes[..payload_end]).into();
        if stored_hash != computed {
            return Err(PackageError::HashMismatch {
                stored: hex::encode(stored_hash),
                computed: hex::encode(computed),
            });
        }

        let sig_len = read_u16(bytes, &mut offset)? as usize;
        let signature = HybridSignature(take(bytes, &mut offset, sig_len)?.to_vec());

        Ok(Self {
            header,
            manifest,
            payload,
            content_hash: stored_hash,
            signature,
        })
    }

    /// Verifies the hybrid signature against a published identity.
    pub fn verify_signature(&self, identity: &HybridPublicKey) -> Result<(), PackageError> {
        identity.verify(&self.content_hash, &self.signature)?;
        Ok(())
    }
}

fn encode_prefix(
    header: &PackageHeader,
    manifest: &Manifest,
    payload: &[Ciphertext],
) -> Result<Vec<u8>, PackageError> {
    let header_json = serde_json::to_vec(header).map_err(PackageError::HeaderJson)?;
    let manifest_json = serde_json::to_vec(manifest).map_err(PackageError::ManifestJson)?;

    let n_lwe = payload.first().map(|ct| ct.a.len()).unwrap_or(0);
    let payload_len = payload.len() * 4 * (n_lwe + 1);

    let mut bytes = Vec::with_capacity(
        MAGIC.len() + 1 + 4 + header_json.len() + 4 + manifest_json.len() + 8 + payload_len,
    );
    bytes.extend_from_slice(&MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&header_json);
    bytes.extend_from_slice(&(manifest_json.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&manifest_json);
    bytes.extend_from_slice(&(payload_len as u64).to_be_bytes());
    for ct in payload {
        for &word in &ct.a {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(&ct.b.to_be_bytes());
    }
    Ok(bytes)
}

fn decode_payload(bytes: &[u8], n_lwe: usize) -> Vec<Ciphertext> {
    let ciphertext_size = 4 * (n_lwe + 1);
    bytes
        .chunks_exact(ciphertext_size)
        .map(|chunk| {
            let mut a = Vec::with_capacity(n_lwe);
            for word in chunk[..n_lwe * 4].chunks_exact(4) {
                a.push(u32::from_be_bytes(word.try_into().expect("4-byte chunk")));
            }
            let b = u32::from_be_bytes(
                chunk[n_lwe * 4..].try_into().expect("4-byte b field"),
            );
            Ciphertext {
                a,
                b,
                accumulated: 1,
            }
        })
        .collect()
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], PackageError> {
    let end = offset.checked_add(len).ok_or(PackageError::Truncated {
        needed: len,
        offset: *offset,
        available: bytes.len().saturating_sub(*offset),
    })?;
    if end > bytes.len() {
        return Err(PackageError::Truncated {
            needed: len,
            offset: *offset,
            available: bytes.len() - *offset,
        });
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_u16(bytes: &[u8], offset: &mut usize) -> Result<u16, PackageError> {
    let raw = take(bytes, offset, 2)?;
    Ok(u16::from_be_bytes(raw.try_into().expect("2 bytes")))
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, PackageError> {
    let raw = take(bytes, offset, 4)?;
    Ok(u32::from_be_bytes(raw.try_into().expect("4 bytes")))
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64, PackageError> {
    let raw = take(bytes, offset, 8)?;
    Ok(u64::from_be_bytes(raw.try_into().expect("8 bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{CompressionMeta, SafetyStats, TrainingMeta, SIG_ALG_HYBRID};
    use std::collections::BTreeMap;

    const TEST_N_LWE: usize = 16;

    fn sample_header() -> PackageHeader {
        PackageHeader {
            key_id: "key-1".to_string(),
            round: 3,
            sig_alg: SIG_ALG_HYBRID.to_string(),
            timestamp_ms: 1_700_000_000_000,
            worker_id: "worker-1".to_string(),
        }
    }

    fn sample_manifest() -> Manifest {
        let mut compression_meta = BTreeMap::new();
        compression_meta.insert(
            "p".to_string(),
            CompressionMeta {
                bits: 8,
                n_slots: 2,
                scale: 0.5,
                substream_tag: "randk/worker-1/3/p".to_string(),
                zero_point: 0,
            },
        );
        Manifest {
            compression_meta,
            expert_weights: BTreeMap::new(),
            safety_stats: SafetyStats {
                clip_norm_applied: 1.0,
                dp_epsilon_consumed: 0.1,
                gradient_l2_pre_clip: 1.5,
                payload_bytes_precompression: 8,
                sparsity_ratio: 1.0,
            },
            training_meta: TrainingMeta {
                learning_rate: 1e-4,
                objective: "imitation".to_string(),
                optimizer: "adamw".to_string(),
                steps: 1,
            },
        }
    }

    fn sample_payload() -> Vec<Ciphertext> {
        vec![
            Ciphertext {
                a: (0..TEST_N_LWE as u32).collect(),
                b: 42,
                accumulated: 1,
            },
            Ciphertext {
                a: (100..100 + TEST_N_LWE as u32).collect(),
                b: u32::MAX,
                accumulated: 1,
            },
        ]
    }

    fn keypair() -> HybridKeyPair {
        HybridKeyPair::from_seeds([1u8; 32], [2u8; 32])
    }

    #[test]
    fn test_seal_parse_round_trip() {
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &keypair())
                .unwrap();
        let bytes = package.to_bytes().unwrap();
        let parsed = UpdatePackage::parse(&bytes, TEST_N_LWE).unwrap();
        assert_eq!(parsed.header, package.header);
        assert_eq!(parsed.manifest, package.manifest);
        assert_eq!(parsed.payload, package.payload);
        assert_eq!(parsed.content_hash, package.content_hash);
    }

    #[test]
    fn test_parse_then_seal_is_byte_identical() {
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &keypair())
                .unwrap();
        let bytes = package.to_bytes().unwrap();
        let parsed = UpdatePackage::parse(&bytes, TEST_N_LWE).unwrap();
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_signature_verifies() {
        let kp = keypair();
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &kp)
                .unwrap();
        package.verify_signature(kp.public_key()).unwrap();

        let other = HybridKeyPair::from_seeds([9u8; 32], [10u8; 32]);
        assert!(package.verify_signature(other.public_key()).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &keypair())
                .unwrap();
        let mut bytes = package.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            UpdatePackage::parse(&bytes, TEST_N_LWE),
            Err(PackageError::BadMagic(_))
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &keypair())
                .unwrap();
        let mut bytes = package.to_bytes().unwrap();
        bytes[6] = 9;
        assert!(matches!(
            UpdatePackage::parse(&bytes, TEST_N_LWE),
            Err(PackageError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_payload_flip_breaks_hash() {
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &keypair())
                .unwrap();
        let mut bytes = package.to_bytes().unwrap();
        // Flip a byte inside the ciphertext payload region.
        let idx = bytes.len() - HASH_LEN - 2 - package.signature.as_bytes().len() - 4;
        bytes[idx] ^= 0xFF;
        assert!(matches!(
            UpdatePackage::parse(&bytes, TEST_N_LWE),
            Err(PackageError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let package =
            UpdatePackage::seal(sample_header(), sample_manifest(), sample_payload(), &keypair())
                .unwrap();
        let bytes = package.to_bytes().unwrap();
        assert!(matches!(
            UpdatePackage::parse(&bytes[..20], TEST_N_LWE),
            Err(PackageError::Truncated { .. })
        ));
    }

    #[test]
    fn test_empty_payload_package() {
        let mut manifest = sample_manifest();
        manifest.compression_meta.clear();
        let package =
            UpdatePackage::seal(sample_header(), manifest, Vec::new(), &keypair()).unwrap();
        let bytes = package.to_bytes().unwrap();
        let parsed = UpdatePackage::parse(&bytes, TEST_N_LWE).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PackageError::BadMagic("00".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            PackageError::HashMismatch {
                stored: String::new(),
                computed: String::new()
            }
            .kind(),
            ErrorKind::Crypto
        );
    }
}
