//! Seeded CSPRNG with explicit substream derivation
//!
//! A single process seed feeds every random draw in the pipeline. Substreams
//! are derived as `KDF(seed, serialize(tag, parts...))` with HMAC-SHA256 as
//! the KDF, so each `(tag, parts)` combination yields an independent
//! deterministic stream: LWE secret keys, LWE `A` vectors and Skellam noise
//! all come from here. Nothing in the pipeline touches a non-cryptographic
//! generator.
//!
//! Rand-K index selection uses [`public_stream`] instead: the aggregator must
//! be able to re-derive a worker's index sets from the substream tag announced
//! in the package manifest alone, so index streams are keyed by the tag, not
//! by the private process seed. Index selection is data-independent, so
//! nothing secret leaks through it.

use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};

/// Seed and KDF output size in bytes.
pub const SEED_SIZE: usize = 32;

/// Identifies the consumer of a substream.
///
/// The tag byte separates substream domains so equal key parts under
/// different tags never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubstreamTag {
    /// LWE secret key generation.
    LweKey = 0x01,
    /// LWE public vector `A` per ciphertext slot.
    LweMatrix = 0x02,
    /// Skellam noise per ciphertext slot.
    SkellamNoise = 0x03,
    /// Rand-K index selection (public derivation path).
    RandK = 0x04,
}

/// Process-seeded cryptographically secure generator with substream
/// derivation.
#[derive(Clone)]
pub struct Csprng {
    seed: [u8; SEED_SIZE],
}

impl Csprng {
    /// Wraps an explicit 32-byte seed. The caller owns seed management; for
    /// production workers the seed comes from the OS entropy pool once at
    /// startup.
    pub fn from_seed(seed: [u8; SEED_SIZE]) -> Self {
        Self { seed }
    }

    /// Draws a fresh seed from the operating system.
    pub fn from_entropy() -> Self {
        let mut seed = [0u8; SEED_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    /// Derives an independent deterministic substream.
    ///
    /// The KDF input is `tag || (part || len_be16)*`, the same
    /// length-prefixed construction used for key derivation elsewhere, so no
    /// two distinct `(tag, parts)` inputs serialize identically.
    pub fn substream(&self, tag: SubstreamTag, parts: &[&[u8]]) -> CryptoResult<ChaCha20Rng> {
        let mut input = Vec::with_capacity(1 + parts.iter().map(|p| p.len() + 2).sum::<usize>());
        input.push(tag as u8);
        for part in parts {
            if part.len() > u16::MAX as usize {
                return Err(CryptoError::InvalidTag(format!(
                    "tag part too long: {} bytes",
                    part.len()
                )));
            }
            input.extend_from_slice(part);
            input.extend_from_slice(&(part.len() as u16).to_be_bytes());
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.seed)
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts keys of any size"));
        mac.update(&input);
        let derived: [u8; SEED_SIZE] = mac.finalize().into_bytes().into();
        Ok(ChaCha20Rng::from_seed(derived))
    }
}

impl std::fmt::Debug for Csprng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed.
        f.debug_struct("Csprng").finish_non_exhaustive()
    }
}

/// Derives a deterministic stream from a public tag string.
///
/// Used for Rand-K index sampling, where the aggregator re-derives a
/// worker's index set from the `substream_tag` announced in the manifest.
pub fn public_stream(tag: &str) -> ChaCha20Rng {
    let digest: [u8; SEED_SIZE] = Sha256::digest(tag.as_bytes()).into();
    ChaCha20Rng::from_seed(digest)
}

/// Builds the canonical Rand-K tag for `(worker, round, parameter)`.
pub fn rand_k_tag(worker: &str, round: u64, parameter: &str) -> String {
    format!("randk/{worker}/{round}/{parameter}")
}

/// Draws `k` unique ascending indices from `[0, n)` out of the stream keyed
/// by `tag`, by partial Fisher-Yates over the index pool.
///
/// Workers use this to sparsify; the aggregator re-runs it from the
/// manifest's substream tag to learn which dense element each ciphertext
/// slot covers.
pub fn draw_indices(tag: &str, n: usize, k: usize) -> Vec<u32> {
    use rand::Rng;

    let mut rng = public_stream(tag);
    let mut pool: Vec<u32> = (0..n as u32).collect();
    for i in 0..k.min(n) {
        let j = rng.gen_range(i..n);
        pool.swap(i, j);
    }
    let mut selected = pool[..k.min(n)].to_vec();
    selected.sort_unstable();
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_substream_deterministic() {
        let csprng = Csprng::from_seed([7u8; 32]);
        let mut a = csprng.substream(SubstreamTag::LweKey, &[b"k1"]).unwrap();
        let mut b = csprng.substream(SubstreamTag::LweKey, &[b"k1"]).unwrap();
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_substreams_independent_by_tag() {
        let csprng = Csprng::from_seed([7u8; 32]);
        let mut a = csprng.substream(SubstreamTag::LweKey, &[b"k1"]).unwrap();
        let mut b = csprng.substream(SubstreamTag::LweMatrix, &[b"k1"]).unwrap();
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_substreams_independent_by_parts() {
        let csprng = Csprng::from_seed([7u8; 32]);
        let mut a = csprng
            .substream(SubstreamTag::SkellamNoise, &[b"w1", b"r1"])
            .unwrap();
        let mut b = csprng
            .substream(SubstreamTag::SkellamNoise, &[b"w1", b"r2"])
            .unwrap();
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_length_prefix_prevents_ambiguity() {
        // ("ab", "c") and ("a", "bc") must not serialize identically.
        let csprng = Csprng::from_seed([7u8; 32]);
        let mut a = csprng
            .substream(SubstreamTag::RandK, &[b"ab", b"c"])
            .unwrap();
        let mut b = csprng
            .substream(SubstreamTag::RandK, &[b"a", b"bc"])
            .unwrap();
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = Csprng::from_seed([1u8; 32])
            .substream(SubstreamTag::LweKey, &[])
            .unwrap();
        let mut b = Csprng::from_seed([2u8; 32])
            .substream(SubstreamTag::LweKey, &[])
            .unwrap();
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_public_stream_reproducible() {
        let tag = rand_k_tag("worker-1", 12, "layer.0.weight");
        let mut a = public_stream(&tag);
        let mut b = public_stream(&tag);
        let x: u64 = a.gen();
        let y: u64 = b.gen();
        assert_eq!(x, y);
    }

    #[test]
    fn test_rand_k_tag_format() {
        assert_eq!(
            rand_k_tag("w-3", 5, "encoder.bias"),
            "randk/w-3/5/encoder.bias"
        );
    }
}
