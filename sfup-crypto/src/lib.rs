//! Cryptographic core for the Secure Federated Update Pipeline
//!
//! Implements the primitives every other SFUP crate builds on:
//! - Seeded CSPRNG with explicit substream derivation
//! - Skellam noise sampling (difference of two Poisson variates)
//! - N2HE: an LWE-based additively homomorphic symmetric cipher
//! - Hybrid classical + post-quantum detached signatures

pub mod csprng;
pub mod error;
pub mod n2he;
pub mod sign;
pub mod skellam;

pub use csprng::{draw_indices, public_stream, rand_k_tag, Csprng, SubstreamTag};
pub use error::{CryptoError, CryptoResult};
pub use n2he::{Ciphertext, N2heCipher, N2heParams, SecretKey, SecurityLevel};
pub use sign::{HybridKeyPair, HybridPublicKey, HybridSignature};
pub use skellam::Skellam;
