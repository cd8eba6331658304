//! Error types for SFUP cryptographic operations

use sfup_common::ErrorKind;
use thiserror::Error;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Skellam parameter outside the supported range.
    #[error("Skellam parameter mu={mu} outside supported range [1.0, 10.0]")]
    InvalidMu {
        /// Rejected value.
        mu: f64,
    },

    /// The additive noise budget of a ciphertext is exhausted.
    #[error("noise budget exhausted: {accumulated} additions accumulated, budget {budget}")]
    NoiseBudgetExhausted {
        /// Fresh ciphertexts folded into the sum so far.
        accumulated: u64,
        /// Maximum tolerated before decryption failure exceeds 2^-40.
        budget: u64,
    },

    /// Ciphertexts with different dimensions cannot be combined.
    #[error("LWE dimension mismatch: {left} vs {right}")]
    DimensionMismatch {
        /// Left operand dimension.
        left: usize,
        /// Right operand dimension.
        right: usize,
    },

    /// Key material has the wrong length for the parameter set.
    #[error("invalid key material: expected {expected} coefficients, got {got}")]
    InvalidKeyMaterial {
        /// Expected coefficient count.
        expected: usize,
        /// Actual coefficient count.
        got: usize,
    },

    /// Plaintext message does not fit the plaintext modulus.
    #[error("message {message} does not fit plaintext modulus {modulus}")]
    MessageOutOfRange {
        /// Offending message.
        message: u64,
        /// Plaintext modulus t.
        modulus: u64,
    },

    /// A signature failed to verify or to parse.
    #[error("signature error: {0}")]
    Signature(String),

    /// A substream tag part contained bytes outside the identifier alphabet.
    #[error("invalid substream tag part: {0}")]
    InvalidTag(String),
}

impl CryptoError {
    /// Maps onto the workspace-wide error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::NoiseBudgetExhausted { .. } => ErrorKind::Budget,
            CryptoError::InvalidMu { .. } | CryptoError::InvalidTag(_) => ErrorKind::Config,
            _ => ErrorKind::Crypto,
        }
    }
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
