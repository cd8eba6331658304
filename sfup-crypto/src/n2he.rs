//! N2HE: LWE-based additively homomorphic symmetric encryption
//!
//! One ciphertext `(A, b)` encodes one integer `m ∈ [0, t)` under a shared
//! secret `s` as `b = ⟨A, s⟩ + e + (q/t)·m (mod q)` with Skellam-distributed
//! error `e`. Addition is componentwise mod `q`; decryption recovers
//! `m₁ + m₂ mod t` for as long as the accumulated noise stays below
//! `q/(2t)`.
//!
//! The ciphertext modulus is fixed at `q = 2^32`, so all modular arithmetic
//! is native wrapping `u32` arithmetic; the plaintext modulus is `t = 2^16`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::csprng::{Csprng, SubstreamTag};
use crate::error::{CryptoError, CryptoResult};
use crate::skellam::Skellam;

/// Plaintext modulus `t = 2^16`.
pub const PLAINTEXT_MODULUS: u64 = 1 << 16;

/// Scaling factor `q/t = 2^16`.
const DELTA_SHIFT: u32 = 16;

/// Half of `q/t`, the centered-rounding offset.
const HALF_DELTA: u32 = 1 << 15;

/// LWE security level of the parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// 128-bit security, `n_lwe = 1024`.
    Bits128,
    /// 192-bit security, `n_lwe = 2048`.
    Bits192,
}

impl SecurityLevel {
    /// LWE dimension for this level.
    pub fn n_lwe(self) -> usize {
        match self {
            SecurityLevel::Bits128 => 1024,
            SecurityLevel::Bits192 => 2048,
        }
    }

    /// Numeric level for metadata.
    pub fn bits(self) -> u16 {
        match self {
            SecurityLevel::Bits128 => 128,
            SecurityLevel::Bits192 => 192,
        }
    }
}

impl TryFrom<u16> for SecurityLevel {
    type Error = CryptoError;

    fn try_from(bits: u16) -> CryptoResult<Self> {
        match bits {
            128 => Ok(SecurityLevel::Bits128),
            192 => Ok(SecurityLevel::Bits192),
            other => Err(CryptoError::Signature(format!(
                "unsupported security level: {other}"
            ))),
        }
    }
}

/// N2HE parameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct N2heParams {
    /// Security level, fixing the LWE dimension.
    pub security_level: SecurityLevel,
    /// Skellam noise parameter.
    pub mu: f64,
    /// Constant `C` in the noise-budget bound.
    pub noise_budget_constant: f64,
}

impl N2heParams {
    /// Creates a parameter set, validating μ through the Skellam sampler.
    pub fn new(security_level: SecurityLevel, mu: f64) -> CryptoResult<Self> {
        Skellam::new(mu)?;
        Ok(Self {
            security_level,
            mu,
            noise_budget_constant: 135.0,
        })
    }

    /// Overrides the noise-budget constant.
    pub fn with_noise_budget_constant(mut self, c: f64) -> Self {
        self.noise_budget_constant = c;
        self
    }

    /// LWE dimension.
    pub fn n_lwe(&self) -> usize {
        self.security_level.n_lwe()
    }

    /// Maximum number of fresh ciphertexts that may be folded into one sum
    /// while keeping decryption failure probability below 2^-40.
    ///
    /// `(q/2t)² / (C·μ)` with `q/2t = 2^15`.
    pub fn max_additions(&self) -> u64 {
        let half_gap = f64::from(HALF_DELTA);
        ((half_gap * half_gap) / (self.noise_budget_constant * self.mu)) as u64
    }

    /// Checks that a packed value fits the plaintext modulus.
    pub fn check_message(&self, message: u64) -> CryptoResult<()> {
        if message >= PLAINTEXT_MODULUS {
            return Err(CryptoError::MessageOutOfRange {
                message,
                modulus: PLAINTEXT_MODULUS,
            });
        }
        Ok(())
    }

    /// Componentwise ciphertext addition mod `q`, tracking the accumulated
    /// noise budget.
    pub fn add(&self, left: &Ciphertext, right: &Ciphertext) -> CryptoResult<Ciphertext> {
        if left.a.len() != right.a.len() {
            return Err(CryptoError::DimensionMismatch {
                left: left.a.len(),
                right: right.a.len(),
            });
        }
        let accumulated = left.accumulated + right.accumulated;
        let budget = self.max_additions();
        if accumulated > budget {
            return Err(CryptoError::NoiseBudgetExhausted {
                accumulated,
                budget,
            });
        }
        let a = left
            .a
            .iter()
            .zip(right.a.iter())
            .map(|(&x, &y)| x.wrapping_add(y))
            .collect();
        Ok(Ciphertext {
            a,
            b: left.b.wrapping_add(right.b),
            accumulated,
        })
    }

    /// In-place variant of [`add`](Self::add) for long accumulations.
    pub fn add_assign(&self, acc: &mut Ciphertext, rhs: &Ciphertext) -> CryptoResult<()> {
        if acc.a.len() != rhs.a.len() {
            return Err(CryptoError::DimensionMismatch {
                left: acc.a.len(),
                right: rhs.a.len(),
            });
        }
        let accumulated = acc.accumulated + rhs.accumulated;
        let budget = self.max_additions();
        if accumulated > budget {
            return Err(CryptoError::NoiseBudgetExhausted {
                accumulated,
                budget,
            });
        }
        for (x, &y) in acc.a.iter_mut().zip(rhs.a.iter()) {
            *x = x.wrapping_add(y);
        }
        acc.b = acc.b.wrapping_add(rhs.b);
        acc.accumulated = accumulated;
        Ok(())
    }

    /// Remaining additive headroom of a ciphertext.
    pub fn remaining_additions(&self, ct: &Ciphertext) -> u64 {
        self.max_additions().saturating_sub(ct.accumulated)
    }
}

/// Shared LWE secret key, coefficients uniform in `{-1, 0, 1}`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    coeffs: Vec<i8>,
}

impl SecretKey {
    /// Generates a key from the dedicated substream of the process CSPRNG.
    ///
    /// The `key_id` keys the substream so regenerating the same id under the
    /// same seed reproduces the key.
    pub fn generate(params: &N2heParams, csprng: &Csprng, key_id: &str) -> CryptoResult<Self> {
        let mut rng = csprng.substream(SubstreamTag::LweKey, &[key_id.as_bytes()])?;
        let coeffs = (0..params.n_lwe())
            .map(|_| rng.gen_range(-1i8..=1i8))
            .collect();
        Ok(Self { coeffs })
    }

    /// Serializes the key for the key store: one byte per coefficient,
    /// offset by 1 so every byte is in `{0, 1, 2}`.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.coeffs.iter().map(|&c| (c + 1) as u8).collect()
    }

    /// Restores a key from store bytes, validating length and alphabet.
    pub fn from_bytes(params: &N2heParams, bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != params.n_lwe() {
            return Err(CryptoError::InvalidKeyMaterial {
                expected: params.n_lwe(),
                got: bytes.len(),
            });
        }
        let mut coeffs = Vec::with_capacity(bytes.len());
        for &b in bytes {
            if b > 2 {
                return Err(CryptoError::InvalidKeyMaterial {
                    expected: params.n_lwe(),
                    got: bytes.len(),
                });
            }
            coeffs.push(b as i8 - 1);
        }
        Ok(Self { coeffs })
    }

    /// Key length in coefficients.
    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    /// True when the key holds no coefficients.
    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SecretKey")
            .field("len", &self.coeffs.len())
            .finish_non_exhaustive()
    }
}

/// One LWE ciphertext: `(A, b)` plus the count of fresh ciphertexts folded
/// into it, which drives the noise budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    /// Public vector `A ∈ Z_q^{n_lwe}`.
    pub a: Vec<u32>,
    /// `b = ⟨A, s⟩ + e + (q/t)·m mod q`.
    pub b: u32,
    /// Number of fresh encryptions accumulated in this ciphertext.
    pub accumulated: u64,
}

/// Context binding an encryption batch to its key, round and worker so the
/// `A` vectors and the noise stream are deterministic given the seed.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionContext<'a> {
    /// Key id the batch encrypts under.
    pub key_id: &'a str,
    /// Round number.
    pub round: u64,
    /// Worker producing the batch.
    pub worker: &'a str,
}

/// The N2HE cipher: parameters plus the shared secret.
pub struct N2heCipher {
    params: N2heParams,
    key: SecretKey,
    skellam: Skellam,
}

impl N2heCipher {
    /// Creates a cipher instance for the given key.
    pub fn new(params: N2heParams, key: SecretKey) -> CryptoResult<Self> {
        if key.len() != params.n_lwe() {
            return Err(CryptoError::InvalidKeyMaterial {
                expected: params.n_lwe(),
                got: key.len(),
            });
        }
        let skellam = Skellam::new(params.mu)?;
        Ok(Self {
            params,
            key,
            skellam,
        })
    }

    /// Parameter set of this cipher.
    pub fn params(&self) -> &N2heParams {
        &self.params
    }

    /// Encrypts a batch of plaintext slots, one ciphertext per slot.
    ///
    /// `A` for slot `i` derives from `key_id ∥ round ∥ i`; the noise stream
    /// derives from `worker ∥ round`. Both are substreams of the process
    /// CSPRNG, so the batch is byte-identical across reruns with the same
    /// seed.
    pub fn encrypt_vector(
        &self,
        messages: &[u16],
        csprng: &Csprng,
        ctx: &EncryptionContext<'_>,
    ) -> CryptoResult<Vec<Ciphertext>> {
        let round_be = ctx.round.to_be_bytes();
        let mut noise_rng = csprng.substream(
            SubstreamTag::SkellamNoise,
            &[ctx.worker.as_bytes(), &round_be],
        )?;

        let mut out = Vec::with_capacity(messages.len());
        for (slot, &m) in messages.iter().enumerate() {
            let slot_be = (slot as u64).to_be_bytes();
            let mut a_rng = csprng.substream(
                SubstreamTag::LweMatrix,
                &[ctx.key_id.as_bytes(), &round_be, &slot_be],
            )?;
            let a: Vec<u32> = (0..self.params.n_lwe()).map(|_| a_rng.gen()).collect();
            let e = self.skellam.sample(&mut noise_rng);

            let b = dot(&a, &self.key.coeffs)
                .wrapping_add(e as u32)
                .wrapping_add(u32::from(m) << DELTA_SHIFT);

            out.push(Ciphertext {
                a,
                b,
                accumulated: 1,
            });
        }
        Ok(out)
    }

    /// Decrypts one ciphertext by centered rounding.
    ///
    /// Refuses when the accumulated count exceeds the noise budget rather
    /// than returning a silently corrupt plaintext.
    pub fn decrypt(&self, ct: &Ciphertext) -> CryptoResult<u16> {
        if ct.a.len() != self.params.n_lwe() {
            return Err(CryptoError::DimensionMismatch {
                left: ct.a.len(),
                right: self.params.n_lwe(),
            });
        }
        let budget = self.params.max_additions();
        if ct.accumulated > budget {
            return Err(CryptoError::NoiseBudgetExhausted {
                accumulated: ct.accumulated,
                budget,
            });
        }
        let r = ct.b.wrapping_sub(dot(&ct.a, &self.key.coeffs));
        // Centered rounding: (r + q/2t) / (q/t) mod t, all powers of two.
        let m = r.wrapping_add(HALF_DELTA) >> DELTA_SHIFT;
        Ok(m as u16)
    }

    /// Decrypts a batch of ciphertexts.
    pub fn decrypt_vector(&self, cts: &[Ciphertext]) -> CryptoResult<Vec<u16>> {
        cts.iter().map(|ct| self.decrypt(ct)).collect()
    }
}

impl std::fmt::Debug for N2heCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N2heCipher")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// `⟨A, s⟩ mod q` for ternary `s`; reduces to wrapping adds and subs.
fn dot(a: &[u32], s: &[i8]) -> u32 {
    let mut acc = 0u32;
    for (&ai, &si) in a.iter().zip(s.iter()) {
        match si {
            1 => acc = acc.wrapping_add(ai),
            -1 => acc = acc.wrapping_sub(ai),
            _ => {}
        }
    }
    acc
}
