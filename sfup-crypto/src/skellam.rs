//! Skellam noise sampling
//!
//! The Skellam distribution is the difference of two independent
//! Poisson(μ) variates. It is discrete, symmetric around zero, and
//! simultaneously provides the LWE error term and the differential-privacy
//! noise of the scheme. Variates are drawn by uniform-to-Poisson inversion
//! from a cryptographically seeded stream; no floating-point normal
//! approximation is used anywhere.

use rand::Rng;

use crate::error::{CryptoError, CryptoResult};

/// Lower bound of the supported μ range.
pub const MU_MIN: f64 = 1.0;
/// Upper bound of the supported μ range.
pub const MU_MAX: f64 = 10.0;

/// Symmetric Skellam(μ, μ) sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Skellam {
    mu: f64,
}

impl Skellam {
    /// Creates a sampler, refusing μ outside `[1.0, 10.0]`.
    ///
    /// Below 1.0 the noise no longer carries a meaningful privacy bound;
    /// above 10.0 the inversion loop and the cipher's noise budget degrade.
    pub fn new(mu: f64) -> CryptoResult<Self> {
        if !(MU_MIN..=MU_MAX).contains(&mu) || !mu.is_finite() {
            return Err(CryptoError::InvalidMu { mu });
        }
        Ok(Self { mu })
    }

    /// The μ parameter.
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Variance of a single draw, `2μ`.
    pub fn variance(&self) -> f64 {
        2.0 * self.mu
    }

    /// Draws one Skellam variate as `X₁ − X₂`, `Xᵢ ~ Poisson(μ)`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        let x1 = sample_poisson(rng, self.mu);
        let x2 = sample_poisson(rng, self.mu);
        x1 as i64 - x2 as i64
    }
}

/// Poisson(μ) by CDF inversion of a uniform draw.
///
/// Walks the CDF term by term: `p_0 = e^{-μ}`, `p_{k+1} = p_k · μ/(k+1)`.
/// For μ ≤ 10 the loop terminates within a few dozen iterations with
/// overwhelming probability; the hard cap guards against pathological
/// uniform draws at the top of the interval.
fn sample_poisson<R: Rng + ?Sized>(rng: &mut R, mu: f64) -> u64 {
    const MAX_K: u64 = 4096;

    let u: f64 = rng.gen();
    let mut p = (-mu).exp();
    let mut cdf = p;
    let mut k = 0u64;
    while u > cdf && k < MAX_K {
        k += 1;
        p *= mu / k as f64;
        cdf += p;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_rejects_mu_out_of_range() {
        assert!(matches!(
            Skellam::new(0.5),
            Err(CryptoError::InvalidMu { .. })
        ));
        assert!(matches!(
            Skellam::new(10.01),
            Err(CryptoError::InvalidMu { .. })
        ));
        assert!(Skellam::new(f64::NAN).is_err());
        assert!(Skellam::new(3.19).is_ok());
    }

    #[test]
    fn test_sample_deterministic_given_stream() {
        let skellam = Skellam::new(3.19).unwrap();
        let mut a = ChaCha20Rng::from_seed([9u8; 32]);
        let mut b = ChaCha20Rng::from_seed([9u8; 32]);
        for _ in 0..64 {
            assert_eq!(skellam.sample(&mut a), skellam.sample(&mut b));
        }
    }

    #[test]
    fn test_empirical_moments() {
        // Mean ~ 0, variance ~ 2mu over a large sample.
        let skellam = Skellam::new(3.19).unwrap();
        let mut rng = ChaCha20Rng::from_seed([42u8; 32]);
        let n = 20_000;
        let samples: Vec<i64> = (0..n).map(|_| skellam.sample(&mut rng)).collect();
        let mean = samples.iter().sum::<i64>() as f64 / n as f64;
        let var = samples
            .iter()
            .map(|&x| (x as f64 - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        assert!(mean.abs() < 0.1, "mean {mean} too far from 0");
        let expected = skellam.variance();
        assert!(
            (var - expected).abs() < 0.5,
            "variance {var} too far from {expected}"
        );
    }

    #[test]
    fn test_poisson_inversion_small_mu() {
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let n = 20_000;
        let mu = 1.0;
        let total: u64 = (0..n).map(|_| sample_poisson(&mut rng, mu)).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - mu).abs() < 0.05, "Poisson mean {mean} vs {mu}");
    }
}
