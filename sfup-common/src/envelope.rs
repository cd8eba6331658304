//! Operating envelope and environment configuration
//!
//! The envelope is the immutable per-deployment record of operating limits.
//! It is loaded and validated once at startup; every unknown key in the
//! source file is a startup error, never a silent no-op. The envelope may be
//! reloaded between rounds but is never mutated in place during one.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope loading and validation errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope file could not be read.
    #[error("failed to read envelope file: {0}")]
    Io(#[from] std::io::Error),

    /// The envelope file could not be parsed (includes unknown keys).
    #[error("failed to parse envelope: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A field value is outside its allowed range.
    #[error("invalid envelope field {field}: {reason}")]
    Invalid {
        /// Offending field name.
        field: &'static str,
        /// Why the value is rejected.
        reason: String,
    },

    /// A required production setting is missing.
    #[error("missing required setting {name}: {remediation}")]
    MissingSetting {
        /// Environment variable name.
        name: &'static str,
        /// How to fix it.
        remediation: &'static str,
    },
}

/// Immutable per-deployment operating limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatingEnvelope {
    /// L2 clipping norm applied to every combined gradient.
    pub clip_norm: f64,
    /// Rand-K sparsity ratio ρ in `(0, 1]`.
    pub sparsity_ratio: f64,
    /// Quantization bit width, one of 2, 4, 8.
    pub bits: u8,
    /// Skellam noise parameter μ, in `[1.0, 10.0]`.
    pub mu: f64,
    /// Total differential-privacy budget per worker.
    pub epsilon_cap: f64,
    /// DP δ parameter.
    pub delta: f64,
    /// Minimum valid packages to commit a round.
    pub quorum_threshold: usize,
    /// MAD multiplier for outlier rejection.
    pub mad_k: f64,
    /// Maximum serialized package size in KiB.
    pub max_update_size_kb: usize,
    /// Minimum seconds between rounds.
    pub min_round_interval_secs: u64,
    /// Maximum seconds between rounds.
    pub max_round_interval_secs: u64,
    /// Maximum acceptable L2 norm of an aggregated delta.
    pub max_delta_norm: f64,
    /// Maximum acceptable KL-divergence proxy vs the previous delta.
    pub max_kl: f64,
    /// Experts with a gate weight below this are dropped.
    pub gate_threshold: f32,
    /// Maximum quantization mean-squared error per tensor.
    pub max_quality_mse: f64,
    /// Collection deadline per round in seconds.
    pub round_timeout_secs: u64,
    /// Pinned per-round ε; when set, the accountant uses it verbatim
    /// instead of deriving ε from μ, clip norm and sparsity.
    #[serde(default)]
    pub epsilon_per_round: Option<f64>,
    /// Whether budget exhaustion halts further submissions.
    #[serde(default = "default_true")]
    pub hard_stop_enabled: bool,
    /// Constant `C` in the noise-budget bound `(q/2t)^2 / (C·μ)`.
    #[serde(default = "default_noise_budget_constant")]
    pub noise_budget_constant: f64,
}

fn default_true() -> bool {
    true
}

fn default_noise_budget_constant() -> f64 {
    135.0
}

impl Default for OperatingEnvelope {
    fn default() -> Self {
        Self {
            clip_norm: 1.0,
            sparsity_ratio: 0.1,
            bits: 8,
            mu: 3.19,
            epsilon_cap: 8.0,
            delta: 1e-5,
            quorum_threshold: 3,
            mad_k: 3.0,
            max_update_size_kb: 65_536,
            min_round_interval_secs: 10,
            max_round_interval_secs: 3_600,
            max_delta_norm: 100.0,
            max_kl: 1.0,
            gate_threshold: 0.15,
            max_quality_mse: 0.05,
            round_timeout_secs: 300,
            epsilon_per_round: None,
            hard_stop_enabled: true,
            noise_budget_constant: 135.0,
        }
    }
}

impl OperatingEnvelope {
    /// Parses an envelope from YAML and validates it.
    pub fn from_yaml_str(source: &str) -> Result<Self, EnvelopeError> {
        let envelope: OperatingEnvelope = serde_yaml::from_str(source)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Loads an envelope from a YAML file and validates it.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, EnvelopeError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&source)
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if !(self.clip_norm > 0.0) {
            return Err(EnvelopeError::Invalid {
                field: "clip_norm",
                reason: format!("must be > 0, got {}", self.clip_norm),
            });
        }
        if !(self.sparsity_ratio > 0.0 && self.sparsity_ratio <= 1.0) {
            return Err(EnvelopeError::Invalid {
                field: "sparsity_ratio",
                reason: format!("must be in (0, 1], got {}", self.sparsity_ratio),
            });
        }
        if !matches!(self.bits, 2 | 4 | 8) {
            return Err(EnvelopeError::Invalid {
                field: "bits",
                reason: format!("must be one of 2, 4, 8, got {}", self.bits),
            });
        }
        if !(1.0..=10.0).contains(&self.mu) {
            return Err(EnvelopeError::Invalid {
                field: "mu",
                reason: format!("must be in [1.0, 10.0], got {}", self.mu),
            });
        }
        if !(self.epsilon_cap > 0.0) {
            return Err(EnvelopeError::Invalid {
                field: "epsilon_cap",
                reason: format!("must be > 0, got {}", self.epsilon_cap),
            });
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(EnvelopeError::Invalid {
                field: "delta",
                reason: format!("must be in (0, 1), got {}", self.delta),
            });
        }
        if self.quorum_threshold == 0 {
            return Err(EnvelopeError::Invalid {
                field: "quorum_threshold",
                reason: "must be >= 1".to_string(),
            });
        }
        if !(self.mad_k > 0.0) {
            return Err(EnvelopeError::Invalid {
                field: "mad_k",
                reason: format!("must be > 0, got {}", self.mad_k),
            });
        }
        if self.max_update_size_kb == 0 {
            return Err(EnvelopeError::Invalid {
                field: "max_update_size_kb",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.min_round_interval_secs > self.max_round_interval_secs {
            return Err(EnvelopeError::Invalid {
                field: "min_round_interval_secs",
                reason: format!(
                    "min {} exceeds max {}",
                    self.min_round_interval_secs, self.max_round_interval_secs
                ),
            });
        }
        if self.round_timeout_secs > self.max_round_interval_secs {
            return Err(EnvelopeError::Invalid {
                field: "round_timeout_secs",
                reason: format!(
                    "timeout {} exceeds max round interval {}",
                    self.round_timeout_secs, self.max_round_interval_secs
                ),
            });
        }
        if !(self.max_quality_mse > 0.0) {
            return Err(EnvelopeError::Invalid {
                field: "max_quality_mse",
                reason: format!("must be > 0, got {}", self.max_quality_mse),
            });
        }
        if let Some(eps) = self.epsilon_per_round {
            if !(eps > 0.0) {
                return Err(EnvelopeError::Invalid {
                    field: "epsilon_per_round",
                    reason: format!("must be > 0 when set, got {eps}"),
                });
            }
        }
        if !(self.noise_budget_constant > 0.0) {
            return Err(EnvelopeError::Invalid {
                field: "noise_budget_constant",
                reason: format!("must be > 0, got {}", self.noise_budget_constant),
            });
        }
        Ok(())
    }

    /// Maximum serialized package size in bytes.
    pub fn max_update_size_bytes(&self) -> usize {
        self.max_update_size_kb * 1024
    }
}

/// Deployment environment selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnvironment {
    /// Production: secrets are mandatory.
    Production,
    /// Development: missing secrets are tolerated with a warning.
    #[default]
    Development,
}

/// Process-level configuration from the recognized `SFUP_*` variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Deployment environment (`SFUP_ENVIRONMENT`).
    pub environment: DeploymentEnvironment,
    /// 32-byte hex master secret for key-store encryption
    /// (`SFUP_MASTER_SECRET`); required in production.
    pub master_secret: Option<[u8; 32]>,
    /// Directory for the evidence log (`SFUP_EVIDENCE_DIR`).
    pub evidence_dir: std::path::PathBuf,
    /// Concurrent round limit across key ids (`SFUP_MAX_CONCURRENT_ROUNDS`).
    pub max_concurrent_rounds: usize,
}

impl EnvConfig {
    /// Reads the recognized environment variables.
    ///
    /// In production a missing or malformed `SFUP_MASTER_SECRET` is a
    /// startup-fatal error.
    pub fn from_env() -> Result<Self, EnvelopeError> {
        let environment = match std::env::var("SFUP_ENVIRONMENT").ok().as_deref() {
            Some("production") => DeploymentEnvironment::Production,
            Some("development") | None => DeploymentEnvironment::Development,
            Some(other) => {
                return Err(EnvelopeError::Invalid {
                    field: "SFUP_ENVIRONMENT",
                    reason: format!("expected production or development, got {other}"),
                });
            }
        };

        let master_secret = match std::env::var("SFUP_MASTER_SECRET").ok() {
            Some(hex_str) => Some(Self::parse_master_secret(&hex_str)?),
            None => None,
        };

        if environment == DeploymentEnvironment::Production && master_secret.is_none() {
            return Err(EnvelopeError::MissingSetting {
                name: "SFUP_MASTER_SECRET",
                remediation: "set SFUP_MASTER_SECRET to 64 hex chars (32 bytes) in production",
            });
        }

        let evidence_dir = std::env::var("SFUP_EVIDENCE_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("evidence"));

        let max_concurrent_rounds = match std::env::var("SFUP_MAX_CONCURRENT_ROUNDS").ok() {
            Some(raw) => raw.parse().map_err(|_| EnvelopeError::Invalid {
                field: "SFUP_MAX_CONCURRENT_ROUNDS",
                reason: format!("expected an integer, got {raw}"),
            })?,
            None => 1,
        };

        Ok(Self {
            environment,
            master_secret,
            evidence_dir,
            max_concurrent_rounds,
        })
    }

    fn parse_master_secret(hex_str: &str) -> Result<[u8; 32], EnvelopeError> {
        let bytes = hex::decode(hex_str).map_err(|_| EnvelopeError::Invalid {
            field: "SFUP_MASTER_SECRET",
            reason: "not valid hex".to_string(),
        })?;
        bytes.try_into().map_err(|_| EnvelopeError::Invalid {
            field: "SFUP_MASTER_SECRET",
            reason: "must decode to exactly 32 bytes".to_string(),
        })
    }
}
