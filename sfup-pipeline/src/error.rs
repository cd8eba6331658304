//! Error types for the gradient pipeline

use sfup_common::ErrorKind;
use sfup_crypto::CryptoError;
use sfup_package::PackageError;
use thiserror::Error;

/// Pipeline error types
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The error-feedback-augmented gradient exceeded twice the clip norm,
    /// which only happens when the residual memory is corrupt.
    #[error("gradient norm {norm} exceeds 2x clip norm {clip_norm} after error feedback; residual memory corrupt")]
    ClipNormExceeded {
        /// Observed augmented norm.
        norm: f64,
        /// Configured clip norm.
        clip_norm: f64,
    },

    /// Quantization lost more quality than the envelope allows.
    #[error("quantization of {parameter} lost quality: MSE {mse} exceeds {max_mse}")]
    QuantizationQualityLoss {
        /// Offending parameter.
        parameter: String,
        /// Measured mean-squared error.
        mse: f64,
        /// Envelope ceiling.
        max_mse: f64,
    },

    /// The sealed package exceeds the envelope size limit.
    #[error("sealed package of {bytes} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Serialized size.
        bytes: usize,
        /// Envelope limit in bytes.
        limit: usize,
    },

    /// The worker's differential-privacy budget is spent.
    #[error("privacy budget exhausted: consumed {consumed} of cap {cap}")]
    PrivacyBudgetExhausted {
        /// ε consumed so far.
        consumed: f64,
        /// ε cap.
        cap: f64,
    },

    /// A gradient set does not match the deployment schema.
    #[error("gradient schema violation: {0}")]
    Schema(String),

    /// Encryption failed (includes noise budget exhaustion).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Sealing the package failed.
    #[error(transparent)]
    Package(#[from] PackageError),
}

impl PipelineError {
    /// Maps onto the workspace-wide error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::PrivacyBudgetExhausted { .. } => ErrorKind::Budget,
            PipelineError::Crypto(e) => e.kind(),
            PipelineError::Package(e) => e.kind(),
            PipelineError::ClipNormExceeded { .. }
            | PipelineError::QuantizationQualityLoss { .. }
            | PipelineError::PayloadTooLarge { .. }
            | PipelineError::Schema(_) => ErrorKind::Validation,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
