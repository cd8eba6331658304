//! Key lifecycle and storage for SFUP
//!
//! A key moves REGISTERED → ACTIVE → (EXPIRED | REVOKED). Only ACTIVE keys
//! may encrypt; any non-revoked key may still decrypt historical packages.
//! Storage is pluggable behind the [`KeyProvider`] capability trait: a local
//! encrypted file store, or an external KMS holding opaque handles with
//! material unwrapped per operation. Every state transition emits an
//! evidence event.

pub mod file;
pub mod kms;
pub mod provider;

pub use file::FileKeyStore;
pub use kms::{KmsClient, KmsKeyProvider};
pub use provider::{KeyError, KeyMaterial, KeyMetadata, KeyProvider, KeyState};
