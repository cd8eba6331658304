//! Update-package envelope for SFUP
//!
//! A sealed package is the only artifact a worker ever emits: header,
//! manifest, ciphertext payload, content hash and hybrid signature in one
//! versioned big-endian binary envelope. Serialization is deterministic
//! (manifest JSON keys in sorted order), so sealing a parsed package with an
//! identical manifest reproduces the original bytes.

pub mod manifest;
pub mod wire;

pub use manifest::{
    CompressionMeta, Manifest, PackageHeader, SafetyStats, TrainingMeta, SIG_ALG_HYBRID,
};
pub use wire::{PackageError, UpdatePackage, FORMAT_VERSION, MAGIC};
