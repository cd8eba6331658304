//! Package validation on receive
//!
//! Verification order: magic and version, manifest parse, content hash,
//! signature, key lookup with activation-time check, size limits. The first
//! three run inside the wire parser; the rest need the published identities,
//! the key metadata and the operating envelope, which live here.

use std::collections::BTreeMap;

use sfup_common::{KeyId, OperatingEnvelope, WorkerId};
use sfup_crypto::HybridPublicKey;
use sfup_keys::KeyMetadata;
use sfup_package::UpdatePackage;
use tracing::debug;

use crate::error::{AggregatorError, AggregatorResult};

/// Validates raw package bytes into accepted packages.
pub struct PackageValidator {
    envelope: OperatingEnvelope,
    n_lwe: usize,
    identities: BTreeMap<WorkerId, HybridPublicKey>,
}

impl PackageValidator {
    /// Creates a validator for a deployment.
    pub fn new(
        envelope: OperatingEnvelope,
        n_lwe: usize,
        identities: BTreeMap<WorkerId, HybridPublicKey>,
    ) -> Self {
        Self {
            envelope,
            n_lwe,
            identities,
        }
    }

    /// Registers a worker identity.
    pub fn add_identity(&mut self, worker: WorkerId, identity: HybridPublicKey) {
        self.identities.insert(worker, identity);
    }

    /// Runs the full §4.5 verification order over received bytes.
    pub fn validate(
        &self,
        bytes: &[u8],
        key_meta: &KeyMetadata,
    ) -> AggregatorResult<UpdatePackage> {
        // (i)-(iii): framing, manifest JSON, content hash.
        let package = UpdatePackage::parse(bytes, self.n_lwe)?;

        // (iv): signature against the published worker identity.
        let worker = WorkerId::new(package.header.worker_id.clone());
        let identity = self
            .identities
            .get(&worker)
            .ok_or_else(|| AggregatorError::UnknownWorker(worker.clone()))?;
        package.verify_signature(identity)?;

        // (v): key lookup and activation-time check.
        let package_key = KeyId::new(package.header.key_id.clone());
        if package_key != key_meta.key_id {
            return Err(AggregatorError::KeyMismatch {
                expected: key_meta.key_id.clone(),
                got: package_key,
            });
        }
        if !key_meta.can_decrypt() {
            return Err(AggregatorError::KeyUnusable {
                key_id: key_meta.key_id.clone(),
                reason: format!("state {:?} forbids decryption", key_meta.state),
            });
        }
        if let Some(activated) = key_meta.activation_time_ms {
            if package.header.timestamp_ms < activated {
                return Err(AggregatorError::KeyUnusable {
                    key_id: key_meta.key_id.clone(),
                    reason: format!(
                        "package sealed at {} before key activation at {}",
                        package.header.timestamp_ms, activated
                    ),
                });
            }
        }

        // (vi): size limits from the operating envelope.
        let limit = self.envelope.max_update_size_bytes();
        if bytes.len() > limit {
            return Err(AggregatorError::Package(
                sfup_package::PackageError::TooLarge {
                    got: bytes.len(),
                    limit,
                },
            ));
        }

        // Slot bookkeeping must agree with the payload.
        let declared = package.manifest.total_slots();
        if declared != package.payload.len() {
            return Err(AggregatorError::SlotMismatch {
                parameter: "<payload>".to_string(),
                expected: declared,
                got: package.payload.len(),
            });
        }

        debug!(worker = %worker, round = package.header.round, "package validated");
        Ok(package)
    }
}
