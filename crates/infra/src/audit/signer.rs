use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use stockguard_inventory::Operation;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("signing key cannot be empty")]
    EmptyKey,
}

/// HMAC-SHA256 signatures over committed operations.
#[derive(Clone)]
pub struct OperationSigner {
    mac: HmacSha256,
}

impl core::fmt::Debug for OperationSigner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("OperationSigner { .. }")
    }
}

impl OperationSigner {
    pub fn new(key: &[u8]) -> Result<Self, SignerError> {
        if key.is_empty() {
            return Err(SignerError::EmptyKey);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| SignerError::EmptyKey)?;
        Ok(Self { mac })
    }

    /// Canonical signed payload:
    /// `id|resource_key|kind|new_quantity|version|actor|timestamp`.
    fn payload(operation: &Operation, version: u64, at: DateTime<Utc>) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            operation.id(),
            operation.resource_key(),
            operation.kind(),
            operation.computed_new_quantity(),
            version,
            operation.actor(),
            at.to_rfc3339_opts(SecondsFormat::Micros, true),
        )
    }

    /// Base64-encoded signature for `operation` committed at `version`.
    pub fn sign(&self, operation: &Operation, version: u64, at: DateTime<Utc>) -> String {
        let mut mac = self.mac.clone();
        mac.update(Self::payload(operation, version, at).as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, operation: &Operation, version: u64, at: DateTime<Utc>, signature: &str) -> bool {
        let Ok(bytes) = STANDARD.decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(Self::payload(operation, version, at).as_bytes());
        mac.verify_slice(&bytes).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockguard_core::{ActorId, OperationId, ResourceKey, VersionedRecord};
    use stockguard_inventory::OperationKind;

    fn operation() -> Operation {
        Operation::new(
            OperationId::new(),
            "products",
            ResourceKey::new("P1", "S1").unwrap(),
            OperationKind::Increase,
            10,
            ActorId::new(),
            VersionedRecord::new(100, 3),
        )
        .unwrap()
    }

    #[test]
    fn signature_verifies_only_for_the_signed_fields() {
        let signer = OperationSigner::new(b"secret").unwrap();
        let op = operation();
        let at = Utc::now();
        let sig = signer.sign(&op, 4, at);

        assert!(signer.verify(&op, 4, at, &sig));
        assert!(!signer.verify(&op, 5, at, &sig));
        assert!(!signer.verify(&operation(), 4, at, &sig));
        assert!(!OperationSigner::new(b"other").unwrap().verify(&op, 4, at, &sig));
        assert!(!signer.verify(&op, 4, at, "not base64!"));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(OperationSigner::new(b"").unwrap_err(), SignerError::EmptyKey);
    }
}
