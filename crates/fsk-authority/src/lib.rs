//! Boundary to the external tax-authority endpoint.
//!
//! This crate owns the [`AuthorityTransport`] trait, the receipt signing stub,
//! and two transports:
//! - [`HttpAuthority`] talks JSON over HTTPS (`reqwest`).
//! - [`PaperAuthority`] is deterministic and scriptable (link up/down,
//!   per-order failures) for tests and local development.
//!
//! Queueing, retries and audit live in `fsk-compliance`; a transport only
//! answers "did this one call succeed".

use std::fmt;

use chrono::{DateTime, Utc};
use fsk_schemas::{ComplianceSettings, Receipt, SecretString, SigningDevice};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

mod http;
mod paper;

pub use http::HttpAuthority;
pub use paper::PaperAuthority;

// ---------------------------------------------------------------------------
// Credentials + signed payload
// ---------------------------------------------------------------------------

/// Login material for the authority, taken from the compliance settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityCredentials {
    pub participant_id: String,
    pub user_id: String,
    pub pin: SecretString,
    pub device_id: String,
}

impl AuthorityCredentials {
    pub fn from_settings(s: &ComplianceSettings) -> Self {
        Self {
            participant_id: s.participant_id.clone(),
            user_id: s.user_id.clone(),
            pin: s.pin.clone(),
            device_id: s.device_id.clone(),
        }
    }
}

/// Which credential attested a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningIdentity {
    pub device: SigningDevice,
    /// Certificate fingerprint (software certificate) or device id (token).
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedReceipt {
    pub receipt: Receipt,
    pub signature: String,
    pub signed_by: SigningIdentity,
    pub signed_at: DateTime<Utc>,
}

/// Sign a receipt.
///
/// Stub: sha256 over (signing reference, key material, canonical receipt
/// JSON), hex encoded. Deterministic for identical inputs. Real signature
/// creation is delegated to the registered signing device in production
/// deployments and is not modelled here.
pub fn sign_receipt(
    receipt: &Receipt,
    identity: SigningIdentity,
    key_material: &SecretString,
    signed_at: DateTime<Utc>,
) -> Result<SignedReceipt, AuthorityError> {
    let canonical = serde_json::to_string(receipt)
        .map_err(|e| AuthorityError::Decode(format!("receipt serialize: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(identity.reference.as_bytes());
    hasher.update(b"|");
    hasher.update(key_material.expose().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());

    Ok(SignedReceipt {
        receipt: receipt.clone(),
        signature: hex::encode(hasher.finalize()),
        signed_by: identity,
        signed_at,
    })
}

/// Authority acknowledgement for one receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub receipt_id: Uuid,
    /// Reference number assigned by the authority.
    pub authority_ref: String,
    /// `true` when the authority already had this receipt.
    #[serde(default)]
    pub duplicate: bool,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a transport may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    /// Network or transport failure (unreachable, timeout, TLS).
    Transport(String),
    /// The authority answered with an application-level error.
    Api { code: Option<u16>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
    /// Local configuration is unusable (e.g. malformed base URL).
    Config(String),
}

impl fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityError::Transport(msg) => write!(f, "transport error: {msg}"),
            AuthorityError::Api {
                code: Some(c),
                message,
            } => write!(f, "authority api error code={c}: {message}"),
            AuthorityError::Api {
                code: None,
                message,
            } => write!(f, "authority api error: {message}"),
            AuthorityError::Decode(msg) => write!(f, "decode error: {msg}"),
            AuthorityError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for AuthorityError {}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Contract for reaching the tax authority.
///
/// Object-safe and `Send + Sync` so the service can hold an
/// `Arc<dyn AuthorityTransport>` across tasks.
#[async_trait::async_trait]
pub trait AuthorityTransport: Send + Sync {
    /// Human-readable transport name (e.g. `"http"`, `"paper"`).
    fn name(&self) -> &'static str;

    /// Health probe with the given credentials.
    async fn probe(&self, creds: &AuthorityCredentials) -> Result<(), AuthorityError>;

    /// Submit one signed receipt.
    ///
    /// Must be idempotent on `receipt_id`: resubmitting a receipt the
    /// authority already holds returns an ack with `duplicate = true`.
    async fn submit(
        &self,
        creds: &AuthorityCredentials,
        receipt: &SignedReceipt,
    ) -> Result<SubmitAck, AuthorityError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsk_schemas::{CompletedOrder, OrderLine};

    fn receipt() -> Receipt {
        Receipt::from_order(&CompletedOrder {
            order_id: "ord-1".to_string(),
            table: None,
            lines: vec![OrderLine {
                name: "Melange".to_string(),
                quantity: 1,
                unit_price_cents: 420,
                vat_rate_bp: 1000,
            }],
            completed_at: Utc::now(),
        }).unwrap()
    }

    fn identity(reference: &str) -> SigningIdentity {
        SigningIdentity {
            device: SigningDevice::SoftwareCertificate,
            reference: reference.to_string(),
        }
    }

    #[test]
    fn signature_is_deterministic() {
        let r = receipt();
        let now = Utc::now();
        let a = sign_receipt(&r, identity("fp-1"), &SecretString::new("k"), now).unwrap();
        let b = sign_receipt(&r, identity("fp-1"), &SecretString::new("k"), now).unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.signature.len(), 64);
    }

    #[test]
    fn signature_depends_on_identity_and_key() {
        let r = receipt();
        let now = Utc::now();
        let base = sign_receipt(&r, identity("fp-1"), &SecretString::new("k"), now).unwrap();
        let other_cert = sign_receipt(&r, identity("fp-2"), &SecretString::new("k"), now).unwrap();
        let other_key = sign_receipt(&r, identity("fp-1"), &SecretString::new("x"), now).unwrap();
        assert_ne!(base.signature, other_cert.signature);
        assert_ne!(base.signature, other_key.signature);
    }

    #[test]
    fn error_display() {
        let e = AuthorityError::Api {
            code: Some(503),
            message: "maintenance".to_string(),
        };
        assert_eq!(e.to_string(), "authority api error code=503: maintenance");
        assert_eq!(
            AuthorityError::Transport("connection refused".to_string()).to_string(),
            "transport error: connection refused"
        );
    }

    #[test]
    fn transport_is_object_safe() {
        let _t: Box<dyn AuthorityTransport> = Box::new(PaperAuthority::new());
    }
}
