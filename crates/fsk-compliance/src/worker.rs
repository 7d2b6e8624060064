//! One drain = one pass over a snapshot of the queue.
//!
//! Per item, in FIFO order:
//! 1. `transmit-attempt` entry, then `attempt_count += 1` (persisted).
//! 2. Sign and submit.
//! 3. Success: `transmitted` entry, then removal from the queue.
//!    Failure: `transmit-failed` entry, item stays for the next drain.
//!
//! The `transmitted` entry is written before the item is removed. A failed
//! removal means a resend on the next drain, which the authority acks as a
//! duplicate. A receipt never leaves the queue without a `transmitted` entry.
//!
//! An audit append failure aborts the drain with `Storage`: nothing further
//! is attempted or removed while the log is halted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fsk_audit::{Actor, AuditAction, AuditLog};
use fsk_authority::{
    sign_receipt, AuthorityCredentials, AuthorityTransport, SigningIdentity,
};
use fsk_schemas::{Certificate, ComplianceSettings, SecretString, SigningDevice};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ComplianceError;
use crate::monitor::require_credentials;
use crate::queue::TransmissionQueue;

/// Inputs of one drain, captured by the caller before it starts.
pub struct DrainRequest<'a> {
    pub connected: bool,
    pub settings: &'a ComplianceSettings,
    pub active_certificate: Option<&'a Certificate>,
    pub actor: Actor,
}

/// Result of a completed drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOutcome {
    pub transmitted: u64,
    pub failed: u64,
    /// Live queue length after the pass.
    pub pending: u64,
}

pub struct TransmissionWorker {
    queue: Arc<TransmissionQueue>,
    audit: Arc<AuditLog>,
    transport: Arc<dyn AuthorityTransport>,
    in_flight: Mutex<()>,
}

impl TransmissionWorker {
    pub fn new(
        queue: Arc<TransmissionQueue>,
        audit: Arc<AuditLog>,
        transport: Arc<dyn AuthorityTransport>,
    ) -> Self {
        Self {
            queue,
            audit,
            transport,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one drain. A concurrent call gets `Busy`.
    ///
    /// `on_success` is called once per transmitted receipt with the time the
    /// authority accepted it, before the next item is attempted.
    pub async fn drain<F>(
        &self,
        req: DrainRequest<'_>,
        mut on_success: F,
    ) -> Result<DrainOutcome, ComplianceError>
    where
        F: FnMut(DateTime<Utc>) + Send,
    {
        let _flight = self
            .in_flight
            .try_lock()
            .map_err(|_| ComplianceError::Busy("drain already in progress"))?;

        if !req.connected {
            return Err(ComplianceError::Link(
                "authority not connected; run a connection test first".to_string(),
            ));
        }
        require_credentials(req.settings)?;
        let (identity, key) = signing_credential(req.settings, req.active_certificate)?;
        if let Some(reason) = self.audit.halt_reason() {
            return Err(ComplianceError::Storage(format!("audit log halted: {reason}")));
        }

        let creds = AuthorityCredentials::from_settings(req.settings);
        let snapshot = self.queue.snapshot().await;
        let mut outcome = DrainOutcome {
            transmitted: 0,
            failed: 0,
            pending: 0,
        };

        for queued in snapshot {
            let receipt_id = queued.receipt_id;
            let order_id = queued.order_id.as_str();

            self.audit.append(
                order_id,
                AuditAction::TransmitAttempt,
                req.actor,
                json!({
                    "receipt_id": receipt_id,
                    "attempt": queued.attempt_count + 1,
                    "transport": self.transport.name(),
                }),
            )?;
            let Some(item) = self.queue.record_attempt(receipt_id, Utc::now()).await? else {
                continue;
            };

            let sent = match sign_receipt(&item.payload, identity.clone(), &key, Utc::now()) {
                Ok(signed) => self.transport.submit(&creds, &signed).await,
                Err(e) => Err(e),
            };

            match sent {
                Ok(ack) => {
                    let at = Utc::now();
                    self.audit.append(
                        order_id,
                        AuditAction::Transmitted,
                        req.actor,
                        json!({
                            "receipt_id": receipt_id,
                            "attempt": item.attempt_count,
                            "authority_ref": ack.authority_ref,
                            "duplicate": ack.duplicate,
                        }),
                    )?;
                    self.queue.remove(receipt_id).await?;
                    outcome.transmitted += 1;
                    on_success(at);
                    info!(%receipt_id, order_id, attempt = item.attempt_count, "receipt transmitted");
                }
                Err(e) => {
                    self.audit.append(
                        order_id,
                        AuditAction::TransmitFailed,
                        req.actor,
                        json!({
                            "receipt_id": receipt_id,
                            "attempt": item.attempt_count,
                            "error": e.to_string(),
                        }),
                    )?;
                    outcome.failed += 1;
                    warn!(%receipt_id, order_id, attempt = item.attempt_count, error = %e, "receipt transmission failed");
                }
            }
        }

        outcome.pending = self.queue.len().await as u64;
        Ok(outcome)
    }
}

/// Signing identity and key material for the configured signing device.
fn signing_credential(
    settings: &ComplianceSettings,
    active: Option<&Certificate>,
) -> Result<(SigningIdentity, SecretString), ComplianceError> {
    match settings.signing_device {
        SigningDevice::SoftwareCertificate => {
            let cert = active.ok_or_else(|| {
                ComplianceError::Configuration("no active signing certificate".to_string())
            })?;
            Ok((
                SigningIdentity {
                    device: SigningDevice::SoftwareCertificate,
                    reference: cert.fingerprint.clone(),
                },
                settings.signing_key.clone(),
            ))
        }
        SigningDevice::HardwareToken => {
            if settings.signing_key.is_empty() {
                return Err(ComplianceError::Configuration(
                    "hardware token selected but signing_key is empty".to_string(),
                ));
            }
            Ok((
                SigningIdentity {
                    device: SigningDevice::HardwareToken,
                    reference: settings.device_id.clone(),
                },
                settings.signing_key.clone(),
            ))
        }
    }
}
