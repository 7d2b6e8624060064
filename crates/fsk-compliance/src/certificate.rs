//! Signing certificate lifecycle: validate, store, activate.
//!
//! Only the container extension is checked (`.p12` / `.pfx`, any case) and
//! the container must be non-empty; the contents are not parsed.

use std::sync::Arc;

use chrono::Utc;
use fsk_audit::{Actor, AuditAction, AuditLog, SYSTEM_STREAM};
use fsk_schemas::{Certificate, CertificateFormat};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::ComplianceError;
use crate::store::ComplianceStore;

pub struct CertificateManager {
    store: Arc<dyn ComplianceStore>,
    audit: Arc<AuditLog>,
    certs: Mutex<Vec<Certificate>>,
}

impl CertificateManager {
    pub async fn load(store: Arc<dyn ComplianceStore>, audit: Arc<AuditLog>) -> anyhow::Result<Self> {
        let certs = store.load_certificates().await?;
        Ok(Self {
            store,
            audit,
            certs: Mutex::new(certs),
        })
    }

    /// Validate and store `bytes` as the new active certificate.
    ///
    /// The previous active certificate is deactivated in the same store
    /// write that activates the new one.
    pub async fn upload(
        &self,
        filename: &str,
        bytes: &[u8],
        actor: Actor,
    ) -> Result<Certificate, ComplianceError> {
        let format = CertificateFormat::from_filename(filename).ok_or_else(|| {
            ComplianceError::UnsupportedFormat(format!(
                "'{filename}' is not a .p12 or .pfx container"
            ))
        })?;
        if bytes.is_empty() {
            return Err(ComplianceError::UnsupportedFormat(format!(
                "'{filename}' is empty"
            )));
        }
        if let Some(reason) = self.audit.halt_reason() {
            return Err(ComplianceError::Storage(format!("audit log halted: {reason}")));
        }

        let mut certs = self.certs.lock().await;

        let cert = Certificate {
            certificate_id: Uuid::new_v4(),
            filename: filename.trim().to_string(),
            format,
            uploaded_at: Utc::now(),
            active: true,
            fingerprint: hex::encode(Sha256::digest(bytes)),
            size_bytes: bytes.len() as u64,
        };

        self.store.write_certificate_blob(&cert, bytes).await?;

        let mut next: Vec<Certificate> = certs
            .iter()
            .cloned()
            .map(|mut c| {
                c.active = false;
                c
            })
            .collect();
        next.push(cert.clone());
        self.store.replace_certificates(&next).await?;
        *certs = next;

        self.audit.append(
            SYSTEM_STREAM,
            AuditAction::CertificateUploaded,
            actor,
            json!({
                "certificate_id": cert.certificate_id,
                "filename": cert.filename,
                "format": cert.format,
                "fingerprint": cert.fingerprint,
                "size_bytes": cert.size_bytes,
            }),
        )?;

        info!(
            certificate_id = %cert.certificate_id,
            filename = %cert.filename,
            "signing certificate activated"
        );
        Ok(cert)
    }

    pub async fn active(&self) -> Option<Certificate> {
        self.certs.lock().await.iter().find(|c| c.active).cloned()
    }

    /// All certificates in upload order.
    pub async fn list(&self) -> Vec<Certificate> {
        self.certs.lock().await.clone()
    }
}
