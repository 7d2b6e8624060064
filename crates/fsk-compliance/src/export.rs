//! DEP export: one JSON archive with the full audit trail and the queue.
//!
//! Read-only with respect to the queue and the status counters. The only
//! side effects are the archive file and a single `exported` audit entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fsk_audit::{Actor, AuditAction, AuditEntry, AuditLog, SYSTEM_STREAM};
use fsk_schemas::{Certificate, ComplianceSettings, ExportReceipt, PendingTransmission};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ComplianceError;
use crate::store::write_atomic;

pub const DEP_FORMAT: &str = "fsk-dep/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepDocument {
    pub format: String,
    pub exported_at: DateTime<Utc>,
    pub participant_id: String,
    pub device_id: String,
    /// `hash_self` of the last included entry; ties the archive to the log.
    pub audit_head_hash: Option<String>,
    pub entries: Vec<AuditEntry>,
    pub pending: Vec<PendingTransmission>,
    pub certificates: Vec<Certificate>,
}

impl DepDocument {
    pub fn build(
        exported_at: DateTime<Utc>,
        settings: &ComplianceSettings,
        entries: Vec<AuditEntry>,
        pending: Vec<PendingTransmission>,
        certificates: Vec<Certificate>,
    ) -> Self {
        Self {
            format: DEP_FORMAT.to_string(),
            exported_at,
            participant_id: settings.participant_id.clone(),
            device_id: settings.device_id.clone(),
            audit_head_hash: entries.last().and_then(|e| e.hash_self.clone()),
            entries,
            pending,
            certificates,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "dep-export-{}.json",
            self.exported_at.format("%Y%m%dT%H%M%S%.3fZ")
        )
    }
}

/// Write `doc` into `dir` (created if missing). Returns the archive path.
pub async fn write_dep_document(dir: &Path, doc: &DepDocument) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create export dir {:?}", dir))?;
    let path = dir.join(doc.file_name());
    let bytes = serde_json::to_vec_pretty(doc).context("encode dep export")?;
    write_atomic(&path, &bytes).await?;
    Ok(path)
}

pub struct DepExporter {
    audit: Arc<AuditLog>,
}

impl DepExporter {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }

    pub async fn export(
        &self,
        settings: &ComplianceSettings,
        pending: Vec<PendingTransmission>,
        certificates: Vec<Certificate>,
        actor: Actor,
    ) -> Result<ExportReceipt, ComplianceError> {
        if !settings.export_enabled {
            return Err(ComplianceError::NotReady("DEP export is disabled".to_string()));
        }
        let target = settings.export_path.trim();
        if target.is_empty() {
            return Err(ComplianceError::NotReady("export_path is not set".to_string()));
        }
        if let Some(reason) = self.audit.halt_reason() {
            return Err(ComplianceError::Storage(format!("audit log halted: {reason}")));
        }

        let doc = DepDocument::build(
            Utc::now(),
            settings,
            self.audit.entries(),
            pending,
            certificates,
        );
        let path = write_dep_document(Path::new(target), &doc).await?;
        let path = path.display().to_string();

        let receipt = ExportReceipt {
            exported_at: doc.exported_at,
            path: path.clone(),
            entry_count: doc.entries.len() as u64,
            pending_count: doc.pending.len() as u64,
        };

        self.audit.append(
            SYSTEM_STREAM,
            AuditAction::Exported,
            actor,
            json!({
                "path": path,
                "entry_count": receipt.entry_count,
                "pending_count": receipt.pending_count,
                "audit_head_hash": doc.audit_head_hash,
            }),
        )?;
        info!(%path, entries = receipt.entry_count, pending = receipt.pending_count, "DEP export written");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_export_path_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap());
        let ex = DepExporter::new(audit.clone());
        let settings = ComplianceSettings {
            export_enabled: true,
            export_path: "  ".to_string(),
            ..Default::default()
        };
        let err = ex
            .export(&settings, vec![], vec![], Actor::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, ComplianceError::NotReady(_)));
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn export_writes_document_and_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap());
        audit
            .append("o1", AuditAction::Created, Actor::Orders, json!({}))
            .unwrap();
        let out = dir.path().join("dep");
        let settings = ComplianceSettings {
            export_enabled: true,
            export_path: out.display().to_string(),
            participant_id: "ATU1".to_string(),
            ..Default::default()
        };

        let r = DepExporter::new(audit.clone())
            .export(&settings, vec![], vec![], Actor::Operator)
            .await
            .unwrap();
        assert_eq!(r.entry_count, 1);

        let doc: DepDocument =
            serde_json::from_slice(&std::fs::read(&r.path).unwrap()).unwrap();
        assert_eq!(doc.format, DEP_FORMAT);
        assert_eq!(doc.participant_id, "ATU1");
        assert_eq!(doc.audit_head_hash, audit.entries()[0].hash_self);

        assert_eq!(audit.len(), 2);
        assert_eq!(audit.entries()[1].action, AuditAction::Exported);
    }
}
