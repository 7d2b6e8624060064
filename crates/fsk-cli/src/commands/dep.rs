//! Offline DEP export from a file-store data directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fsk_audit::{read_entries, verify_hash_chain, VerifyResult};
use fsk_compliance::store::{read_json, CERTIFICATES_FILE, QUEUE_FILE, SETTINGS_FILE};
use fsk_compliance::{write_dep_document, DepDocument};
use fsk_config::ServiceConfig;
use fsk_schemas::{Certificate, ComplianceSettings, PendingTransmission};
use tracing::debug;

#[derive(Debug)]
pub struct OfflineExport {
    pub path: PathBuf,
    pub entry_count: usize,
    pub pending_count: usize,
}

pub async fn export_offline(data_dir: &Path, out: &Path) -> Result<OfflineExport> {
    let audit_path = ServiceConfig {
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    }
    .audit_log_path();
    if !audit_path.is_file() {
        bail!("no audit log at {:?}", audit_path);
    }
    if let VerifyResult::Broken { line, reason } = verify_hash_chain(&audit_path)? {
        bail!("AUDIT_CHAIN_BROKEN line={} reason={}; refusing to export", line, reason);
    }

    let entries = read_entries(&audit_path)?;
    let settings: ComplianceSettings = read_json(&data_dir.join(SETTINGS_FILE))
        .await?
        .unwrap_or_default();
    let pending: Vec<PendingTransmission> = read_json(&data_dir.join(QUEUE_FILE))
        .await?
        .unwrap_or_default();
    let certificates: Vec<Certificate> = read_json(&data_dir.join(CERTIFICATES_FILE))
        .await?
        .unwrap_or_default();
    debug!(
        entries = entries.len(),
        pending = pending.len(),
        certificates = certificates.len(),
        "dep snapshot read"
    );

    let doc = DepDocument::build(Utc::now(), &settings, entries, pending, certificates);
    let path = write_dep_document(out, &doc)
        .await
        .with_context(|| format!("write dep archive into {:?}", out))?;

    Ok(OfflineExport {
        path,
        entry_count: doc.entries.len(),
        pending_count: doc.pending.len(),
    })
}
