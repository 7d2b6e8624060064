//! Durable state behind the service: settings, queue, certificates.
//!
//! The audit log is not part of this trait; it always lives in its own
//! hash-chained JSONL file (`fsk-audit`).
//!
//! Implementations:
//! - [`MemoryStore`]: in-process, for tests. Can be told to fail writes or
//!   to stall settings saves.
//! - [`FileStore`]: JSON files under a data directory, each rewritten
//!   atomically (temp file + rename).
//! - `PgStore` in `fsk-db`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fsk_schemas::{Certificate, ComplianceSettings, PendingTransmission};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

#[async_trait::async_trait]
pub trait ComplianceStore: Send + Sync {
    /// Short backend name for logs (`"memory"`, `"file"`, `"postgres"`).
    fn kind(&self) -> &'static str;

    async fn load_settings(&self) -> Result<Option<ComplianceSettings>>;
    async fn save_settings(&self, settings: &ComplianceSettings) -> Result<()>;

    /// Queue items in enqueue order.
    async fn load_queue(&self) -> Result<Vec<PendingTransmission>>;
    async fn insert_pending(&self, item: &PendingTransmission) -> Result<()>;
    /// Persist attempt bookkeeping for an existing item.
    async fn update_pending(&self, item: &PendingTransmission) -> Result<()>;
    async fn remove_pending(&self, receipt_id: Uuid) -> Result<()>;

    async fn load_certificates(&self) -> Result<Vec<Certificate>>;
    /// Replace the full certificate list in one atomic write.
    async fn replace_certificates(&self, certs: &[Certificate]) -> Result<()>;
    async fn write_certificate_blob(&self, cert: &Certificate, bytes: &[u8]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    settings: Option<ComplianceSettings>,
    queue: Vec<PendingTransmission>,
    certificates: Vec<Certificate>,
    blobs: BTreeMap<Uuid, Vec<u8>>,
    fail_writes: bool,
    save_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent write fail (storage outage simulation).
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Hold each settings save for `delay` (widens race windows in tests).
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        self.state().save_delay = delay;
    }

    pub fn blob(&self, certificate_id: &Uuid) -> Option<Vec<u8>> {
        self.state().blobs.get(certificate_id).cloned()
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let st = self.state();
        if st.fail_writes {
            bail!("STORE_UNAVAILABLE: memory store writes disabled");
        }
        Ok(st)
    }
}

#[async_trait::async_trait]
impl ComplianceStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn load_settings(&self) -> Result<Option<ComplianceSettings>> {
        Ok(self.state().settings.clone())
    }

    async fn save_settings(&self, settings: &ComplianceSettings) -> Result<()> {
        let delay = self.state().save_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.writable()?.settings = Some(settings.clone());
        Ok(())
    }

    async fn load_queue(&self) -> Result<Vec<PendingTransmission>> {
        Ok(self.state().queue.clone())
    }

    async fn insert_pending(&self, item: &PendingTransmission) -> Result<()> {
        let mut st = self.writable()?;
        if st.queue.iter().any(|q| q.receipt_id == item.receipt_id) {
            bail!("QUEUE_DUPLICATE: receipt {} already stored", item.receipt_id);
        }
        st.queue.push(item.clone());
        Ok(())
    }

    async fn update_pending(&self, item: &PendingTransmission) -> Result<()> {
        let mut st = self.writable()?;
        match st.queue.iter_mut().find(|q| q.receipt_id == item.receipt_id) {
            Some(slot) => {
                *slot = item.clone();
                Ok(())
            }
            None => bail!("QUEUE_MISSING: receipt {} not stored", item.receipt_id),
        }
    }

    async fn remove_pending(&self, receipt_id: Uuid) -> Result<()> {
        self.writable()?.queue.retain(|q| q.receipt_id != receipt_id);
        Ok(())
    }

    async fn load_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.state().certificates.clone())
    }

    async fn replace_certificates(&self, certs: &[Certificate]) -> Result<()> {
        self.writable()?.certificates = certs.to_vec();
        Ok(())
    }

    async fn write_certificate_blob(&self, cert: &Certificate, bytes: &[u8]) -> Result<()> {
        self.writable()?
            .blobs
            .insert(cert.certificate_id, bytes.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

pub const SETTINGS_FILE: &str = "settings.json";
pub const QUEUE_FILE: &str = "queue.json";
pub const CERTIFICATES_FILE: &str = "certificates.json";
const CERTS_DIR: &str = "certs";

/// JSON files under `root`.
///
/// Queue updates are read-modify-write of `queue.json`; the lock keeps
/// concurrent writers from interleaving.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(CERTS_DIR))
            .with_context(|| format!("create data dir {:?}", root))?;
        Ok(Self {
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn read_queue_file(&self) -> Result<Vec<PendingTransmission>> {
        Ok(read_json(&self.path(QUEUE_FILE)).await?.unwrap_or_default())
    }
}

/// Read and decode `path`; `None` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let v = serde_json::from_slice(&bytes)
                .with_context(|| format!("decode {:?}", path))?;
            Ok(Some(v))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {:?}", path)),
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid target path {:?}", path))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {:?}", tmp))?;
    let f = tokio::fs::File::open(&tmp)
        .await
        .with_context(|| format!("reopen {:?}", tmp))?;
    f.sync_all().await.with_context(|| format!("sync {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("encode json")?;
    write_atomic(path, &bytes).await
}

#[async_trait::async_trait]
impl ComplianceStore for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn load_settings(&self) -> Result<Option<ComplianceSettings>> {
        read_json(&self.path(SETTINGS_FILE)).await
    }

    async fn save_settings(&self, settings: &ComplianceSettings) -> Result<()> {
        let _g = self.write_lock.lock().await;
        write_json(&self.path(SETTINGS_FILE), settings).await
    }

    async fn load_queue(&self) -> Result<Vec<PendingTransmission>> {
        self.read_queue_file().await
    }

    async fn insert_pending(&self, item: &PendingTransmission) -> Result<()> {
        let _g = self.write_lock.lock().await;
        let mut queue = self.read_queue_file().await?;
        if queue.iter().any(|q| q.receipt_id == item.receipt_id) {
            bail!("QUEUE_DUPLICATE: receipt {} already stored", item.receipt_id);
        }
        queue.push(item.clone());
        write_json(&self.path(QUEUE_FILE), &queue).await
    }

    async fn update_pending(&self, item: &PendingTransmission) -> Result<()> {
        let _g = self.write_lock.lock().await;
        let mut queue = self.read_queue_file().await?;
        let Some(slot) = queue.iter_mut().find(|q| q.receipt_id == item.receipt_id) else {
            bail!("QUEUE_MISSING: receipt {} not stored", item.receipt_id);
        };
        *slot = item.clone();
        write_json(&self.path(QUEUE_FILE), &queue).await
    }

    async fn remove_pending(&self, receipt_id: Uuid) -> Result<()> {
        let _g = self.write_lock.lock().await;
        let mut queue = self.read_queue_file().await?;
        queue.retain(|q| q.receipt_id != receipt_id);
        write_json(&self.path(QUEUE_FILE), &queue).await
    }

    async fn load_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(read_json(&self.path(CERTIFICATES_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn replace_certificates(&self, certs: &[Certificate]) -> Result<()> {
        let _g = self.write_lock.lock().await;
        write_json(&self.path(CERTIFICATES_FILE), certs).await
    }

    async fn write_certificate_blob(&self, cert: &Certificate, bytes: &[u8]) -> Result<()> {
        let name = format!("{}.{}", cert.certificate_id, cert.format.extension());
        write_atomic(&self.root.join(CERTS_DIR).join(name), bytes).await
    }
}
