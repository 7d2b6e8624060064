//! Append-only, hash-chained audit log for fiscal receipts.
//!
//! One entry == one JSON line. Every entry carries `hash_prev` (the previous
//! entry's `hash_self`) and `hash_self` (sha256 over the canonical JSON of the
//! entry without `hash_self`), so edits and deletions are detectable with
//! [`verify_hash_chain`].
//!
//! All appends go through one mutex. A failed write halts the log: further
//! appends are refused until [`AuditLog::recover`] re-reads and re-verifies
//! the file. Callers treat a refused append as "do not mutate the queue".

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::error;
use uuid::Uuid;

/// Stream id for entries that do not belong to an order
/// (certificate uploads, exports).
pub const SYSTEM_STREAM: &str = "compliance";

const ENTRY_ID_NAMESPACE: Uuid = Uuid::from_u128(0x0b6e_51f2_7c3d_4a90_a1e8_33c6_d2f7_9b40);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Created,
    Queued,
    TransmitAttempt,
    Transmitted,
    TransmitFailed,
    CertificateUploaded,
    Exported,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Queued => "queued",
            AuditAction::TransmitAttempt => "transmit-attempt",
            AuditAction::Transmitted => "transmitted",
            AuditAction::TransmitFailed => "transmit-failed",
            AuditAction::CertificateUploaded => "certificate-uploaded",
            AuditAction::Exported => "exported",
        }
    }
}

/// Who caused an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The Orders collaborator (order completion hook).
    Orders,
    /// A manual call from the settings UI / operator.
    Operator,
    /// The background poller.
    Poller,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub seq: u64,
    pub order_id: String,
    pub ts_utc: DateTime<Utc>,
    pub action: AuditAction,
    pub details: Value,
    pub actor: Actor,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

struct LogState {
    path: PathBuf,
    last_hash: Option<String>,
    last_ts: Option<DateTime<Utc>>,
    entries: Vec<AuditEntry>,
    halted: Option<String>,
}

impl LogState {
    fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let content =
                fs::read_to_string(&path).with_context(|| format!("read audit log {:?}", path))?;
            if let VerifyResult::Broken { line, reason } = verify_hash_chain_str(&content)? {
                bail!("AUDIT_CHAIN_BROKEN {:?} line {}: {}", path, line, reason);
            }
            parse_entries(&content)?
        } else {
            Vec::new()
        };

        let last = entries.last();
        Ok(Self {
            last_hash: last.and_then(|e| e.hash_self.clone()),
            last_ts: last.map(|e| e.ts_utc),
            path,
            entries,
            halted: None,
        })
    }
}

/// The shared audit log. Cheap reads, serialized appends.
pub struct AuditLog {
    state: Mutex<LogState>,
}

impl AuditLog {
    /// Open (or create) the log at `path`.
    ///
    /// An existing file is verified first; a broken chain refuses to open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }
        Ok(Self {
            state: Mutex::new(LogState::load(path)?),
        })
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one entry.
    ///
    /// Timestamps are clamped so they never go backwards, even if the wall
    /// clock does.
    pub fn append(
        &self,
        order_id: &str,
        action: AuditAction,
        actor: Actor,
        details: Value,
    ) -> Result<AuditEntry> {
        let mut st = self.state();
        if let Some(reason) = &st.halted {
            bail!("AUDIT_HALTED: {reason}");
        }

        let now = Utc::now();
        let ts_utc = match st.last_ts {
            Some(last) if last > now => last,
            _ => now,
        };
        let seq = st.entries.len() as u64;

        let mut entry = AuditEntry {
            entry_id: derive_entry_id(st.last_hash.as_deref(), order_id, action, seq),
            seq,
            order_id: order_id.to_string(),
            ts_utc,
            action,
            details,
            actor,
            hash_prev: st.last_hash.clone(),
            hash_self: None,
        };
        let self_hash = compute_entry_hash(&entry)?;
        entry.hash_self = Some(self_hash.clone());

        let line = canonical_json_line(&entry)?;
        if let Err(e) = append_line(&st.path, &line) {
            let reason = format!("{e:#}");
            error!(path = ?st.path, %reason, "audit append failed; halting audit log");
            st.halted = Some(reason);
            return Err(e);
        }

        st.last_hash = Some(self_hash);
        st.last_ts = Some(ts_utc);
        st.entries.push(entry.clone());
        Ok(entry)
    }

    /// All entries for one order, in append order.
    pub fn entries_for(&self, order_id: &str) -> Vec<AuditEntry> {
        self.state()
            .entries
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head_hash(&self) -> Option<String> {
        self.state().last_hash.clone()
    }

    pub fn path(&self) -> PathBuf {
        self.state().path.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.state().halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.state().halted.clone()
    }

    /// Re-read the file after a storage failure and resume appending.
    ///
    /// The file must verify and must still contain every entry this process
    /// already acknowledged; otherwise the log stays halted.
    pub fn recover(&self) -> Result<()> {
        let mut st = self.state();
        let reloaded = LogState::load(st.path.clone())?;

        if reloaded.entries.len() < st.entries.len() {
            bail!(
                "AUDIT_TRUNCATED: file has {} entries, {} were acknowledged",
                reloaded.entries.len(),
                st.entries.len()
            );
        }
        if let Some(acked) = st.entries.last() {
            let on_disk = &reloaded.entries[acked.seq as usize];
            if on_disk.hash_self != acked.hash_self {
                return Err(anyhow!(
                    "AUDIT_DIVERGED: entry {} on disk does not match acknowledged entry",
                    acked.seq
                ));
            }
        }

        *st = reloaded;
        Ok(())
    }
}

fn derive_entry_id(prev: Option<&str>, order_id: &str, action: AuditAction, seq: u64) -> Uuid {
    let material = format!(
        "{}|{}|{}|{}",
        seq,
        prev.unwrap_or("GENESIS"),
        order_id,
        action.as_str()
    );
    Uuid::new_v5(&ENTRY_ID_NAMESPACE, material.as_bytes())
}

/// Write a single line (with trailing newline) and flush it to disk.
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    f.write_all(buf.as_bytes())
        .context("write audit line failed")?;
    f.sync_data().context("sync audit log failed")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit entry failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash over the canonical JSON of the entry WITHOUT `hash_self`.
pub fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let mut clone = entry.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn parse_entries(content: &str) -> Result<Vec<AuditEntry>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .with_context(|| format!("parse audit entry at line {}", i + 1))
        })
        .collect()
}

/// Read every entry of an audit log file without opening it for append.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    parse_entries(&content)
}

/// Verify the hash chain of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Same as [`verify_hash_chain`] on in-memory JSONL content.
///
/// Besides the hash links this also checks that `seq` is contiguous and that
/// timestamps never decrease.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut prev_ts: Option<DateTime<Utc>> = None;
    let mut count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let entry: AuditEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit entry at line {}", i + 1))?;

        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }

        match &entry.hash_self {
            Some(claimed) => {
                let recomputed = compute_entry_hash(&entry)?;
                if *claimed != recomputed {
                    return Ok(VerifyResult::Broken {
                        line: i + 1,
                        reason: format!(
                            "hash_self mismatch: claimed {}, recomputed {}",
                            claimed, recomputed
                        ),
                    });
                }
            }
            None => {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: "hash_self missing".to_string(),
                });
            }
        }

        if entry.seq != count as u64 {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("seq gap: expected {}, got {}", count, entry.seq),
            });
        }

        if let Some(p) = prev_ts {
            if entry.ts_utc < p {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("timestamp went backwards: {} < {}", entry.ts_utc, p),
                });
            }
        }

        count += 1;
        prev_hash = entry.hash_self.clone();
        prev_ts = Some(entry.ts_utc);
    }

    Ok(VerifyResult::Valid { lines: count })
}

/// Result of hash chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// The entire chain is valid.
    Valid { lines: usize },
    /// The chain is broken at the given (1-based) line.
    Broken { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_serializes_kebab_case() {
        let v = serde_json::to_value(AuditAction::TransmitFailed).unwrap();
        assert_eq!(v, json!("transmit-failed"));
        assert_eq!(AuditAction::CertificateUploaded.as_str(), "certificate-uploaded");
    }

    #[test]
    fn entry_ids_differ_per_seq() {
        let a = derive_entry_id(None, "o-1", AuditAction::Queued, 0);
        let b = derive_entry_id(None, "o-1", AuditAction::Queued, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn entries_for_filters_by_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl")).unwrap();
        log.append("o-1", AuditAction::Created, Actor::Orders, json!({}))
            .unwrap();
        log.append("o-2", AuditAction::Created, Actor::Orders, json!({}))
            .unwrap();
        log.append("o-1", AuditAction::Queued, Actor::Orders, json!({}))
            .unwrap();

        let o1 = log.entries_for("o-1");
        assert_eq!(o1.len(), 2);
        assert_eq!(o1[0].action, AuditAction::Created);
        assert_eq!(o1[1].action, AuditAction::Queued);
        assert!(o1[0].seq < o1[1].seq);
        assert_eq!(log.len(), 3);
    }
}
