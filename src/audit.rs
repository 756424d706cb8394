//! Append-only, hash-chained audit log of clearance and grant decisions.
//!
//! Stored as `sandbridge.audit.jsonl` in the state directory. Each entry
//! carries the SHA-256 of the previous line, so editing or deleting a
//! line breaks the chain.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `cleared`, `not_cleared`, `transport_error`, `exception_added`, ... |
//! | `subject` | Path the action concerns (empty when none) |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//! | `source` | `broker`, `cli`, `session` or `audit_system` |
//!
//! The first entry links to 64 zeros.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const AUDIT_FILENAME: &str = "sandbridge.audit.jsonl";

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    #[serde(default)]
    pub subject: String,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Clearance service removed quarantine.
    Cleared,
    /// Clearance service reported nothing removed.
    NotCleared,
    /// A bridge connection failed before a verdict was written.
    TransportError,
    ExceptionAdded,
    ExceptionRemoved,
    /// Runtime tree verified and cleared.
    RuntimeCleared,
    /// Runtime tree refused (origin, checksum or I/O).
    RuntimeRefused,
    DownloadQuarantineApplied,
    /// Previous entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Handle on one audit log file. Appends from one process are serialized
/// by an in-process mutex and across processes by an advisory lock.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    gate: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gate: Mutex::new(()),
        }
    }

    /// Log at the standard file name inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(AUDIT_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, action: AuditAction, subject: &Path, source: &str) -> Result<()> {
        self.append_with_detail(action, subject, source, None)
    }

    /// Append one entry, inserting a `chain_recovery` entry first when the
    /// current last line is not valid JSON.
    pub fn append_with_detail(
        &self,
        action: AuditAction,
        subject: &Path,
        source: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open audit log")?;
        file.lock_exclusive().context("Failed to lock audit log")?;

        let result = (|| -> Result<()> {
            let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
            let prev_hash = match content.lines().last() {
                Some(last) if !last.is_empty() => {
                    if serde_json::from_str::<AuditEntry>(last).is_ok() {
                        sha256_hex(last.as_bytes())
                    } else {
                        let recovery = AuditEntry {
                            ts: chrono::Utc::now().to_rfc3339(),
                            action: AuditAction::ChainRecovery,
                            subject: String::new(),
                            prev_entry_sha256: sha256_hex(last.as_bytes()),
                            source: "audit_system".to_string(),
                            detail: Some(format!(
                                "Previous entry corrupted ({} bytes), new chain segment",
                                last.len()
                            )),
                        };
                        let json = serde_json::to_string(&recovery)
                            .context("Failed to serialize recovery entry")?;
                        writeln!(file, "{}", json).context("Failed to write audit entry")?;
                        sha256_hex(json.as_bytes())
                    }
                }
                _ => GENESIS_HASH.to_string(),
            };

            let entry = AuditEntry {
                ts: chrono::Utc::now().to_rfc3339(),
                action,
                subject: subject.to_string_lossy().into_owned(),
                prev_entry_sha256: prev_hash,
                source: source.to_string(),
                detail: detail.map(str::to_string),
            };
            let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
            writeln!(file, "{}", json).context("Failed to write audit entry")?;
            Ok(())
        })();

        let _ = FileExt::unlock(&file);
        result
    }

    /// All parseable entries; corrupted lines are skipped.
    pub fn read(&self) -> Result<Vec<AuditEntry>> {
        let Some(content) = self.read_content()? else {
            return Ok(Vec::new());
        };
        Ok(content
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Indices of lines whose chain link is broken. Empty means intact.
    pub fn verify(&self) -> Result<Vec<usize>> {
        let Some(content) = self.read_content()? else {
            return Ok(Vec::new());
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let mut broken = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
                broken.push(i);
                continue;
            };
            let expected = match i {
                0 => GENESIS_HASH.to_string(),
                _ => sha256_hex(lines[i - 1].as_bytes()),
            };
            if entry.prev_entry_sha256 != expected {
                broken.push(i);
            }
        }
        Ok(broken)
    }

    fn read_content(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read audit log"),
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
