//! Persisted settings: ordered lists of opaque byte sequences per key.
//!
//! On disk this is a small JSON object mapping each key to a list of
//! base64 strings:
//!
//! ```json
//! { "read_write_exceptions": ["eyJ2Ijox..."], "read_only_exceptions": [] }
//! ```
//!
//! Every access takes an advisory lock on a sidecar `.lock` file and writes
//! replace the document atomically (temp file + rename). Read-modify-write
//! callers go through [`SettingsStore::update_list`], which keeps the lock
//! for the whole cycle, so a host and a CLI invocation editing the same list
//! both see each other's entries.

use base64::{Engine, engine::general_purpose::STANDARD};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("settings file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("settings key {key} holds an entry that is not base64")]
    Encoding { key: String },
}

/// Key/value collaborator holding ordered byte-sequence lists.
pub trait SettingsStore: Send + Sync {
    /// Missing keys read as an empty list.
    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, SettingsError>;

    fn set_list(&self, key: &str, values: &[Vec<u8>]) -> Result<(), SettingsError>;

    /// Read `key`, hand the list to `edit` and write it back when `edit`
    /// returns `true`. No other writer can touch the key in between.
    fn update_list(
        &self,
        key: &str,
        edit: &mut dyn FnMut(&mut Vec<Vec<u8>>) -> bool,
    ) -> Result<(), SettingsError>;
}

type Document = BTreeMap<String, Vec<String>>;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON-file backed settings.
#[derive(Debug, Clone)]
pub struct JsonSettings {
    path: PathBuf,
}

impl JsonSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self) -> impl Fn(io::Error) -> SettingsError + '_ {
        move |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn lock(&self) -> Result<File, SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(self.io_err())?;
        }
        let file = File::create(self.path.with_extension("lock")).map_err(self.io_err())?;
        file.lock_exclusive().map_err(self.io_err())?;
        Ok(file)
    }

    fn read_document(&self) -> Result<Document, SettingsError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(self.io_err()(e)),
        };
        if content.trim().is_empty() {
            return Ok(Document::new());
        }
        serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_document(&self, doc: &Document) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(doc).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp_path, content).map_err(self.io_err())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
                .map_err(self.io_err())?;
        }
        fs::rename(&tmp_path, &self.path).map_err(self.io_err())?;
        Ok(())
    }
}

impl SettingsStore for JsonSettings {
    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, SettingsError> {
        let _guard = Unlock(self.lock()?);
        decode_list(&self.read_document()?, key)
    }

    fn set_list(&self, key: &str, values: &[Vec<u8>]) -> Result<(), SettingsError> {
        self.update_list(key, &mut |list| {
            *list = values.to_vec();
            true
        })
    }

    fn update_list(
        &self,
        key: &str,
        edit: &mut dyn FnMut(&mut Vec<Vec<u8>>) -> bool,
    ) -> Result<(), SettingsError> {
        let _guard = Unlock(self.lock()?);
        let mut doc = self.read_document()?;
        let mut values = decode_list(&doc, key)?;
        if !edit(&mut values) {
            return Ok(());
        }

        doc.insert(
            key.to_string(),
            values.iter().map(|v| STANDARD.encode(v)).collect(),
        );
        self.write_document(&doc)?;
        debug!(key, entries = values.len(), path = %self.path.display(), "Saved settings list");
        Ok(())
    }
}

fn decode_list(doc: &Document, key: &str) -> Result<Vec<Vec<u8>>, SettingsError> {
    let Some(values) = doc.get(key) else {
        return Ok(Vec::new());
    };
    values
        .iter()
        .map(|v| {
            STANDARD.decode(v).map_err(|_| SettingsError::Encoding {
                key: key.to_string(),
            })
        })
        .collect()
}

/// Releases the advisory lock on drop.
struct Unlock(File);

impl Drop for Unlock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// In-process settings, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySettings {
    lists: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    writes: AtomicU64,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lists written so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettings {
    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, SettingsError> {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(lists.get(key).cloned().unwrap_or_default())
    }

    fn set_list(&self, key: &str, values: &[Vec<u8>]) -> Result<(), SettingsError> {
        self.update_list(key, &mut |list| {
            *list = values.to_vec();
            true
        })
    }

    fn update_list(
        &self,
        key: &str,
        edit: &mut dyn FnMut(&mut Vec<Vec<u8>>) -> bool,
    ) -> Result<(), SettingsError> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = lists.get(key).cloned().unwrap_or_default();
        if edit(&mut values) {
            lists.insert(key.to_string(), values);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
