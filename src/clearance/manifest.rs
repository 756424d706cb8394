use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::ClearanceError;

/// Java runtime manifest as served by the runtime distribution host.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeManifest {
    pub files: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ManifestEntry {
    File {
        downloads: Downloads,
        #[serde(default)]
        executable: bool,
    },
    Directory,
    Link {
        target: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Downloads {
    pub raw: Download,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Download {
    pub sha1: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Accept only https manifests served from one of `trusted_hosts`.
pub fn check_origin(url: &str, trusted_hosts: &[String]) -> Result<reqwest::Url, ClearanceError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| ClearanceError::UntrustedOrigin(url.to_string()))?;

    let trusted = parsed.scheme() == "https"
        && parsed
            .host_str()
            .is_some_and(|host| trusted_hosts.iter().any(|t| t.eq_ignore_ascii_case(host)));

    if trusted {
        Ok(parsed)
    } else {
        Err(ClearanceError::UntrustedOrigin(url.to_string()))
    }
}

/// Check every item under `root` against `manifest`.
///
/// Regular files must be listed as files with a matching SHA-1, symlinks as
/// links and directories as directories. Returns every verified item (root
/// included) so the caller can clear them in one pass once nothing failed.
pub fn verify_tree(root: &Path, manifest: &RuntimeManifest) -> Result<Vec<PathBuf>, ClearanceError> {
    let mut verified = vec![root.to_path_buf()];
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| ClearanceError::Io {
            path: dir.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| ClearanceError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let meta = fs::symlink_metadata(&path).map_err(|source| ClearanceError::Io {
                path: path.clone(),
                source,
            })?;

            let key = manifest_key(root, &path);
            let listed = manifest
                .files
                .get(&key)
                .ok_or_else(|| ClearanceError::Unlisted(path.clone()))?;

            let file_type = meta.file_type();
            match listed {
                ManifestEntry::Directory if file_type.is_dir() => pending.push(path.clone()),
                ManifestEntry::Link { .. } if file_type.is_symlink() => {}
                ManifestEntry::File { downloads, .. } if file_type.is_file() => {
                    let actual = file_sha1(&path)?;
                    if !actual.eq_ignore_ascii_case(&downloads.raw.sha1) {
                        return Err(ClearanceError::ChecksumMismatch(path));
                    }
                }
                other => {
                    return Err(ClearanceError::TypeMismatch {
                        path,
                        expected: entry_kind(other),
                    });
                }
            }
            verified.push(path);
        }
    }

    Ok(verified)
}

fn manifest_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_kind(entry: &ManifestEntry) -> &'static str {
    match entry {
        ManifestEntry::File { .. } => "file",
        ManifestEntry::Directory => "directory",
        ManifestEntry::Link { .. } => "link",
    }
}

fn file_sha1(path: &Path) -> Result<String, ClearanceError> {
    let io_err = |source| ClearanceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha1::new();
    io::copy(&mut file, &mut hasher).map_err(io_err)?;
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}
