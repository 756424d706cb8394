use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::manifest::{RuntimeManifest, check_origin, verify_tree};
use super::{ClearanceError, ClearanceService, Verdict};
use crate::config::ClearanceConfig;

/// Clearance performed in-process by editing the quarantine attribute.
///
/// Must run with enough privilege to modify the attribute on the target
/// files; a sandboxed host would talk to an equivalent out-of-process
/// helper through the same trait instead.
#[derive(Debug, Clone)]
pub struct XattrClearance {
    attribute: String,
    trusted_hosts: Vec<String>,
    agent: String,
    http: reqwest::Client,
}

impl XattrClearance {
    pub fn new(config: &ClearanceConfig) -> Self {
        Self {
            attribute: config.quarantine_attribute.clone(),
            trusted_hosts: config.trusted_manifest_hosts.clone(),
            agent: config.download_agent.clone(),
            http: reqwest::Client::new(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    async fn fetch_manifest(&self, manifest_url: &str) -> Result<RuntimeManifest, ClearanceError> {
        let url = check_origin(manifest_url, &self.trusted_hosts)?;
        let manifest = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<RuntimeManifest>()
            .await?;
        Ok(manifest)
    }

    fn quarantine_value(&self) -> String {
        // flags;hex-seconds;agent;event-id
        format!(
            "0081;{:08x};{};",
            chrono::Utc::now().timestamp().max(0),
            self.agent
        )
    }
}

#[async_trait]
impl ClearanceService for XattrClearance {
    async fn remove_quarantine_from_file_at(&self, path: &Path) -> Verdict {
        let requested = path.to_path_buf();
        let attribute = self.attribute.clone();
        let result = tokio::task::spawn_blocking(move || {
            let canonical = requested.canonicalize().unwrap_or(requested);
            let removed = remove_attribute(&canonical, &attribute);
            Verdict {
                removed,
                path: canonical,
            }
        })
        .await;

        match result {
            Ok(verdict) => {
                debug!(path = %verdict.path.display(), removed = verdict.removed, "Single-file clearance");
                verdict
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Clearance task failed");
                Verdict {
                    removed: false,
                    path: path.to_path_buf(),
                }
            }
        }
    }

    async fn remove_quarantine_recursively_from_java_install_at(
        &self,
        path: &Path,
        manifest_url: &str,
    ) -> bool {
        let manifest = match self.fetch_manifest(manifest_url).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(url = manifest_url, error = %e, "Refusing runtime clearance");
                return false;
            }
        };

        let root = path.to_path_buf();
        let attribute = self.attribute.clone();
        let result =
            tokio::task::spawn_blocking(move || clear_verified_tree(&root, &manifest, &attribute))
                .await;

        match result {
            Ok(Ok(cleared)) => {
                info!(path = %path.display(), cleared, "Runtime quarantine removed");
                true
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "Runtime verification failed, nothing cleared");
                false
            }
            Err(e) => {
                warn!(error = %e, "Runtime clearance task failed");
                false
            }
        }
    }

    async fn apply_download_quarantine_recursively_to_java_install_at(&self, path: &Path) -> bool {
        let root = path.to_path_buf();
        let attribute = self.attribute.clone();
        let value = self.quarantine_value();

        let result = tokio::task::spawn_blocking(move || {
            walk(&root)
                .iter()
                .all(|item| match xattr::set(item, &attribute, value.as_bytes()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(path = %item.display(), error = %e, "Failed to apply quarantine");
                        false
                    }
                })
        })
        .await;

        result.unwrap_or(false)
    }

    async fn retrieve_unsandboxed_user_temporary_directory(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

/// Verify the whole tree first; touch attributes only if every item passed.
/// Returns how many items actually carried the attribute.
fn clear_verified_tree(
    root: &Path,
    manifest: &RuntimeManifest,
    attribute: &str,
) -> Result<usize, ClearanceError> {
    let verified = verify_tree(root, manifest)?;
    Ok(verified
        .iter()
        .filter(|item| remove_attribute(item, attribute))
        .count())
}

/// True only when the attribute was present and is now gone.
fn remove_attribute(path: &Path, attribute: &str) -> bool {
    match xattr::get(path, attribute) {
        Ok(Some(_)) => match xattr::remove(path, attribute) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove quarantine");
                false
            }
        },
        Ok(None) => false,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Quarantine attribute unreadable");
            false
        }
    }
}

/// Every item under `root`, root first. Symlinks are not followed.
fn walk(root: &Path) -> Vec<PathBuf> {
    let mut items = vec![root.to_path_buf()];
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(path.clone());
            }
            items.push(path);
        }
    }
    items
}
