//! Quarantine clearance service.
//!
//! [`ClearanceService`] is the interface the host consumes: it is the only
//! component allowed to mutate quarantine attributes on behalf of the
//! sandboxed child. Replies carry no error channel; a denial or a failure
//! is simply `false`, which does not imply the file is quarantined.
//!
//! [`XattrClearance`] is the local implementation used by the CLI. It
//! edits the quarantine extended attribute directly and refuses to touch
//! a Java runtime until every file under it matches a manifest fetched
//! from a trusted host.

mod manifest;
mod xattr_service;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use manifest::{ManifestEntry, RuntimeManifest, verify_tree};
pub use xattr_service::XattrClearance;

/// Reply to a single-file clearance request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether quarantine was removed by this call.
    pub removed: bool,
    /// The item the service acted on, possibly canonicalised.
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ClearanceError {
    #[error("manifest URL {0:?} is not an https URL on a trusted host")]
    UntrustedOrigin(String),

    #[error("failed to fetch manifest: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("{} is not listed in the manifest", .0.display())]
    Unlisted(PathBuf),

    #[error("checksum mismatch for {}", .0.display())]
    ChecksumMismatch(PathBuf),

    #[error("{} has unexpected type (manifest says {expected})", path.display())]
    TypeMismatch { path: PathBuf, expected: &'static str },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClearanceService: Send + Sync {
    /// Remove quarantine from a single file.
    async fn remove_quarantine_from_file_at(&self, path: &Path) -> Verdict;

    /// Remove quarantine from a Java runtime directory after verifying every
    /// file against the manifest it was downloaded from. No attribute is
    /// touched unless the whole tree verifies.
    async fn remove_quarantine_recursively_from_java_install_at(
        &self,
        path: &Path,
        manifest_url: &str,
    ) -> bool;

    /// Mark every file under `path` as downloaded from the Internet.
    async fn apply_download_quarantine_recursively_to_java_install_at(&self, path: &Path) -> bool;

    /// Temporary directory as seen by an unsandboxed process.
    async fn retrieve_unsandboxed_user_temporary_directory(&self) -> PathBuf;
}
