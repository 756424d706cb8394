//! Persistable capability tokens for user-granted directories.
//!
//! A token is an opaque byte sequence that grants access to one filesystem
//! location. Tokens survive restarts through the settings store and must be
//! activated again each session. Resolution may find a token *stale* (the
//! location changed underneath it); the provider then hands back refreshed
//! opaque data and callers must persist it in place of the old token.
//!
//! [`SignedBookmarks`] is the provider used on every platform: a small
//! envelope recording the canonical path and its file identity, sealed
//! with HMAC-SHA256 under the device key.

pub mod key;
mod signed;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use signed::SignedBookmarks;

/// Which of the two grant lists a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub const ALL: [AccessMode; 2] = [AccessMode::ReadWrite, AccessMode::ReadOnly];

    /// Settings key holding this mode's ordered token list.
    pub fn settings_key(self) -> &'static str {
        match self {
            Self::ReadWrite => "read_write_exceptions",
            Self::ReadOnly => "read_only_exceptions",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub stale: bool,
    /// Replacement opaque data, present whenever `stale` is set.
    pub refreshed: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability token is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("capability token failed authentication")]
    Forged,

    #[error("capability token is for {found} access, expected {expected}")]
    ModeMismatch {
        expected: AccessMode,
        found: AccessMode,
    },

    #[error("capability token was revoked")]
    Revoked,

    #[error("{} cannot be resolved: {source}", path.display())]
    Unresolvable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// OS capability layer as seen by the exception store.
pub trait CapabilityProvider: Send + Sync {
    fn mode(&self) -> AccessMode;

    /// Create a token for `path`. The path must currently be reachable.
    fn mint(&self, path: &Path) -> Result<Vec<u8>, CapabilityError>;

    /// Resolve a token to its current location without activating it.
    fn resolve(&self, opaque: &[u8]) -> Result<Resolution, CapabilityError>;

    /// Resolve and activate. Activating an already active location is a
    /// no-op; one [`stop_access`](Self::stop_access) releases it.
    fn start_access(&self, opaque: &[u8]) -> Result<Resolution, CapabilityError>;

    /// Release the grant held for the token's location.
    fn stop_access(&self, opaque: &[u8]) -> Result<(), CapabilityError>;

    /// Release the grant and reject the token from now on. Tokens minted
    /// later for the same location are unaffected.
    fn revoke(&self, opaque: &[u8]) -> Result<(), CapabilityError>;

    fn is_accessing(&self, path: &Path) -> bool;

    fn active_paths(&self) -> Vec<PathBuf>;
}
