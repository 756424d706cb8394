use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use rand::RngExt;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::key::DeviceKey;
use super::{AccessMode, CapabilityError, CapabilityProvider, Resolution};

type HmacSha256 = Hmac<Sha256>;

const ENVELOPE_VERSION: u8 = 1;

/// Token body. `mac` seals every other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    mode: AccessMode,
    path: PathBuf,
    dev: u64,
    ino: u64,
    /// Distinguishes tokens minted for the same location.
    nonce: String,
    mac: String,
}

impl Envelope {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(32 + self.path.as_os_str().len());
        msg.push(self.v);
        msg.extend_from_slice(self.mode.as_str().as_bytes());
        msg.push(0);
        msg.extend_from_slice(&self.dev.to_le_bytes());
        msg.extend_from_slice(&self.ino.to_le_bytes());
        msg.extend_from_slice(self.nonce.as_bytes());
        msg.push(0);
        msg.extend_from_slice(self.path.as_os_str().as_bytes());
        msg
    }
}

/// HMAC-sealed path tokens with inode-based staleness.
///
/// A token goes stale when the directory it names was replaced (same path,
/// new file identity) or when the recorded path now canonicalises
/// elsewhere. A token whose path no longer exists cannot be resolved.
///
/// Revocation is held in memory by this provider only.
pub struct SignedBookmarks {
    key: DeviceKey,
    mode: AccessMode,
    active: Mutex<BTreeSet<PathBuf>>,
    revoked: Mutex<HashSet<String>>,
}

impl SignedBookmarks {
    pub fn new(key: DeviceKey, mode: AccessMode) -> Self {
        Self {
            key,
            mode,
            active: Mutex::new(BTreeSet::new()),
            revoked: Mutex::new(HashSet::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn revoked(&self) -> MutexGuard<'_, HashSet<String>> {
        self.revoked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mac(&self, envelope: &Envelope) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(&envelope.signed_bytes());
        mac
    }

    fn open(&self, opaque: &[u8]) -> Result<Envelope, CapabilityError> {
        let envelope: Envelope = serde_json::from_slice(opaque)?;
        let tag = STANDARD
            .decode(&envelope.mac)
            .map_err(|_| CapabilityError::Forged)?;
        if envelope.v != ENVELOPE_VERSION || self.mac(&envelope).verify_slice(&tag).is_err() {
            return Err(CapabilityError::Forged);
        }
        if self.revoked().contains(&envelope.nonce) {
            return Err(CapabilityError::Revoked);
        }
        if envelope.mode != self.mode {
            return Err(CapabilityError::ModeMismatch {
                expected: self.mode,
                found: envelope.mode,
            });
        }
        Ok(envelope)
    }

    fn release(&self, envelope: &Envelope) {
        let mut active = self.active();
        active.remove(&envelope.path);
        if let Ok(canonical) = envelope.path.canonicalize() {
            active.remove(&canonical);
        }
        debug!(path = %envelope.path.display(), mode = %self.mode, "Access stopped");
    }

    fn seal(&self, path: PathBuf, meta: &fs::Metadata) -> Result<Vec<u8>, CapabilityError> {
        let mut nonce = [0u8; 16];
        rand::rng().fill(&mut nonce);
        let mut envelope = Envelope {
            v: ENVELOPE_VERSION,
            mode: self.mode,
            path,
            dev: meta.dev(),
            ino: meta.ino(),
            nonce: STANDARD.encode(nonce),
            mac: String::new(),
        };
        envelope.mac = STANDARD.encode(self.mac(&envelope).finalize().into_bytes());
        Ok(serde_json::to_vec(&envelope)?)
    }
}

fn canonical_with_meta(path: &Path) -> Result<(PathBuf, fs::Metadata), CapabilityError> {
    let unresolvable = |source| CapabilityError::Unresolvable {
        path: path.to_path_buf(),
        source,
    };
    let canonical = path.canonicalize().map_err(unresolvable)?;
    let meta = fs::metadata(&canonical).map_err(unresolvable)?;
    Ok((canonical, meta))
}

impl CapabilityProvider for SignedBookmarks {
    fn mode(&self) -> AccessMode {
        self.mode
    }

    fn mint(&self, path: &Path) -> Result<Vec<u8>, CapabilityError> {
        let (canonical, meta) = canonical_with_meta(path)?;
        self.seal(canonical, &meta)
    }

    fn resolve(&self, opaque: &[u8]) -> Result<Resolution, CapabilityError> {
        let envelope = self.open(opaque)?;
        let (canonical, meta) = canonical_with_meta(&envelope.path)?;

        let stale = canonical != envelope.path
            || meta.dev() != envelope.dev
            || meta.ino() != envelope.ino;
        let refreshed = if stale {
            debug!(path = %canonical.display(), mode = %self.mode, "Capability token is stale");
            Some(self.seal(canonical.clone(), &meta)?)
        } else {
            None
        };

        Ok(Resolution {
            path: canonical,
            stale,
            refreshed,
        })
    }

    fn start_access(&self, opaque: &[u8]) -> Result<Resolution, CapabilityError> {
        let resolution = self.resolve(opaque)?;
        if self.active().insert(resolution.path.clone()) {
            debug!(path = %resolution.path.display(), mode = %self.mode, "Access started");
        }
        Ok(resolution)
    }

    fn stop_access(&self, opaque: &[u8]) -> Result<(), CapabilityError> {
        let envelope = self.open(opaque)?;
        self.release(&envelope);
        Ok(())
    }

    fn revoke(&self, opaque: &[u8]) -> Result<(), CapabilityError> {
        let envelope = self.open(opaque)?;
        self.release(&envelope);
        self.revoked().insert(envelope.nonce);
        debug!(path = %envelope.path.display(), mode = %self.mode, "Token revoked");
        Ok(())
    }

    fn is_accessing(&self, path: &Path) -> bool {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.active().contains(&canonical)
    }

    fn active_paths(&self) -> Vec<PathBuf> {
        self.active().iter().cloned().collect()
    }
}
