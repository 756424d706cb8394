//! Device key used to authenticate capability tokens.
//!
//! 32 random bytes from the OS CSPRNG, stored with 0600 permissions in the
//! data directory. A token minted under one device key never resolves
//! under another, so copying the settings file to a different machine does
//! not carry grants with it.

use anyhow::{Context, Result};
use rand::RngExt;
use std::fs;
use std::path::Path;

pub const DEVICE_KEY_FILENAME: &str = "sandbridge.device.key";
pub const DEVICE_KEY_LEN: usize = 32;

pub type DeviceKey = [u8; DEVICE_KEY_LEN];

/// Create the device key if it does not exist yet.
pub fn ensure_device_key(data_dir: &Path) -> Result<()> {
    let key_path = data_dir.join(DEVICE_KEY_FILENAME);
    if key_path.exists() {
        return Ok(());
    }

    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let mut key = [0u8; DEVICE_KEY_LEN];
    rand::rng().fill(&mut key);

    fs::write(&key_path, key).context("Failed to write device key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set device key permissions")?;
    }

    tracing::info!("Generated device key at {}", key_path.display());
    Ok(())
}

pub fn read_device_key(data_dir: &Path) -> Result<DeviceKey> {
    let key_path = data_dir.join(DEVICE_KEY_FILENAME);
    let bytes = fs::read(&key_path)
        .with_context(|| format!("Failed to read device key at {}", key_path.display()))?;

    if bytes.len() != DEVICE_KEY_LEN {
        anyhow::bail!(
            "Device key has unexpected length {} (expected {})",
            bytes.len(),
            DEVICE_KEY_LEN
        );
    }

    let mut key = [0u8; DEVICE_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Ensure, then read.
pub fn load_or_create(data_dir: &Path) -> Result<DeviceKey> {
    ensure_device_key(data_dir)?;
    read_device_key(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_created_once() {
        let tmp = tempfile::tempdir().unwrap();
        let first = load_or_create(tmp.path()).unwrap();
        let second = load_or_create(tmp.path()).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        ensure_device_key(tmp.path()).unwrap();
        let mode = fs::metadata(tmp.path().join(DEVICE_KEY_FILENAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(DEVICE_KEY_FILENAME), b"short").unwrap();
        assert!(read_device_key(tmp.path()).is_err());
    }
}
