//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. sandbridge-specific env var (SANDBRIDGE_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per the XDG Base Directory rules.

use anyhow::{Context, Result};
use libc::getuid;
use std::path::{Path, PathBuf};

use crate::audit::AUDIT_FILENAME;
use crate::capability::key::DEVICE_KEY_FILENAME;

/// Overrides the location of the preload library.
pub const SHIM_LIBRARY_ENV: &str = "SANDBRIDGE_SHIM_LIBRARY";

#[cfg(target_os = "macos")]
pub const SHIM_FILENAME: &str = "libsandbridge_shim.dylib";
#[cfg(not(target_os = "macos"))]
pub const SHIM_FILENAME: &str = "libsandbridge_shim.so";

/// Resolved directory paths, created once at startup and threaded
/// through Config.
#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    /// Device key
    pub data_dir: PathBuf,

    /// Settings (persisted grants) and audit log
    pub state_dir: PathBuf,

    /// Bridge sockets. None if no suitable runtime directory is available.
    pub runtime_dir: Option<PathBuf>,

    /// Preload library injected into the child
    pub shim_library: PathBuf,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "SANDBRIDGE_CONFIG_DIR", || {
            strategy.config_dir().join("sandbridge")
        });

        let data_dir = env_or(&env_fn, "SANDBRIDGE_DATA_DIR", || {
            strategy.data_dir().join("sandbridge")
        });

        let state_dir = env_or(&env_fn, "SANDBRIDGE_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("sandbridge")
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        let shim_library = env_or(&env_fn, SHIM_LIBRARY_ENV, || {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(SHIM_FILENAME)))
                .unwrap_or_else(|| PathBuf::from(SHIM_FILENAME))
        });

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
            runtime_dir,
            shim_library,
        })
    }

    /// config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// data_dir/sandbridge.device.key
    pub fn device_key(&self) -> PathBuf {
        self.data_dir.join(DEVICE_KEY_FILENAME)
    }

    /// state_dir/sandbridge.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join(AUDIT_FILENAME)
    }

    /// state_dir/settings.json
    pub fn settings_file(&self) -> PathBuf {
        self.state_dir.join("settings.json")
    }

    /// Directory holding the listening bridge sockets (runtime_dir, falls
    /// back to state_dir).
    pub fn endpoint_dir(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .unwrap_or(&self.state_dir)
            .join("bridge")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("sandbridge"),
                data_dir: home.join(".local").join("share").join("sandbridge"),
                state_dir: home.join(".local").join("state").join("sandbridge"),
                runtime_dir: None,
                shim_library: PathBuf::from(SHIM_FILENAME),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per the XDG Base Directory rules.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(shellexpand::tilde(&v).to_string()))
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join("sandbridge"));
        }
    }

    // $TMPDIR/sandbridge-$UID
    // SAFETY: getuid has no preconditions.
    let uid = unsafe { getuid() };
    let tmpdir = env_fn("TMPDIR")
        .ok()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "/tmp".to_string());
    Some(PathBuf::from(tmpdir).join(format!("sandbridge-{}", uid)))
}

/// Create a directory with mode 0700 per the XDG Base Directory rules.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

    Ok(())
}
