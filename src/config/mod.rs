use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::{ENDPOINT_NAMES, Transport};
use crate::paths::Paths;
use crate::shim::DEFAULT_SYSTEM_PREFIXES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub clearance: ClearanceConfig,

    #[serde(default)]
    pub exceptions: ExceptionsConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Directory for listening sockets. Default: runtime dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_dir: Option<String>,

    /// How many of the names "0".."9" to try (max 10)
    #[serde(default = "default_endpoint_count")]
    pub endpoint_count: usize,

    #[serde(default)]
    pub transport: Transport,

    /// Shim-side bounded wait for a verdict
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Broker-side wait for a connected peer's request
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Libraries under these prefixes are never forwarded
    #[serde(default = "default_system_prefixes")]
    pub system_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearanceConfig {
    #[serde(default = "default_quarantine_attribute")]
    pub quarantine_attribute: String,

    /// Hosts allowed to serve Java runtime manifests (https only)
    #[serde(default = "default_trusted_manifest_hosts")]
    pub trusted_manifest_hosts: Vec<String>,

    /// Agent name written into applied download quarantine
    #[serde(default = "default_download_agent")]
    pub download_agent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionsConfig {
    /// Where granted directories are persisted. Default: state dir settings.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_endpoint_count() -> usize {
    ENDPOINT_NAMES.len()
}
fn default_request_timeout() -> u64 {
    2000
}
fn default_read_timeout() -> u64 {
    2000
}
fn default_system_prefixes() -> Vec<String> {
    DEFAULT_SYSTEM_PREFIXES.iter().map(|p| p.to_string()).collect()
}
#[cfg(target_os = "macos")]
fn default_quarantine_attribute() -> String {
    "com.apple.quarantine".into()
}
// Only the user namespace is writable by unprivileged processes here.
#[cfg(not(target_os = "macos"))]
fn default_quarantine_attribute() -> String {
    "user.com.apple.quarantine".into()
}
fn default_trusted_manifest_hosts() -> Vec<String> {
    vec!["piston-meta.mojang.com".into()]
}
fn default_download_agent() -> String {
    "sandbridge".into()
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint_dir: None,
            endpoint_count: default_endpoint_count(),
            transport: Transport::default(),
            request_timeout_ms: default_request_timeout(),
            read_timeout_ms: default_read_timeout(),
            system_prefixes: default_system_prefixes(),
        }
    }
}

impl Default for ClearanceConfig {
    fn default() -> Self {
        Self {
            quarantine_attribute: default_quarantine_attribute(),
            trusted_manifest_hosts: default_trusted_manifest_hosts(),
            download_agent: default_download_agent(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_with_paths(Paths::resolve()?)
    }

    pub fn load_with_paths(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Every key `get_value` and `set_value` accept, in file order.
    pub const KEYS: &'static [&'static str] = &[
        "bridge.endpoint_dir",
        "bridge.endpoint_count",
        "bridge.transport",
        "bridge.request_timeout_ms",
        "bridge.read_timeout_ms",
        "bridge.system_prefixes",
        "clearance.quarantine_attribute",
        "clearance.trusted_manifest_hosts",
        "clearance.download_agent",
        "exceptions.settings_file",
        "audit.enabled",
        "logging.level",
    ];

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["bridge", "endpoint_dir"] => Ok(self.endpoint_dir().display().to_string()),
            ["bridge", "endpoint_count"] => Ok(self.bridge.endpoint_count.to_string()),
            ["bridge", "transport"] => Ok(transport_name(self.bridge.transport).to_string()),
            ["bridge", "request_timeout_ms"] => Ok(self.bridge.request_timeout_ms.to_string()),
            ["bridge", "read_timeout_ms"] => Ok(self.bridge.read_timeout_ms.to_string()),
            ["bridge", "system_prefixes"] => Ok(self.bridge.system_prefixes.join(":")),
            ["clearance", "quarantine_attribute"] => Ok(self.clearance.quarantine_attribute.clone()),
            ["clearance", "trusted_manifest_hosts"] => {
                Ok(self.clearance.trusted_manifest_hosts.join(","))
            }
            ["clearance", "download_agent"] => Ok(self.clearance.download_agent.clone()),
            ["exceptions", "settings_file"] => Ok(self.settings_file().display().to_string()),
            ["audit", "enabled"] => Ok(self.audit.enabled.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["bridge", "endpoint_dir"] => self.bridge.endpoint_dir = Some(value.to_string()),
            ["bridge", "endpoint_count"] => {
                let count: usize = value.parse()?;
                if count == 0 || count > ENDPOINT_NAMES.len() {
                    anyhow::bail!("bridge.endpoint_count must be 1..={}", ENDPOINT_NAMES.len());
                }
                self.bridge.endpoint_count = count;
            }
            ["bridge", "transport"] => {
                self.bridge.transport = match value {
                    "listening" => Transport::Listening,
                    "paired" => Transport::Paired,
                    other => anyhow::bail!("Unknown transport: {} (listening | paired)", other),
                }
            }
            ["bridge", "request_timeout_ms"] => self.bridge.request_timeout_ms = value.parse()?,
            ["bridge", "read_timeout_ms"] => self.bridge.read_timeout_ms = value.parse()?,
            ["bridge", "system_prefixes"] => {
                self.bridge.system_prefixes = split_list(value, ':');
            }
            ["clearance", "quarantine_attribute"] => {
                self.clearance.quarantine_attribute = value.to_string()
            }
            ["clearance", "trusted_manifest_hosts"] => {
                self.clearance.trusted_manifest_hosts = split_list(value, ',');
            }
            ["clearance", "download_agent"] => self.clearance.download_agent = value.to_string(),
            ["exceptions", "settings_file"] => {
                self.exceptions.settings_file = Some(value.to_string())
            }
            ["audit", "enabled"] => self.audit.enabled = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// Directory for listening sockets, config override first.
    pub fn endpoint_dir(&self) -> PathBuf {
        self.bridge
            .endpoint_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| self.paths.endpoint_dir())
    }

    /// Names to try when binding, in order.
    pub fn endpoint_names(&self) -> &'static [&'static str] {
        let count = self.bridge.endpoint_count.clamp(1, ENDPOINT_NAMES.len());
        &ENDPOINT_NAMES[..count]
    }

    pub fn settings_file(&self) -> PathBuf {
        self.exceptions
            .settings_file
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| self.paths.settings_file())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.request_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.read_timeout_ms)
    }
}

fn transport_name(transport: Transport) -> &'static str {
    match transport {
        Transport::Listening => "listening",
        Transport::Paired => "paired",
    }
}

fn split_list(value: &str, sep: char) -> Vec<String> {
    value
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn expand_path(value: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(value).to_string())
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# sandbridge configuration
# Auto-created on first run. Edit as needed.

[bridge]
# listening: named socket under endpoint_dir, one connection per library load
# paired: socket pair inherited by the child as a descriptor
transport = "listening"
# endpoint_dir = "/run/user/1000/sandbridge/bridge"   # default: runtime dir
endpoint_count = 10
request_timeout_ms = 2000
read_timeout_ms = 2000
system_prefixes = ["/System", "/Library", "/usr"]

[clearance]
# quarantine_attribute = "com.apple.quarantine"
trusted_manifest_hosts = ["piston-meta.mojang.com"]
download_agent = "sandbridge"

[exceptions]
# settings_file = "~/.local/state/sandbridge/settings.json"

[audit]
enabled = true

[logging]
level = "info"
"#;
