//! One sandboxed game session.
//!
//! [`SessionContext`] is built once by `launch` and owns every long-lived
//! component: the exception store, the bridge broker and the audit log.
//! Components receive what they need from it by reference; nothing is
//! looked up globally.
//!
//! Lifecycle: [`SessionContext::open`] → [`SessionContext::start`]
//! (activate grants, start the bridge) → [`SessionContext::run_child`] →
//! [`SessionContext::teardown`].

use anyhow::{Context, Result, bail};
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::bridge::{BridgeBroker, BrokerOptions, ChannelAddress, SOCKET_ENV, TIMEOUT_ENV, Transport};
use crate::capability::key;
use crate::clearance::ClearanceService;
use crate::config::Config;
use crate::exceptions::AccessExceptionStore;
use crate::settings::JsonSettings;
use crate::shim::PREFIXES_ENV;

#[cfg(target_os = "macos")]
const PRELOAD_ENV: &str = "DYLD_INSERT_LIBRARIES";
#[cfg(not(target_os = "macos"))]
const PRELOAD_ENV: &str = "LD_PRELOAD";

/// What the child needs to reach the broker.
#[derive(Debug)]
pub struct BridgeHandoff {
    pub address: ChannelAddress,
    /// Child half of a paired channel; dropped by the host after spawn.
    pub inherited: Option<OwnedFd>,
}

pub struct SessionContext {
    config: Config,
    exceptions: Arc<AccessExceptionStore>,
    audit: Option<Arc<AuditLog>>,
    broker: BridgeBroker,
}

impl SessionContext {
    /// Open the persisted grants and prepare (not start) the broker.
    pub fn open(config: Config, clearance: Arc<dyn ClearanceService>) -> Result<Self> {
        let exceptions = Arc::new(open_exception_store(&config)?);
        let audit = open_audit_log(&config);
        let broker = BridgeBroker::new(
            clearance,
            BrokerOptions {
                read_timeout: config.read_timeout(),
            },
            audit.clone(),
        );

        Ok(Self {
            config,
            exceptions,
            audit,
            broker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn exceptions(&self) -> &Arc<AccessExceptionStore> {
        &self.exceptions
    }

    pub fn audit(&self) -> Option<&Arc<AuditLog>> {
        self.audit.as_ref()
    }

    pub fn broker(&self) -> &BridgeBroker {
        &self.broker
    }

    /// Activate grants and start the bridge.
    ///
    /// A bridge that cannot bind is fatal: the caller must not start the
    /// child. Must be called from within a tokio runtime.
    pub fn start(&mut self, transport: Transport) -> Result<BridgeHandoff> {
        let active = self
            .exceptions
            .activate()
            .context("Failed to activate access exceptions")?;
        info!(active, "Access exceptions active");

        let handoff = match transport {
            Transport::Listening => {
                let dir = self.config.endpoint_dir();
                let address = self
                    .broker
                    .start_listening(&dir, self.config.endpoint_names())
                    .context("Cannot start the clearance bridge; refusing to launch")?;
                BridgeHandoff {
                    address,
                    inherited: None,
                }
            }
            Transport::Paired => {
                let child_fd = self
                    .broker
                    .start_paired()
                    .context("Cannot create the clearance bridge pair; refusing to launch")?;
                let Some(address) = self.broker.address().cloned() else {
                    bail!("Bridge started without an address");
                };
                BridgeHandoff {
                    address,
                    inherited: Some(child_fd),
                }
            }
        };

        info!(address = %handoff.address, ?transport, "Clearance bridge ready");
        Ok(handoff)
    }

    /// Environment added to the child so the shim loads and finds the bridge.
    pub fn child_environment(&self, address: &ChannelAddress) -> Vec<(String, OsString)> {
        child_environment(
            &self.config,
            address,
            std::env::var_os(PRELOAD_ENV).as_deref(),
        )
    }

    /// Spawn `program` with the shim injected and wait for it to exit.
    /// Ctrl-C is forwarded as a kill.
    pub async fn run_child(
        &self,
        handoff: BridgeHandoff,
        program: &str,
        args: &[String],
    ) -> Result<ExitStatus> {
        let shim = &self.config.paths.shim_library;
        if !shim.exists() {
            warn!(shim = %shim.display(), "Shim library not found; library loads will not be pre-cleared");
        }

        let mut command = tokio::process::Command::new(program);
        command.args(args).kill_on_drop(true);
        for (key, value) in self.child_environment(&handoff.address) {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", program))?;
        // The child holds its own copy now.
        drop(handoff.inherited);
        info!(program, pid = child.id(), "Child started");

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for child")?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping child");
                child.kill().await.context("Failed to stop child")?;
                child.wait().await.context("Failed to wait for child")?
            }
        };

        if status.success() {
            info!(%status, "Child exited");
        } else {
            error!(%status, "Child exited with failure");
        }
        Ok(status)
    }

    /// Stop the bridge and release every activated grant.
    pub fn teardown(&mut self) {
        self.broker.shutdown();
        self.exceptions.deactivate_all();
        info!("Session torn down");
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub fn open_exception_store(config: &Config) -> Result<AccessExceptionStore> {
    let device_key = key::load_or_create(&config.paths.data_dir)?;
    let settings = Arc::new(JsonSettings::new(config.settings_file()));
    AccessExceptionStore::with_device_key(settings, device_key)
        .context("Failed to load access exceptions")
}

pub fn open_audit_log(config: &Config) -> Option<Arc<AuditLog>> {
    config
        .audit
        .enabled
        .then(|| Arc::new(AuditLog::new(config.paths.audit_log())))
}

fn child_environment(
    config: &Config,
    address: &ChannelAddress,
    existing_preload: Option<&std::ffi::OsStr>,
) -> Vec<(String, OsString)> {
    let preload = prepend_preload(&config.paths.shim_library, existing_preload);
    vec![
        (PRELOAD_ENV.to_string(), preload),
        (SOCKET_ENV.to_string(), address.to_env_value().into()),
        (
            TIMEOUT_ENV.to_string(),
            config.bridge.request_timeout_ms.to_string().into(),
        ),
        (
            PREFIXES_ENV.to_string(),
            config.bridge.system_prefixes.join(":").into(),
        ),
    ]
}

fn prepend_preload(shim: &Path, existing: Option<&std::ffi::OsStr>) -> OsString {
    let mut value = OsString::from(shim.as_os_str());
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clearance::{MockClearanceService, Verdict};
    use crate::paths::Paths;
    use std::path::PathBuf;

    fn test_config(root: &Path) -> Config {
        Config {
            paths: Paths {
                config_dir: root.join("config"),
                data_dir: root.join("data"),
                state_dir: root.join("state"),
                runtime_dir: Some(root.join("run")),
                shim_library: PathBuf::from("/opt/sandbridge/libsandbridge_shim.so"),
            },
            ..Config::default()
        }
    }

    fn clearance() -> Arc<dyn ClearanceService> {
        let mut mock = MockClearanceService::new();
        mock.expect_remove_quarantine_from_file_at()
            .returning(|path| Verdict {
                removed: true,
                path: path.to_path_buf(),
            });
        Arc::new(mock)
    }

    #[test]
    fn preload_is_prepended() {
        let shim = Path::new("/opt/shim.so");
        assert_eq!(prepend_preload(shim, None), OsString::from("/opt/shim.so"));
        assert_eq!(
            prepend_preload(shim, Some("/usr/lib/libasan.so".as_ref())),
            OsString::from("/opt/shim.so:/usr/lib/libasan.so")
        );
    }

    #[test]
    fn child_environment_publishes_bridge() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let env = child_environment(&config, &ChannelAddress::Descriptor(9), None);

        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
        };
        assert_eq!(get(SOCKET_ENV).as_deref(), Some("fd:9"));
        assert_eq!(get(TIMEOUT_ENV).as_deref(), Some("2000"));
        assert_eq!(get(PREFIXES_ENV).as_deref(), Some("/System:/Library:/usr"));
        assert_eq!(
            get(PRELOAD_ENV).as_deref(),
            Some("/opt/sandbridge/libsandbridge_shim.so")
        );
    }

    #[tokio::test]
    async fn start_and_teardown_listening_session() {
        let tmp = tempfile::tempdir().unwrap();
        let granted = tmp.path().join("Games");
        std::fs::create_dir(&granted).unwrap();

        let config = test_config(tmp.path());
        open_exception_store(&config)
            .unwrap()
            .add_exception(crate::capability::AccessMode::ReadWrite, &granted)
            .unwrap();

        let mut session = SessionContext::open(config, clearance()).unwrap();
        let handoff = session.start(Transport::Listening).unwrap();
        assert_eq!(
            handoff.address,
            ChannelAddress::Socket(tmp.path().join("run/bridge/0"))
        );
        assert!(session.broker().is_listening());
        assert!(
            session
                .exceptions()
                .is_active(crate::capability::AccessMode::ReadWrite, &granted)
        );

        session.teardown();
        assert!(!session.broker().is_listening());
        assert!(!tmp.path().join("run/bridge/0").exists());
        assert!(
            !session
                .exceptions()
                .is_active(crate::capability::AccessMode::ReadWrite, &granted)
        );
    }

    #[tokio::test]
    async fn unbindable_bridge_refuses_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        // Longer than any platform's sun_path.
        config.bridge.endpoint_dir = Some(format!("{}/{}", tmp.path().display(), "d".repeat(200)));

        let mut session = SessionContext::open(config, clearance()).unwrap();
        let err = session.start(Transport::Listening).unwrap_err();
        let bridge = err.downcast_ref::<crate::bridge::BridgeError>().unwrap();
        assert!(matches!(
            bridge,
            crate::bridge::BridgeError::AddressTooLong { .. }
        ));
        assert!(!session.broker().is_listening());
    }

    #[tokio::test]
    async fn paired_child_inherits_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = SessionContext::open(test_config(tmp.path()), clearance()).unwrap();
        let handoff = session.start(Transport::Paired).unwrap();
        assert!(matches!(handoff.address, ChannelAddress::Descriptor(_)));
        assert!(handoff.inherited.is_some());

        let status = session
            .run_child(handoff, "sh", &["-c".to_string(), "exit 0".to_string()])
            .await
            .unwrap();
        assert!(status.success());
    }
}
