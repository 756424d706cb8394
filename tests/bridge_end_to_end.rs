//! Shim decisions against a live broker.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandbridge::bridge::{BridgeBroker, BrokerOptions, ENDPOINT_NAMES, SOCKET_ENV};
use sandbridge::clearance::{ClearanceService, Verdict};
use sandbridge::shim::{InterceptOutcome, PassthroughReason, ShimEnv, intercept, load_library};

/// Clears everything and remembers what it was asked about.
#[derive(Default)]
struct RecordingClearance {
    seen: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ClearanceService for RecordingClearance {
    async fn remove_quarantine_from_file_at(&self, path: &Path) -> Verdict {
        self.seen.lock().unwrap().push(path.to_path_buf());
        Verdict {
            removed: true,
            path: path.to_path_buf(),
        }
    }

    async fn remove_quarantine_recursively_from_java_install_at(
        &self,
        _path: &Path,
        _manifest_url: &str,
    ) -> bool {
        false
    }

    async fn apply_download_quarantine_recursively_to_java_install_at(&self, _path: &Path) -> bool {
        false
    }

    async fn retrieve_unsandboxed_user_temporary_directory(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

fn shim_env(socket: &Path) -> ShimEnv {
    let socket = socket.display().to_string();
    ShimEnv::from_lookup(move |key| (key == SOCKET_ENV).then(|| socket.clone()))
}

#[tokio::test(flavor = "multi_thread")]
async fn user_library_is_cleared_and_system_library_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let service = Arc::new(RecordingClearance::default());
    let mut broker = BridgeBroker::new(
        service.clone(),
        BrokerOptions {
            read_timeout: Duration::from_secs(2),
        },
        None,
    );
    broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
    let env = shim_env(&tmp.path().join("0"));

    let outcomes = tokio::task::spawn_blocking(move || {
        let user = intercept("/opt/game/natives/liblwjgl.so", &env);
        let system = intercept("/usr/lib/libc.so.6", &env);
        let loaded = load_library(Some(c"/opt/game/natives/libopenal.so"), &env, || 7);
        (user, system, loaded)
    })
    .await
    .unwrap();

    let (user, system, loaded) = outcomes;
    match user {
        InterceptOutcome::Forwarded(response) => {
            assert!(response.success);
            assert_eq!(response.path, "/opt/game/natives/liblwjgl.so");
        }
        other => panic!("expected a forwarded request, got {other:?}"),
    }
    assert_eq!(
        system,
        InterceptOutcome::Passthrough(PassthroughReason::SystemLibrary)
    );
    assert_eq!(loaded, 7);

    assert_eq!(
        *service.seen.lock().unwrap(),
        [
            PathBuf::from("/opt/game/natives/liblwjgl.so"),
            PathBuf::from("/opt/game/natives/libopenal.so"),
        ]
    );
    broker.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_broker_does_not_block_loads() {
    let tmp = tempfile::tempdir().unwrap();
    let mut broker = BridgeBroker::new(
        Arc::new(RecordingClearance::default()),
        BrokerOptions::default(),
        None,
    );
    broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
    broker.shutdown();

    let env = shim_env(&tmp.path().join("0"));
    let (outcome, loaded) = tokio::task::spawn_blocking(move || {
        (
            intercept("/opt/game/natives/liblwjgl.so", &env),
            load_library(Some(c"/opt/game/natives/liblwjgl.so"), &env, || "ok"),
        )
    })
    .await
    .unwrap();

    assert_eq!(outcome, InterceptOutcome::ForwardFailed);
    assert_eq!(loaded, "ok");
}
