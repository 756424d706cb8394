//! Decision logic of the library-load interposition shim.
//!
//! The `sandbridge-shim` cdylib exports the interposed `dlopen` and
//! delegates here. Every load ends in the real loader: the bridge is asked
//! to clear quarantine first when the path is not a system library and a
//! channel was published, and whatever happens on the bridge is ignored.
//!
//! Runs inside the child before any tracing subscriber exists, so
//! diagnostics go to stderr and only when [`VERBOSE_ENV`] is set.

use std::cell::Cell;
use std::ffi::CStr;

use crate::bridge::{BridgeClient, Response};

/// Set to any non-empty value to print one line per intercepted load.
pub const VERBOSE_ENV: &str = "SANDBRIDGE_SHIM_VERBOSE";

/// Colon-separated override of [`DEFAULT_SYSTEM_PREFIXES`].
pub const PREFIXES_ENV: &str = "SANDBRIDGE_SYSTEM_PREFIXES";

/// Locations whose libraries never need clearance.
pub const DEFAULT_SYSTEM_PREFIXES: [&str; 3] = ["/System", "/Library", "/usr"];

/// Shim settings read from the child's environment.
#[derive(Debug, Clone)]
pub struct ShimEnv {
    client: Option<BridgeClient>,
    system_prefixes: Vec<String>,
    verbose: bool,
}

impl ShimEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(env_fn: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let system_prefixes = match env_fn(PREFIXES_ENV) {
            Some(list) if !list.trim().is_empty() => list
                .split(':')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            _ => DEFAULT_SYSTEM_PREFIXES.iter().map(|p| p.to_string()).collect(),
        };

        Self {
            client: BridgeClient::from_env(&env_fn),
            system_prefixes,
            verbose: env_fn(VERBOSE_ENV).is_some_and(|v| !v.is_empty()),
        }
    }

    pub fn client(&self) -> Option<&BridgeClient> {
        self.client.as_ref()
    }

    pub fn system_prefixes(&self) -> &[String] {
        &self.system_prefixes
    }

    pub fn is_system_path(&self, path: &str) -> bool {
        self.system_prefixes.iter().any(|prefix| path.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// `dlopen(NULL)` or a path that is not valid UTF-8.
    NoPath,
    SystemLibrary,
    NoChannel,
    /// A load started while this thread was already talking to the bridge.
    Reentrant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptOutcome {
    Passthrough(PassthroughReason),
    Forwarded(Response),
    ForwardFailed,
}

/// Decide what to do with one load and do it. Never blocks longer than
/// the client's timeout.
pub fn intercept(path: &str, env: &ShimEnv) -> InterceptOutcome {
    if env.is_system_path(path) {
        return InterceptOutcome::Passthrough(PassthroughReason::SystemLibrary);
    }
    let Some(client) = env.client() else {
        return InterceptOutcome::Passthrough(PassthroughReason::NoChannel);
    };

    match client.request(path) {
        Ok(response) => InterceptOutcome::Forwarded(response),
        Err(e) => {
            if env.verbose {
                eprintln!("sandbridge-shim: bridge unavailable for {}: {}", path, e);
            }
            InterceptOutcome::ForwardFailed
        }
    }
}

thread_local! {
    static IN_BRIDGE: Cell<bool> = const { Cell::new(false) };
}

struct BridgeGuard;

impl BridgeGuard {
    fn enter() -> Option<Self> {
        IN_BRIDGE.with(|flag| (!flag.replace(true)).then_some(BridgeGuard))
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        IN_BRIDGE.with(|flag| flag.set(false));
    }
}

/// Consult the bridge about `path`, then call `real` unconditionally.
///
/// `real` is the unmediated loader call with the caller's original
/// arguments; its result is returned untouched.
pub fn load_library<T>(path: Option<&CStr>, env: &ShimEnv, real: impl FnOnce() -> T) -> T {
    let outcome = consult(path, env);
    if env.verbose {
        if let Some(path) = path {
            eprintln!("sandbridge-shim: {:?} -> {:?}", path, outcome);
        }
    }
    real()
}

fn consult(path: Option<&CStr>, env: &ShimEnv) -> InterceptOutcome {
    let Some(path) = path.and_then(|p| p.to_str().ok()) else {
        return InterceptOutcome::Passthrough(PassthroughReason::NoPath);
    };
    let Some(_guard) = BridgeGuard::enter() else {
        return InterceptOutcome::Passthrough(PassthroughReason::Reentrant);
    };
    intercept(path, env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::wire::Request;
    use crate::bridge::SOCKET_ENV;
    use std::collections::HashMap;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::UnixListener;

    fn env_with(pairs: &[(&str, String)]) -> ShimEnv {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ShimEnv::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn default_prefixes_apply() {
        let env = env_with(&[]);
        assert!(env.is_system_path("/usr/lib/libSystem.dylib"));
        assert!(env.is_system_path("/System/Library/Frameworks/AppKit"));
        assert!(!env.is_system_path("/Users/x/mods/custom.dylib"));
    }

    #[test]
    fn prefixes_can_be_overridden() {
        let env = env_with(&[(PREFIXES_ENV, "/lib:/usr/lib: ".to_string())]);
        assert_eq!(env.system_prefixes(), ["/lib", "/usr/lib"]);
        assert!(env.is_system_path("/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(!env.is_system_path("/usr/local/lib/libfoo.so"));
    }

    #[test]
    fn without_channel_the_real_loader_result_is_returned() {
        let env = env_with(&[]);
        let path = c"/Users/x/mods/custom.dylib";
        assert_eq!(
            intercept("/Users/x/mods/custom.dylib", &env),
            InterceptOutcome::Passthrough(PassthroughReason::NoChannel)
        );
        let direct = 0x5eed_usize;
        assert_eq!(load_library(Some(path), &env, || direct), direct);
        assert_eq!(load_library(None, &env, || direct), direct);
    }

    #[test]
    fn garbage_channel_is_ignored() {
        for value in ["", "-1", "relative/sock", "fd:", "fd:-4"] {
            let env = env_with(&[(SOCKET_ENV, value.to_string())]);
            assert!(env.client().is_none(), "{value:?} should not be a channel");
        }
    }

    #[test]
    fn system_library_is_never_forwarded() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("0");
        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();

        let env = env_with(&[(SOCKET_ENV, socket.display().to_string())]);
        let outcome = intercept("/usr/lib/libSystem.dylib", &env);
        assert_eq!(
            outcome,
            InterceptOutcome::Passthrough(PassthroughReason::SystemLibrary)
        );
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
    }

    #[test]
    fn user_library_is_forwarded_and_load_proceeds() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("0");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            let request = Request::decode(&buf[..n]);
            // Deny: the load must still go ahead.
            stream
                .write_all(&Response::new(false, request.path()).encode())
                .unwrap();
            request.path().to_string()
        });

        let env = env_with(&[(SOCKET_ENV, socket.display().to_string())]);
        let loaded = load_library(Some(c"/Users/x/mods/custom.dylib"), &env, || "loaded");
        assert_eq!(loaded, "loaded");
        assert_eq!(server.join().unwrap(), "/Users/x/mods/custom.dylib");
    }

    #[test]
    fn unreachable_bridge_fails_open() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_with(&[(SOCKET_ENV, tmp.path().join("nobody").display().to_string())]);
        assert_eq!(
            intercept("/opt/game/libnative.so", &env),
            InterceptOutcome::ForwardFailed
        );
        assert!(load_library(Some(c"/opt/game/libnative.so"), &env, || true));
    }

    #[test]
    fn nested_loads_skip_the_bridge() {
        let env = env_with(&[]);
        let _outer = BridgeGuard::enter().unwrap();
        assert_eq!(
            consult(Some(c"/opt/game/libnative.so"), &env),
            InterceptOutcome::Passthrough(PassthroughReason::Reentrant)
        );
        drop(_outer);
        assert_eq!(
            consult(Some(c"/opt/game/libnative.so"), &env),
            InterceptOutcome::Passthrough(PassthroughReason::NoChannel)
        );
    }
}
