//! Where the broker listens and how the child finds it.
//!
//! The listening transport binds the first free name of [`ENDPOINT_NAMES`]
//! under the endpoint directory, replacing sockets left by a dead host. The
//! paired transport hands the child one end of a datagram socketpair with
//! close-on-exec cleared. [`ChannelAddress`] is what gets published to the
//! child's environment for either one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::BridgeError;

/// Names tried, in order, for the listening endpoint.
pub const ENDPOINT_NAMES: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// How the host and the child are connected for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Named socket under the endpoint directory, one connection per request.
    #[default]
    Listening,
    /// Datagram socket pair, child side inherited as a descriptor.
    Paired,
}

/// Where the shim should send its requests. Published to the child through
/// [`super::SOCKET_ENV`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    Socket(PathBuf),
    Descriptor(RawFd),
}

impl ChannelAddress {
    /// Parse a published address.
    ///
    /// Accepts `fd:<n>` or a bare positive integer for an inherited
    /// descriptor, and an absolute path for a listening socket. Anything
    /// else, including empty and negative values, is not a channel.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value.starts_with('-') {
            return None;
        }

        let digits = value.strip_prefix("fd:").unwrap_or(value);
        if digits.bytes().all(|b| b.is_ascii_digit()) {
            return digits
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd > 0)
                .map(Self::Descriptor);
        }
        if value.starts_with("fd:") {
            return None;
        }

        let path = PathBuf::from(value);
        path.is_absolute().then_some(Self::Socket(path))
    }

    pub fn to_env_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(path) => write!(f, "{}", path.display()),
            Self::Descriptor(fd) => write!(f, "fd:{}", fd),
        }
    }
}

/// A listening endpoint bound under one of the enumerated names.
#[derive(Debug)]
pub struct BoundEndpoint {
    pub name: String,
    pub path: PathBuf,
    pub listener: UnixListener,
}

/// Host and child halves of a paired channel.
#[derive(Debug)]
pub struct PairedChannel {
    pub host: UnixDatagram,
    pub child: OwnedFd,
}

/// Longest socket path the platform accepts, terminator excluded.
pub fn max_socket_path_len() -> usize {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len() - 1
}

/// Bind the first free name in `names` under `dir`.
///
/// A socket file left behind by a dead host is removed and reused. A name
/// whose socket still accepts connections belongs to another session and
/// is skipped.
pub fn bind_listening(dir: &Path, names: &[&str]) -> Result<BoundEndpoint, BridgeError> {
    create_endpoint_dir(dir)?;

    let max = max_socket_path_len();
    for name in names {
        let path = dir.join(name);
        let len = path.as_os_str().len();
        if len > max {
            return Err(BridgeError::AddressTooLong { path, len, max });
        }

        if let Err(reason) = clear_stale_socket(&path) {
            warn!(endpoint = %path.display(), reason, "Bridge endpoint unavailable");
            continue;
        }

        match UnixListener::bind(&path) {
            Ok(listener) => {
                info!(endpoint = %path.display(), "Bridge listening");
                return Ok(BoundEndpoint {
                    name: (*name).to_string(),
                    path,
                    listener,
                });
            }
            Err(e) => {
                warn!(endpoint = %path.display(), error = %e, "Bridge failed to listen on endpoint");
            }
        }
    }

    Err(BridgeError::NoEndpointAvailable {
        dir: dir.to_path_buf(),
        tried: names.len(),
    })
}

/// Create a datagram pair for the paired transport.
pub fn create_pair() -> Result<PairedChannel, BridgeError> {
    let (host, child) = UnixDatagram::pair()?;
    Ok(PairedChannel {
        host,
        child: OwnedFd::from(child),
    })
}

/// Clear close-on-exec so the descriptor survives into the spawned child.
pub fn make_inheritable(fd: &OwnedFd) -> Result<(), BridgeError> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;
    Ok(())
}

fn clear_stale_socket(path: &Path) -> Result<(), &'static str> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };

    if !meta.file_type().is_socket() {
        return Err("occupied by a non-socket file");
    }

    if UnixStream::connect(path).is_ok() {
        return Err("in use by another listener");
    }

    debug!(endpoint = %path.display(), "Removing stale bridge socket");
    fs::remove_file(path).map_err(|_| "stale socket could not be removed")
}

fn create_endpoint_dir(dir: &Path) -> Result<(), BridgeError> {
    fs::create_dir_all(dir)?;

    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_descriptor_forms() {
        assert_eq!(
            ChannelAddress::parse("fd:7"),
            Some(ChannelAddress::Descriptor(7))
        );
        assert_eq!(
            ChannelAddress::parse("12"),
            Some(ChannelAddress::Descriptor(12))
        );
        assert_eq!(ChannelAddress::parse("0"), None);
        assert_eq!(ChannelAddress::parse("-3"), None);
        assert_eq!(ChannelAddress::parse("fd:"), None);
        assert_eq!(ChannelAddress::parse("fd:x1"), None);
    }

    #[test]
    fn parse_socket_paths() {
        assert_eq!(
            ChannelAddress::parse("/run/user/1000/sandbridge/bridge/0"),
            Some(ChannelAddress::Socket(PathBuf::from(
                "/run/user/1000/sandbridge/bridge/0"
            )))
        );
        assert_eq!(ChannelAddress::parse("relative/sock"), None);
        assert_eq!(ChannelAddress::parse(""), None);
        assert_eq!(ChannelAddress::parse("   "), None);
    }

    #[test]
    fn env_value_roundtrips() {
        for addr in [
            ChannelAddress::Descriptor(5),
            ChannelAddress::Socket(PathBuf::from("/tmp/sb/3")),
        ] {
            assert_eq!(ChannelAddress::parse(&addr.to_env_value()), Some(addr));
        }
    }

    #[test]
    fn binds_first_free_name() {
        let tmp = tempfile::tempdir().unwrap();
        let first = bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        assert_eq!(first.name, "0");

        let second = bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        assert_eq!(second.name, "1");
    }

    #[test]
    fn exhausted_names_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let held: Vec<_> = (0..ENDPOINT_NAMES.len())
            .map(|_| bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap())
            .collect();
        assert_eq!(held.len(), 10);

        let err = bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap_err();
        assert!(matches!(err, BridgeError::NoEndpointAvailable { tried: 10, .. }));
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn stale_socket_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let bound = bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        let path = bound.path.clone();
        drop(bound);
        assert!(path.exists(), "socket file outlives its listener");

        let again = bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        assert_eq!(again.name, "0");
    }

    #[test]
    fn regular_file_is_never_removed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("0"), "keep me").unwrap();

        let bound = bind_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        assert_eq!(bound.name, "1");
        assert_eq!(fs::read_to_string(tmp.path().join("0")).unwrap(), "keep me");
    }

    #[test]
    fn overlong_directory_is_reported_distinctly() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("d".repeat(max_socket_path_len()));
        let err = bind_listening(&deep, &ENDPOINT_NAMES).unwrap_err();
        assert!(matches!(err, BridgeError::AddressTooLong { .. }));
        assert!(err.to_string().contains("platform limit"));
    }

    #[test]
    fn paired_child_side_can_be_made_inheritable() {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};

        let pair = create_pair().unwrap();
        make_inheritable(&pair.child).unwrap();
        let flags = fcntl(&pair.child, FcntlArg::F_GETFD).unwrap();
        assert!(!FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }
}
