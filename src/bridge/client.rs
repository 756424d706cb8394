//! Blocking requester used inside the child process.
//!
//! Runs on whatever thread called the dynamic loader, so it never touches
//! an async runtime and every socket operation carries a timeout.

use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::path::Path;
use std::time::Duration;

use super::endpoint::ChannelAddress;
use super::wire::{RESPONSE_MAX, Request, Response};
use super::{BridgeError, SOCKET_ENV, TIMEOUT_ENV};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct BridgeClient {
    address: ChannelAddress,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(address: ChannelAddress, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    /// Build a client from the published environment. `None` when no
    /// usable channel was published.
    pub fn from_env<F>(env_fn: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = ChannelAddress::parse(&env_fn(SOCKET_ENV)?)?;
        let timeout = env_fn(TIMEOUT_ENV)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        Some(Self::new(address, timeout))
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One round trip: send the path, wait at most `timeout` for the verdict.
    pub fn request(&self, path: &str) -> Result<Response, BridgeError> {
        let request = Request::new(path);
        let raw = match &self.address {
            ChannelAddress::Socket(socket) => self.exchange_stream(socket, &request)?,
            ChannelAddress::Descriptor(fd) => self.exchange_datagram(*fd, &request)?,
        };
        Ok(Response::decode(&raw)?)
    }

    fn exchange_stream(&self, socket: &Path, request: &Request) -> Result<Vec<u8>, BridgeError> {
        let mut stream = UnixStream::connect(socket)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_read_timeout(Some(self.timeout))?;

        stream.write_all(&request.encode()).map_err(timeout_or_io)?;
        stream.flush().map_err(timeout_or_io)?;

        let mut raw = Vec::with_capacity(64);
        let mut chunk = [0u8; 1024];
        while raw.len() < RESPONSE_MAX {
            let n = stream.read(&mut chunk).map_err(timeout_or_io)?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            // Flag byte, then a terminated path.
            if raw.len() > 1 && raw[1..].contains(&0) {
                break;
            }
        }
        Ok(raw)
    }

    fn exchange_datagram(&self, fd: RawFd, request: &Request) -> Result<Vec<u8>, BridgeError> {
        if !descriptor_is_open(fd) {
            return Err(BridgeError::InvalidAddress(format!("fd:{}", fd)));
        }

        // The descriptor belongs to the process, not to this call.
        // SAFETY: `fd` was checked to be open; ManuallyDrop keeps it open.
        let socket = ManuallyDrop::new(unsafe { UnixDatagram::from_raw_fd(fd) });
        socket.set_write_timeout(Some(self.timeout))?;
        socket.set_read_timeout(Some(self.timeout))?;

        socket.send(&request.encode()).map_err(timeout_or_io)?;

        let mut raw = vec![0u8; RESPONSE_MAX];
        let n = socket.recv(&mut raw).map_err(timeout_or_io)?;
        raw.truncate(n);
        Ok(raw)
    }
}

fn descriptor_is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn timeout_or_io(e: io::Error) -> BridgeError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => BridgeError::TimedOut,
        _ => BridgeError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixListener;

    fn make_env(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key: &str| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn from_env_requires_a_channel() {
        assert!(BridgeClient::from_env(make_env(HashMap::new())).is_none());

        let mut env = HashMap::new();
        env.insert(SOCKET_ENV, "");
        assert!(BridgeClient::from_env(make_env(env)).is_none());

        let mut env = HashMap::new();
        env.insert(SOCKET_ENV, "-1");
        assert!(BridgeClient::from_env(make_env(env)).is_none());
    }

    #[test]
    fn from_env_reads_timeout() {
        let mut env = HashMap::new();
        env.insert(SOCKET_ENV, "/tmp/sandbridge/0");
        env.insert(TIMEOUT_ENV, "150");
        let client = BridgeClient::from_env(make_env(env)).unwrap();
        assert_eq!(client.timeout(), Duration::from_millis(150));

        let mut env = HashMap::new();
        env.insert(SOCKET_ENV, "fd:9");
        env.insert(TIMEOUT_ENV, "soon");
        let client = BridgeClient::from_env(make_env(env)).unwrap();
        assert_eq!(client.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(client.address(), &ChannelAddress::Descriptor(9));
    }

    #[test]
    fn stream_exchange_against_echo_server() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("0");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 256];
            let n = conn.read(&mut buf).unwrap();
            let req = Request::decode(&buf[..n]);
            conn.write_all(&Response::new(true, req.path()).encode())
                .unwrap();
        });

        let client = BridgeClient::new(
            ChannelAddress::Socket(socket),
            Duration::from_millis(2000),
        );
        let resp = client.request("/Users/x/mods/custom.dylib").unwrap();
        assert!(resp.success);
        assert_eq!(resp.path, "/Users/x/mods/custom.dylib");
        server.join().unwrap();
    }

    #[test]
    fn silent_server_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("0");
        let _listener = UnixListener::bind(&socket).unwrap();

        let client = BridgeClient::new(
            ChannelAddress::Socket(socket),
            Duration::from_millis(100),
        );
        let err = client.request("/opt/mods/a.so").unwrap_err();
        assert!(matches!(err, BridgeError::TimedOut), "got {err:?}");
    }

    #[test]
    fn datagram_exchange_leaves_descriptor_open() {
        let (host, child) = UnixDatagram::pair().unwrap();
        let server = std::thread::spawn(move || {
            let mut buf = vec![0u8; 512];
            let n = host.recv(&mut buf).unwrap();
            let req = Request::decode(&buf[..n]);
            host.send(&Response::new(false, req.path()).encode()).unwrap();
        });

        let client = BridgeClient::new(
            ChannelAddress::Descriptor(child.as_raw_fd()),
            Duration::from_millis(2000),
        );
        let resp = client.request("/opt/mods/b.so").unwrap();
        assert!(!resp.success);
        assert_eq!(resp.path, "/opt/mods/b.so");
        server.join().unwrap();

        assert!(descriptor_is_open(child.as_raw_fd()));
    }

    #[test]
    fn closed_descriptor_is_rejected() {
        let client = BridgeClient::new(ChannelAddress::Descriptor(987_654), DEFAULT_TIMEOUT);
        assert!(matches!(
            client.request("/opt/mods/c.so"),
            Err(BridgeError::InvalidAddress(_))
        ));
    }
}
