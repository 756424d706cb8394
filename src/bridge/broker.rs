//! Host-side end of the bridge.
//!
//! Accepts forwarded paths, asks the clearance service to lift quarantine,
//! and writes the verdict back. Accepting and reading happen on tokio
//! tasks, never on the caller's thread, and every read is bounded by
//! [`BrokerOptions::read_timeout`] so a silent peer cannot pin a task.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixDatagram, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::endpoint::{self, ChannelAddress};
use super::wire::{PATH_MAX, Request, Response, request_complete};
use super::BridgeError;
use crate::audit::{AuditAction, AuditLog};
use crate::clearance::ClearanceService;

const AUDIT_SOURCE: &str = "broker";

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Longest wait for a connected peer to finish sending its request.
    pub read_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(2000),
        }
    }
}

/// Shared by every connection task.
struct Relay {
    service: Arc<dyn ClearanceService>,
    options: BrokerOptions,
    audit: Option<Arc<AuditLog>>,
}

struct Running {
    address: ChannelAddress,
    socket_path: Option<PathBuf>,
    task: JoinHandle<()>,
}

pub struct BridgeBroker {
    relay: Arc<Relay>,
    running: Option<Running>,
}

impl BridgeBroker {
    pub fn new(
        service: Arc<dyn ClearanceService>,
        options: BrokerOptions,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            relay: Arc::new(Relay {
                service,
                options,
                audit,
            }),
            running: None,
        }
    }

    /// Bind the first free name in `names` under `dir` and start accepting.
    ///
    /// On error nothing is listening and no accept task exists. Must be
    /// called from within a tokio runtime.
    pub fn start_listening(
        &mut self,
        dir: &Path,
        names: &[&str],
    ) -> Result<ChannelAddress, BridgeError> {
        if self.running.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let bound = endpoint::bind_listening(dir, names)?;
        bound.listener.set_nonblocking(true)?;
        let listener = match UnixListener::from_std(bound.listener) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_file(&bound.path);
                return Err(e.into());
            }
        };

        let relay = Arc::clone(&self.relay);
        let task = tokio::spawn(accept_loop(listener, relay));
        let address = ChannelAddress::Socket(bound.path.clone());
        self.running = Some(Running {
            address: address.clone(),
            socket_path: Some(bound.path),
            task,
        });
        Ok(address)
    }

    /// Create a datagram pair and start serving the host half.
    ///
    /// Returns the child half with close-on-exec cleared; pass it to the
    /// spawned child and drop it in the host afterwards.
    pub fn start_paired(&mut self) -> Result<OwnedFd, BridgeError> {
        if self.running.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let pair = endpoint::create_pair()?;
        endpoint::make_inheritable(&pair.child)?;
        pair.host.set_nonblocking(true)?;
        let host = UnixDatagram::from_std(pair.host)?;

        let relay = Arc::clone(&self.relay);
        let task = tokio::spawn(datagram_loop(host, relay));
        let address = ChannelAddress::Descriptor(pair.child.as_raw_fd());
        info!(%address, "Bridge paired channel ready");
        self.running = Some(Running {
            address,
            socket_path: None,
            task,
        });
        Ok(pair.child)
    }

    pub fn is_listening(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Address to publish to the child, once started.
    pub fn address(&self) -> Option<&ChannelAddress> {
        self.running.as_ref().map(|running| &running.address)
    }

    /// Stop serving and remove the socket file, if any.
    pub fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.task.abort();
        if let Some(path) = running.socket_path {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(endpoint = %path.display(), error = %e, "Bridge socket already gone");
            }
        }
        info!(address = %running.address, "Bridge stopped");
    }
}

impl Drop for BridgeBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: UnixListener, relay: Arc<Relay>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let relay = Arc::clone(&relay);
                tokio::spawn(async move {
                    if let Err(e) = relay.serve_stream(stream).await {
                        warn!(error = %e, "Bridge connection dropped");
                        relay.record(AuditAction::TransportError, Path::new(""), Some(&e.to_string()));
                    }
                });
            }
            Err(e) => {
                // Usually EMFILE or ECONNABORTED; keep listening.
                error!(error = %e, "Bridge accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn datagram_loop(socket: UnixDatagram, relay: Arc<Relay>) {
    let mut buf = vec![0u8; PATH_MAX];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(0) => {
                // Requests always carry a terminator; zero means the peer is gone.
                debug!("Bridge paired channel closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Bridge paired channel closed");
                return;
            }
        };

        let response = relay.clear(Request::decode(&buf[..n])).await;
        if let Err(e) = socket.send(&response.encode()).await {
            warn!(error = %e, "Bridge failed to reply on paired channel");
            relay.record(AuditAction::TransportError, Path::new(&response.path), Some(&e.to_string()));
        }
    }
}

impl Relay {
    async fn serve_stream(&self, mut stream: UnixStream) -> io::Result<()> {
        let mut buf = Vec::with_capacity(256);
        let read = tokio::time::timeout(self.options.read_timeout, async {
            let mut chunk = [0u8; 1024];
            while !request_complete(&buf) {
                let want = (PATH_MAX - buf.len()).min(chunk.len());
                let n = stream.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Ok::<_, io::Error>(())
        })
        .await;

        match read {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer did not send a request in time",
                ));
            }
        }
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed without sending a request",
            ));
        }

        let response = self.clear(Request::decode(&buf)).await;
        stream.write_all(&response.encode()).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn clear(&self, request: Request) -> Response {
        let path = request.into_path_buf();
        let verdict = self.service.remove_quarantine_from_file_at(&path).await;
        debug!(
            requested = %path.display(),
            canonical = %verdict.path.display(),
            removed = verdict.removed,
            "Clearance verdict"
        );

        let action = if verdict.removed {
            AuditAction::Cleared
        } else {
            AuditAction::NotCleared
        };
        self.record(action, &verdict.path, None);

        Response::new(verdict.removed, verdict.path.to_string_lossy())
    }

    /// Queue an audit entry on the blocking pool. The log takes a file
    /// lock another process may hold, so replies never wait for it.
    fn record(&self, action: AuditAction, subject: &Path, detail: Option<&str>) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        let subject = subject.to_path_buf();
        let detail = detail.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = audit.append_with_detail(action, &subject, AUDIT_SOURCE, detail.as_deref()) {
                warn!(error = %e, "Failed to write audit entry");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::client::BridgeClient;
    use crate::bridge::endpoint::ENDPOINT_NAMES;
    use crate::clearance::{MockClearanceService, Verdict};
    use std::os::unix::net::UnixListener as StdUnixListener;

    fn echo_service(removed: bool) -> Arc<dyn ClearanceService> {
        let mut mock = MockClearanceService::new();
        mock.expect_remove_quarantine_from_file_at()
            .returning(move |path| Verdict {
                removed,
                path: path.to_path_buf(),
            });
        Arc::new(mock)
    }

    fn broker(service: Arc<dyn ClearanceService>) -> BridgeBroker {
        BridgeBroker::new(
            service,
            BrokerOptions {
                read_timeout: Duration::from_millis(200),
            },
            None,
        )
    }

    async fn request(address: ChannelAddress, path: &'static str) -> Response {
        tokio::task::spawn_blocking(move || {
            BridgeClient::new(address, Duration::from_secs(2))
                .request(path)
                .unwrap()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn listening_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut broker = broker(echo_service(true));
        let address = broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        assert_eq!(address, ChannelAddress::Socket(tmp.path().join("0")));
        assert!(broker.is_listening());

        let response = request(address, "/Users/x/mods/custom.dylib").await;
        assert!(response.success);
        assert_eq!(response.path, "/Users/x/mods/custom.dylib");
    }

    #[tokio::test]
    async fn each_connection_is_one_exchange() {
        let tmp = tempfile::tempdir().unwrap();
        let mut broker = broker(echo_service(false));
        let address = broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();

        for path in ["/a.so", "/b.so", "/c.so"] {
            let response = request(address.clone(), path).await;
            assert!(!response.success);
            assert_eq!(response.path, path);
        }
    }

    #[tokio::test]
    async fn exhausted_names_start_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let _held: Vec<_> = ENDPOINT_NAMES
            .iter()
            .map(|name| StdUnixListener::bind(tmp.path().join(name)).unwrap())
            .collect();

        let mut mock = MockClearanceService::new();
        mock.expect_remove_quarantine_from_file_at().never();
        let mut broker = broker(Arc::new(mock));

        let err = broker
            .start_listening(tmp.path(), &ENDPOINT_NAMES)
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoEndpointAvailable { tried: 10, .. }));
        assert!(err.is_fatal_to_session());
        assert!(!broker.is_listening());
        assert!(broker.address().is_none());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut broker = broker(echo_service(true));
        broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        assert!(matches!(
            broker.start_listening(tmp.path(), &ENDPOINT_NAMES),
            Err(BridgeError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_and_broker_keeps_serving() {
        let tmp = tempfile::tempdir().unwrap();
        let mut broker = broker(echo_service(true));
        let address = broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        let ChannelAddress::Socket(socket) = address.clone() else {
            panic!("expected a socket address");
        };

        // Connect, send nothing, wait past the read timeout.
        let idle = tokio::net::UnixStream::connect(&socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(idle);

        let response = request(address, "/mods/after.so").await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn unterminated_request_is_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockClearanceService::new();
        mock.expect_remove_quarantine_from_file_at()
            .withf(|path| path.as_os_str().len() == PATH_MAX - 1)
            .returning(|path| Verdict {
                removed: false,
                path: path.to_path_buf(),
            });
        let mut broker = broker(Arc::new(mock));
        let ChannelAddress::Socket(socket) = broker
            .start_listening(tmp.path(), &ENDPOINT_NAMES)
            .unwrap()
        else {
            panic!("expected a socket address");
        };

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(&vec![b'a'; PATH_MAX]).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();

        let response = Response::decode(&reply).unwrap();
        assert_eq!(response.path.len(), PATH_MAX - 1);
    }

    #[tokio::test]
    async fn paired_round_trip() {
        let mut broker = broker(echo_service(true));
        let child = broker.start_paired().unwrap();
        let address = broker.address().cloned().unwrap();
        assert_eq!(address, ChannelAddress::Descriptor(child.as_raw_fd()));

        let response = request(address, "/Users/x/mods/custom.dylib").await;
        assert!(response.success);
        assert_eq!(response.path, "/Users/x/mods/custom.dylib");
        drop(child);
    }

    #[tokio::test]
    async fn shutdown_removes_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let mut broker = broker(echo_service(true));
        broker.start_listening(tmp.path(), &ENDPOINT_NAMES).unwrap();
        let socket = tmp.path().join("0");
        assert!(socket.exists());

        broker.shutdown();
        assert!(!socket.exists());
        assert!(!broker.is_listening());
    }

    #[tokio::test]
    async fn verdicts_are_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::in_dir(tmp.path()));
        let mut broker = BridgeBroker::new(
            echo_service(true),
            BrokerOptions::default(),
            Some(Arc::clone(&audit)),
        );
        let address = broker
            .start_listening(&tmp.path().join("sock"), &ENDPOINT_NAMES)
            .unwrap();

        request(address, "/mods/a.so").await;

        let entries = wait_for_entries(&audit, 1).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Cleared);
        assert_eq!(entries[0].subject, "/mods/a.so");
    }

    async fn wait_for_entries(audit: &AuditLog, count: usize) -> Vec<crate::audit::AuditEntry> {
        for _ in 0..100 {
            let entries = audit.read().unwrap();
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("audit log never reached {count} entries");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn locked_audit_log_does_not_delay_replies() {
        use fs2::FileExt;

        let tmp = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::in_dir(tmp.path()));
        let held = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit.path())
            .unwrap();
        held.lock_exclusive().unwrap();

        let mut broker = BridgeBroker::new(
            echo_service(true),
            BrokerOptions::default(),
            Some(Arc::clone(&audit)),
        );
        let address = broker
            .start_listening(&tmp.path().join("sock"), &ENDPOINT_NAMES)
            .unwrap();

        for path in ["/mods/a.so", "/mods/b.so"] {
            let response = tokio::time::timeout(
                Duration::from_secs(1),
                request(address.clone(), path),
            )
            .await
            .expect("reply held up by the audit lock");
            assert!(response.success);
        }

        FileExt::unlock(&held).unwrap();
        let entries = wait_for_entries(&audit, 2).await;
        assert!(entries.iter().all(|e| e.action == AuditAction::Cleared));
        assert!(audit.verify().unwrap().is_empty());
    }
}
