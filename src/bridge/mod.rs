//! Library-clearance bridge between the sandboxed child and the host.
//!
//! The child's interposition shim forwards every non-system library path
//! to the host over a local channel. The host-side [`BridgeBroker`] asks
//! the privileged clearance service to lift quarantine from that file and
//! writes the verdict back. The shim ignores the verdict and always
//! proceeds with the real load, so the bridge can only ever help a load
//! succeed, never block one.
//!
//! Transports:
//! - Listening: a Unix socket bound under the first free name of `0..9`,
//!   one request per connection.
//! - Paired: a datagram socket pair created before spawn; the child side
//!   is inherited as a raw descriptor, one request per datagram.

pub mod broker;
pub mod client;
pub mod endpoint;
pub mod wire;

use std::path::PathBuf;

use thiserror::Error;

pub use broker::{BridgeBroker, BrokerOptions};
pub use client::BridgeClient;
pub use endpoint::{ChannelAddress, ENDPOINT_NAMES, Transport};
pub use wire::{PATH_MAX, Request, Response};

/// Environment variable carrying the published [`ChannelAddress`].
pub const SOCKET_ENV: &str = "SANDBRIDGE_BRIDGE_SOCKET";

/// Environment variable carrying the shim's bounded wait, in milliseconds.
pub const TIMEOUT_ENV: &str = "SANDBRIDGE_BRIDGE_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(
        "bridge socket path {} is {len} bytes, the platform limit is {max}; choose a shorter bridge.endpoint_dir",
        path.display()
    )]
    AddressTooLong { path: PathBuf, len: usize, max: usize },

    #[error("no bridge endpoint available in {} ({tried} names tried)", dir.display())]
    NoEndpointAvailable { dir: PathBuf, tried: usize },

    #[error("bridge is already running")]
    AlreadyRunning,

    #[error("invalid channel address: {0:?}")]
    InvalidAddress(String),

    #[error("bridge request timed out")]
    TimedOut,

    #[error("malformed bridge response: {0}")]
    Wire(#[from] wire::WireError),

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Bind failures that must stop the sandboxed session from starting.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::AddressTooLong { .. } | Self::NoEndpointAvailable { .. }
        )
    }
}
