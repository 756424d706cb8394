//! sandbridge - quarantine clearance and persistent folder grants for
//! sandboxed games
//!
//! This crate provides:
//! - The clearance bridge: a Unix-socket broker in the host and a
//!   `dlopen` shim in the child that asks it to clear each library
//! - Capability tokens and the two-lane access exception store
//! - Quarantine clearance for single files and verified Java runtimes
//! - A hash-chained audit log of every clearance and grant change

#[cfg(not(unix))]
compile_error!("sandbridge relies on Unix sockets and dlopen interposition");

pub mod audit;
pub mod bridge;
pub mod capability;
pub mod clearance;
pub mod cli;
pub mod config;
pub mod exceptions;
pub mod paths;
pub mod session;
pub mod settings;
pub mod shim;

pub use config::Config;
