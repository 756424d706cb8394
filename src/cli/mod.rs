pub mod audit;
pub mod clearance;
pub mod config;
pub mod exceptions;
pub mod launch;
pub mod paths;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandbridge")]
#[command(
    author,
    version,
    about = "Quarantine-clearance bridge and persistent folder grants for sandboxed games"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program with the clearance bridge and granted folders active
    Launch(launch::LaunchArgs),

    /// Manage folders the sandboxed game may access
    Exceptions(exceptions::ExceptionsArgs),

    /// Talk to the clearance service directly
    Clearance(clearance::ClearanceArgs),

    /// Inspect the audit log
    Audit(audit::AuditArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
