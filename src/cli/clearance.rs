use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::audit::AuditAction;
use crate::clearance::{ClearanceService, XattrClearance};
use crate::config::Config;
use crate::session::open_audit_log;

#[derive(Args)]
pub struct ClearanceArgs {
    #[command(subcommand)]
    pub command: ClearanceCommands,
}

#[derive(Subcommand)]
pub enum ClearanceCommands {
    /// Remove the quarantine attribute from one file
    Remove { path: PathBuf },

    /// Verify a Java runtime against its manifest, then clear it
    JavaRuntime {
        dir: PathBuf,

        /// HTTPS manifest URL on a trusted host
        #[arg(long)]
        manifest: String,
    },

    /// Mark every file under DIR as downloaded
    ApplyDownload { dir: PathBuf },

    /// Print the unsandboxed temporary directory
    TempDir,
}

pub async fn run(args: ClearanceArgs) -> Result<()> {
    let config = Config::load()?;
    let service = XattrClearance::new(&config.clearance);
    let audit = open_audit_log(&config);

    match args.command {
        ClearanceCommands::Remove { path } => {
            let verdict = service.remove_quarantine_from_file_at(&path).await;
            if let Some(audit) = &audit {
                let action = if verdict.removed {
                    AuditAction::Cleared
                } else {
                    AuditAction::NotCleared
                };
                audit.append(action, &verdict.path, "cli")?;
            }
            if verdict.removed {
                println!("Cleared {}", verdict.path.display());
            } else {
                println!("Nothing removed from {}", verdict.path.display());
            }
        }
        ClearanceCommands::JavaRuntime { dir, manifest } => {
            let cleared = service
                .remove_quarantine_recursively_from_java_install_at(&dir, &manifest)
                .await;
            if let Some(audit) = &audit {
                let action = if cleared {
                    AuditAction::RuntimeCleared
                } else {
                    AuditAction::RuntimeRefused
                };
                audit.append_with_detail(action, &dir, "cli", Some(&manifest))?;
            }
            if !cleared {
                anyhow::bail!("Runtime at {} was not cleared", dir.display());
            }
            println!("Runtime cleared: {}", dir.display());
        }
        ClearanceCommands::ApplyDownload { dir } => {
            let applied = service
                .apply_download_quarantine_recursively_to_java_install_at(&dir)
                .await;
            if !applied {
                anyhow::bail!("Failed to mark {} as downloaded", dir.display());
            }
            if let Some(audit) = &audit {
                audit.append(AuditAction::DownloadQuarantineApplied, &dir, "cli")?;
            }
            println!("Marked as downloaded: {}", dir.display());
        }
        ClearanceCommands::TempDir => {
            let dir = service.retrieve_unsandboxed_user_temporary_directory().await;
            println!("{}", dir.display());
        }
    }
    Ok(())
}
