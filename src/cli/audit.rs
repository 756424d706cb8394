use anyhow::Result;
use clap::{Args, Subcommand};

use crate::audit::AuditLog;
use crate::config::Config;

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Check the hash chain
    Verify,

    /// Print recent entries
    Show {
        /// Number of entries, newest last
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output raw JSON lines
        #[arg(long)]
        json: bool,
    },
}

pub async fn run(args: AuditArgs) -> Result<()> {
    let config = Config::load()?;
    let log = AuditLog::new(config.paths.audit_log());

    match args.command {
        AuditCommands::Verify => {
            let broken = log.verify()?;
            if broken.is_empty() {
                println!("Audit chain intact ({})", log.path().display());
                Ok(())
            } else {
                for index in &broken {
                    println!("Broken link at entry {}", index);
                }
                anyhow::bail!("Audit chain broken at {} entries", broken.len())
            }
        }
        AuditCommands::Show { limit, json } => {
            let entries = log.read()?;
            let start = entries.len().saturating_sub(limit);
            for entry in &entries[start..] {
                if json {
                    println!("{}", serde_json::to_string(entry)?);
                } else {
                    println!(
                        "{}  {:<28} {:<8} {}{}",
                        entry.ts,
                        serde_json::to_string(&entry.action)?.trim_matches('"'),
                        entry.source,
                        entry.subject,
                        entry
                            .detail
                            .as_deref()
                            .map(|d| format!("  ({})", d))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(())
        }
    }
}
