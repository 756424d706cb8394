use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

use crate::audit::AuditAction;
use crate::capability::AccessMode;
use crate::config::Config;
use crate::exceptions::Candidate;
use crate::session::{open_audit_log, open_exception_store};

#[derive(Args)]
pub struct ExceptionsArgs {
    #[command(subcommand)]
    pub command: ExceptionsCommands,
}

#[derive(Subcommand)]
pub enum ExceptionsCommands {
    /// List granted folders
    List {
        /// Only the read-only list (default: both)
        #[arg(long)]
        read_only: bool,

        /// Only the read-write list (default: both)
        #[arg(long, conflicts_with = "read_only")]
        read_write: bool,
    },

    /// Grant one or more folders (paths or file:// URLs)
    Add {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Grant read-only access instead of read-write
        #[arg(long)]
        read_only: bool,
    },

    /// Revoke the grant at INDEX (as shown by `list`)
    Remove {
        index: usize,

        /// Remove from the read-only list
        #[arg(long)]
        read_only: bool,
    },
}

fn mode(read_only: bool) -> AccessMode {
    if read_only {
        AccessMode::ReadOnly
    } else {
        AccessMode::ReadWrite
    }
}

pub async fn run(args: ExceptionsArgs) -> Result<()> {
    let config = Config::load()?;
    match args.command {
        ExceptionsCommands::List {
            read_only,
            read_write,
        } => {
            let modes: Vec<AccessMode> = match (read_only, read_write) {
                (true, _) => vec![AccessMode::ReadOnly],
                (_, true) => vec![AccessMode::ReadWrite],
                _ => AccessMode::ALL.to_vec(),
            };
            list(&config, &modes)
        }
        ExceptionsCommands::Add { paths, read_only } => add(&config, mode(read_only), &paths),
        ExceptionsCommands::Remove { index, read_only } => {
            remove(&config, mode(read_only), index)
        }
    }
}

fn list(config: &Config, modes: &[AccessMode]) -> Result<()> {
    let store = open_exception_store(config)?;

    for &mode in modes {
        // Refreshes stale grants before showing them.
        store.list_paths(mode)?;
        let list = store.list(mode);

        println!("{} ({}):", mode, list.len());
        if list.is_empty() {
            println!("  (none)");
        }
        for (index, token) in list.tokens().iter().enumerate() {
            match &token.resolved_path {
                Some(path) => println!("  [{}] {}", index, path.display()),
                None => println!("  [{}] (unresolvable)", index),
            }
        }
    }
    Ok(())
}

fn add(config: &Config, mode: AccessMode, raw: &[String]) -> Result<()> {
    let store = open_exception_store(config)?;
    let audit = open_audit_log(config);

    let candidates = raw
        .iter()
        .map(|value| match Candidate::parse(value) {
            Candidate::LocalPath(path) => std::path::absolute(&path).map(Candidate::LocalPath),
            url => Ok(url),
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    store.list_paths(mode)?;
    let before = store.list(mode).len();
    let all_added = store.batch_add(mode, candidates);
    let list = store.list(mode);

    for token in &list.tokens()[before..] {
        if let Some(path) = &token.resolved_path {
            println!("Granted {}: {}", mode, path.display());
            if let Some(audit) = &audit {
                audit.append(AuditAction::ExceptionAdded, path, "cli")?;
            }
        }
    }

    if !all_added {
        anyhow::bail!("Some folders were not granted (already present, missing or not local)");
    }
    Ok(())
}

fn remove(config: &Config, mode: AccessMode, index: usize) -> Result<()> {
    let store = open_exception_store(config)?;
    // Resolve first so the removed entry can be named.
    store.list_paths(mode)?;
    let token = store.remove_exception(mode, index)?;

    let subject = token.resolved_path.as_deref().unwrap_or(Path::new(""));
    println!("Removed {} [{}] {}", mode, index, subject.display());
    if let Some(audit) = open_audit_log(config) {
        audit.append(AuditAction::ExceptionRemoved, subject, "cli")?;
    }
    Ok(())
}
