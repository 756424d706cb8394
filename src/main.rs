use anyhow::Result;
use clap::Parser;

use sandbridge::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // RUST_LOG wins, then --verbose, then the configured level.
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        sandbridge::Config::load()
            .map(|config| config.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    match cli.command {
        Commands::Launch(args) => cli::launch::run(args).await,
        Commands::Exceptions(args) => cli::exceptions::run(args).await,
        Commands::Clearance(args) => cli::clearance::run(args).await,
        Commands::Audit(args) => cli::audit::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
