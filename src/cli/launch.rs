use anyhow::Result;
use clap::Args;
use std::sync::Arc;

use crate::bridge::Transport;
use crate::clearance::XattrClearance;
use crate::config::Config;
use crate::session::SessionContext;

#[derive(Args)]
pub struct LaunchArgs {
    /// Bridge transport (default: bridge.transport from config)
    #[arg(short, long, value_enum)]
    pub transport: Option<Transport>,

    /// Program to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn run(args: LaunchArgs) -> Result<()> {
    let Some((program, program_args)) = args.command.split_first() else {
        anyhow::bail!("No program given");
    };
    let config = Config::load()?;
    let transport = args.transport.unwrap_or(config.bridge.transport);
    let clearance = Arc::new(XattrClearance::new(&config.clearance));

    let mut session = SessionContext::open(config, clearance)?;
    let handoff = session.start(transport)?;
    let result = session.run_child(handoff, program, program_args).await;
    session.teardown();

    let status = result?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
