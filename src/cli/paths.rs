//! CLI subcommand: `sandbridge paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;

pub fn run() -> Result<()> {
    let config = Config::load()?;
    let paths = &config.paths;

    println!("sandbridge Paths (XDG Base Directory)");
    println!("=====================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  device key:     {}", paths.device_key().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  settings:       {}", config.settings_file().display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  bridge sockets: {}", config.endpoint_dir().display());
    println!();
    println!("Shim:       {}", paths.shim_library.display());

    Ok(())
}
