//! CLI subcommand: `sandbridge config`

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration, or one section of it
    Show {
        #[arg(value_enum)]
        section: Option<Section>,
    },

    /// Print one value by dotted key (see `config keys`)
    Get { key: String },

    /// Change one value and rewrite config.toml
    Set { key: String, value: String },

    /// List every key with its effective value
    Keys,

    /// Print the config file location
    Path,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Section {
    Bridge,
    Clearance,
    Exceptions,
    Audit,
    Logging,
}

impl Section {
    fn name(self) -> &'static str {
        match self {
            Section::Bridge => "bridge",
            Section::Clearance => "clearance",
            Section::Exceptions => "exceptions",
            Section::Audit => "audit",
            Section::Logging => "logging",
        }
    }
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { section } => {
            let config = Config::load()?;
            print!("{}", render(&config, section)?);
        }
        ConfigCommands::Get { key } => println!("{}", Config::load()?.get_value(&key)?),
        ConfigCommands::Set { key, value } => {
            let mut config = Config::load()?;
            let before = config.get_value(&key)?;
            config.set_value(&key, &value)?;
            config.save()?;
            println!("{}: {} -> {}", key, before, config.get_value(&key)?);
            if key.starts_with("bridge.") || key.starts_with("clearance.") {
                println!("Applies to the next `sandbridge launch`.");
            }
        }
        ConfigCommands::Keys => {
            let config = Config::load()?;
            for key in Config::KEYS {
                println!("{:<34} {}", key, config.get_value(key)?);
            }
        }
        ConfigCommands::Path => println!("{}", Config::config_path()?.display()),
    }
    Ok(())
}

/// TOML for the whole config, or a single `[section]` table.
fn render(config: &Config, section: Option<Section>) -> Result<String> {
    let body = match section {
        None => return Ok(toml::to_string_pretty(config)?),
        Some(Section::Bridge) => toml::to_string_pretty(&config.bridge)?,
        Some(Section::Clearance) => toml::to_string_pretty(&config.clearance)?,
        Some(Section::Exceptions) => toml::to_string_pretty(&config.exceptions)?,
        Some(Section::Audit) => toml::to_string_pretty(&config.audit)?,
        Some(Section::Logging) => toml::to_string_pretty(&config.logging)?,
    };
    Ok(format!("[{}]\n{}", section.map_or("", Section::name), body))
}
