use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use kennel::services::ConfigService;
use std::path::Path;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a configuration file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration, with the key masked
    Show,
}

pub fn execute(args: ConfigArgs, config: &Path) -> Result<()> {
    let service = ConfigService::new(config);

    match args.command {
        ConfigCommands::Init { force } => {
            if service.exists() && !force {
                anyhow::bail!(
                    "Configuration already exists at {} (use --force to overwrite)",
                    service.path().display()
                );
            }
            service.init()?;
            println!("Wrote configuration to {}", service.path().display());
        },
        ConfigCommands::Show => {
            let settings = service.load()?;
            let content = toml::to_string_pretty(&settings.redacted())
                .context("Failed to serialize config")?;
            print!("{}", content);
        },
    }

    Ok(())
}
