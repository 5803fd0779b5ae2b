//! Configuration view and validation commands (`pagewise config`).

use std::path::Path;

use anyhow::{Context, Result};
use pagewise::config::{CONFIG_DIR, PagewiseConfig};

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    effective: &PagewiseConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = PagewiseConfig::path_in(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Pagewise Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pagewise.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(effective).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
            println!("Database: {}", effective.db_path(project_dir).display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No pagewise.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = PagewiseConfig::load(&config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("pagewise.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            PagewiseConfig::default().save(&config_path)?;

            println!("Created pagewise.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path, dev_mode");
            println!("  - [identity] headers forwarded by your identity proxy");
            println!("  - [sandbox] enabled, interpreter");
            println!("  - [logging] level, format, file");
            println!();
            println!("Files live under {}/", CONFIG_DIR);
        }
    }

    Ok(())
}
