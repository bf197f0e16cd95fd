//! Configuration view and validation commands - `webs config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use webs::config::WebsConfig;

pub fn cmd_config(config_path: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Webs Configuration");
            println!("==================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; using defaults.", config_path.display());
            }
            println!();

            let mut config = WebsConfig::load_or_default(config_path)?;
            config.apply_env()?;
            if config.runner.api_key.is_some() {
                config.runner.api_key = Some("********".to_string());
            }

            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("webhook_url = \"{}\"", config.webhook_url());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut config = WebsConfig::load_or_default(config_path)?;
            config.apply_env()?;
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
                println!("{} already exists", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            WebsConfig::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [runner] base_url, workflow_name, api_key");
            println!("  - [app] base_url (public address the runner calls back)");
            println!("  - [stream] poll_interval_ms");
            println!();
        }
    }

    Ok(())
}
