//! Config command implementation.

use anyhow::{Context, Result};

use oppush_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = Config::load().context("Failed to load configuration")?;
            let content =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

            println!();
            println!("OpPush Configuration ({})", Config::config_path().display());
            println!("{}", "─".repeat(50));
            println!();
            println!("{}", content.trim_end());
            println!();
        }

        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }

        ConfigAction::Init { force } => {
            let path = Config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default()
                .save()
                .context("Failed to write configuration")?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
