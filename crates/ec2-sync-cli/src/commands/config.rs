//! Config command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};

use ec2_sync_core::{Config, ConfigError};

use super::load_config;
use crate::output::{Output, OutputFormat};

/// Show the effective configuration (file plus environment overrides)
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = load_config(config_path)?;

    match output.format {
        OutputFormat::Json => output.print_json(&config)?,
        OutputFormat::Quiet => {
            for mapping in &config.mappings {
                println!("{}", mapping.name);
            }
        }
        OutputFormat::Human => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
            println!("Config file: {}", Config::config_file_path(config_path).display());
        }
    }

    Ok(())
}

/// Load and validate the configuration, listing every problem found
pub fn validate(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = load_config(config_path)?;

    match config.validate() {
        Ok(()) => {
            output.success(&format!(
                "Configuration is valid ({} mapping(s), {} enabled)",
                config.mappings.len(),
                config.enabled_mappings().count()
            ));
            Ok(())
        }
        Err(ConfigError::Invalid(errors)) => {
            let list: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
            bail!("Configuration is invalid:\n{}", list.join("\n"))
        }
        Err(e) => Err(e).context("Configuration is invalid"),
    }
}

/// Print where the configuration is read from
pub fn path(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let path = Config::config_file_path(config_path);
    let exists = path.exists();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "path": path,
                    "exists": exists
                })
            );
        }
        _ => {
            println!("{}", path.display());
            if !exists && output.format == OutputFormat::Human {
                println!("(file does not exist yet)");
            }
        }
    }

    Ok(())
}
