//! Configuration management command

use anyhow::Context;
use clap::Subcommand;
use observer_evolution::EvolutionConfig;
use std::path::PathBuf;

use super::helpers::load_config;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show {
        /// Config file (defaults are shown if omitted)
        path: Option<PathBuf>,
    },

    /// Check a config file for errors
    Validate {
        path: PathBuf,
    },

    /// Write a config file with default values
    Init {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Handle configuration management command
pub fn handle(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show { path } => {
            let config = load_config(path.as_deref())?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", rendered);
            Ok(())
        }
        ConfigAction::Validate { path } => {
            load_config(Some(&path))?;
            println!("{} is valid", path.display());
            Ok(())
        }
        ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            EvolutionConfig::default()
                .to_file(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}
