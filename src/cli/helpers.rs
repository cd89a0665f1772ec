//! Shared helper functions for CLI commands

use anyhow::Context;
use observer_evolution::{EvolutionConfig, EvolutionStore, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default database path under the platform data directory
pub fn get_default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("observer")
        .join("evolution.db")
}

/// Open the SQLite store at the given path or the default location
pub fn open_store(path: Option<PathBuf>) -> anyhow::Result<Arc<dyn EvolutionStore>> {
    let path = path.unwrap_or_else(get_default_db_path);
    debug!("Using database {}", path.display());
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open evolution store at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Load and validate a config file, or fall back to defaults
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EvolutionConfig> {
    match path {
        Some(path) => EvolutionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(EvolutionConfig::default()),
    }
}
