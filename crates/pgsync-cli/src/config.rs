//! Configuration file handling for pgsync.
//!
//! Looks for `.config/pgsync.json` in the current directory or any parent directory.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = ".config/pgsync.json";

/// Settings read from `.config/pgsync.json`. Every field is optional; flags
/// and environment variables take precedence.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Database connection URL
    pub database_url: Option<String>,
    /// Project whose schema is synchronized
    pub project: Option<String>,
    /// Take the per-project advisory lock (on unless set to false)
    pub lock: Option<bool>,
    /// Drop tables the desired schema does not name
    pub drop_unknown_tables: bool,
}

/// Load configuration from `.config/pgsync.json`, searching up the directory tree.
pub fn load() -> Result<(Config, PathBuf), ConfigError> {
    let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
    load_from(&cwd)
}

/// Load configuration starting from a specific directory.
pub fn load_from(start: &Path) -> Result<(Config, PathBuf), ConfigError> {
    let config_path = find_config_file(start)?;
    let content = std::fs::read_to_string(&config_path).map_err(ConfigError::Io)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok((config, config_path))
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default() -> Result<Config, ConfigError> {
    match load() {
        Ok((config, path)) => {
            tracing::debug!(path = %path.display(), "loaded config");
            Ok(config)
        }
        Err(ConfigError::NotFound) => Ok(Config::default()),
        Err(e) => Err(e),
    }
}

/// Find `.config/pgsync.json` by searching up the directory tree.
fn find_config_file(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(config_path);
        }

        if !current.pop() {
            return Err(ConfigError::NotFound);
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No `.config/pgsync.json` found in any parent directory
    #[error("no {CONFIG_FILE} found in current directory or any parent")]
    NotFound,
    /// I/O error reading the file
    #[error("failed to read {CONFIG_FILE}: {0}")]
    Io(#[source] std::io::Error),
    /// Parse error in the JSON file
    #[error("failed to parse {CONFIG_FILE}: {0}")]
    Parse(#[from] serde_json::Error),
}
