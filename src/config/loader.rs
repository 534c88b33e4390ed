//! Configuration loading from disk.
//!
//! Reads `~/.cashshuffle/config` if present; a missing file just yields the
//! defaults. The same directory holds the ACME certificate cache.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::schema::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// `~/.cashshuffle`, or `None` when no home directory can be resolved.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cashshuffle"))
}

/// Load configuration from the default location.
pub fn load() -> Result<ServerConfig, ConfigError> {
    let Some(path) = config_dir().map(|dir| dir.join("config")) else {
        return Ok(ServerConfig::default());
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ServerConfig::default());
        }
        Err(err) => return Err(err.into()),
    };

    Ok(toml::from_str(&content)?)
}
