//! Configuration error types

use std::net::AddrParseError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid address for {field} ({value}): {source}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        source: AddrParseError,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Failed to render configuration: {0}")]
    SerializeError(toml::ser::Error),

    #[error("Failed to write config file at {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
