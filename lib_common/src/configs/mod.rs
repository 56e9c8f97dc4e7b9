//! # Configuration Modules
//!
//! Layered configuration for the two binaries. Each value is resolved from,
//! in increasing priority:
//!
//! 1. built-in defaults,
//! 2. a JSON file with camelCase keys (`--config-path`, or the binary's default
//!    file name in the working directory),
//! 3. environment variables and command-line flags (`clap`).
//!
//! A layer only overrides what it sets. The merged, all-`Option` config is
//! then resolved into a concrete settings struct the binary runs with.

use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// `serial_reader` configuration.
pub mod config_reader;
/// `server_ingest` configuration.
pub mod config_server;

pub use config_reader::{ReaderConfig, ReaderSettings};
pub use config_server::{ServerConfig, ServerSettings, StoreBackend};

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value needed by the selected setup is not set anywhere.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A value is set but unusable.
    #[error("invalid value for `{field}`: {value}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// The config file exists but could not be read or parsed.
    #[error("config file {path}: {reason}")]
    File {
        /// File path.
        path: PathBuf,
        /// Read or parse error.
        reason: String,
    },
}

/// Reads the JSON layer. A missing file is not an error; an unreadable or
/// malformed one is.
pub(crate) fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return Ok(None);
    }

    let raw = fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    serde_json::from_str(&raw).map(Some).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
