//! Configuration loading for the bosh HTTP binding.
//!
//! Everything here is read once at process start and then handed to the
//! session manager as an immutable value. Nothing in the session layer
//! reads configuration on its own.
//!
//! # Usage
//!
//! ```rust,no_run
//! use boshconf::BoshConfig;
//!
//! let config = BoshConfig::load().expect("Failed to load config");
//! println!("inactivity: {}s", config.httpbind.inactivity_timeout);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/bosh/config.toml` (system)
//! 2. `~/.config/bosh/config.toml` (user)
//! 3. `./bosh.toml` (local override, replaced by an explicit path)
//! 4. Environment variables (`BOSH_*`)
//!
//! # Example Config
//!
//! ```toml
//! [httpbind]
//! inactivity_timeout = 1800
//! max_requests = 2
//! polling_interval = 5
//! ```

pub mod httpbind;
pub mod loader;

pub use httpbind::HttpBindConfig;
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key} in {path}: {message}")]
    Invalid {
        path: PathBuf,
        key: String,
        message: String,
    },
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BoshConfig {
    /// Session layer parameters.
    #[serde(default)]
    pub httpbind: HttpBindConfig,
}

impl BoshConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` standing in for `./bosh.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = BoshConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::load_from_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# bosh configuration\n\n");
        output.push_str("[httpbind]\n");
        output.push_str(&format!(
            "inactivity_timeout = {}\n",
            self.httpbind.inactivity_timeout
        ));
        output.push_str(&format!("max_requests = {}\n", self.httpbind.max_requests));
        output.push_str(&format!(
            "polling_interval = {}\n",
            self.httpbind.polling_interval
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BoshConfig::default();
        assert_eq!(config.httpbind.inactivity_timeout, 1800);
        assert_eq!(config.httpbind.max_requests, 2);
        assert_eq!(config.httpbind.polling_interval, 5);
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = BoshConfig::default();
        config.httpbind.max_requests = 3;

        let rendered = config.to_toml();
        assert!(rendered.contains("[httpbind]"));

        let parsed: BoshConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[httpbind]\npolling_interval = 0").unwrap();

        let (config, sources) = BoshConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.httpbind.polling_interval, 0);
        assert!(sources.files.iter().any(|p| p == file.path()));
    }

    #[test]
    fn test_load_from_broken_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[httpbind\nmax_requests = ").unwrap();

        let err = BoshConfig::load_from(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
