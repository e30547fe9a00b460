//! Config file discovery, loading, and environment variable overlay.

use crate::{BoshConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/bosh/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("bosh/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("bosh.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load a TOML file on top of `config`.
///
/// Keys the file does not mention keep their current values.
pub fn load_from_file(config: &mut BoshConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Apply the keys present in a TOML document to `config`.
pub fn apply_toml(config: &mut BoshConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let Some(httpbind) = table.get("httpbind") else {
        return Ok(());
    };
    let httpbind = httpbind.as_table().ok_or_else(|| ConfigError::Invalid {
        path: path.to_path_buf(),
        key: "httpbind".to_string(),
        message: "expected a table".to_string(),
    })?;

    if let Some(v) = httpbind.get("inactivity_timeout") {
        config.httpbind.inactivity_timeout = unsigned(v, "httpbind.inactivity_timeout", path)?;
    }
    if let Some(v) = httpbind.get("max_requests") {
        let requests = unsigned(v, "httpbind.max_requests", path)?;
        config.httpbind.max_requests =
            u32::try_from(requests).map_err(|_| ConfigError::Invalid {
                path: path.to_path_buf(),
                key: "httpbind.max_requests".to_string(),
                message: format!("{} is too large", requests),
            })?;
    }
    if let Some(v) = httpbind.get("polling_interval") {
        config.httpbind.polling_interval = unsigned(v, "httpbind.polling_interval", path)?;
    }

    Ok(())
}

fn unsigned(value: &toml::Value, key: &str, path: &Path) -> Result<u64, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        path: path.to_path_buf(),
        key: key.to_string(),
        message,
    };

    let n = value
        .as_integer()
        .ok_or_else(|| invalid(format!("expected an integer, got {}", value.type_str())))?;
    u64::try_from(n).map_err(|_| invalid(format!("{} is negative", n)))
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut BoshConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Values that do not parse are ignored and not recorded in `sources`.
pub fn apply_overrides_from<F>(config: &mut BoshConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("BOSH_INACTIVITY_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
        config.httpbind.inactivity_timeout = v;
        sources.env_overrides.push("BOSH_INACTIVITY_TIMEOUT".to_string());
    }
    if let Some(v) = lookup("BOSH_MAX_REQUESTS").and_then(|v| v.trim().parse().ok()) {
        config.httpbind.max_requests = v;
        sources.env_overrides.push("BOSH_MAX_REQUESTS".to_string());
    }
    if let Some(v) = lookup("BOSH_POLLING_INTERVAL").and_then(|v| v.trim().parse().ok()) {
        config.httpbind.polling_interval = v;
        sources.env_overrides.push("BOSH_POLLING_INTERVAL".to_string());
    }
}
