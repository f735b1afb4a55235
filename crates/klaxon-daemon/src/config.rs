//! Daemon configuration.
//!
//! Loaded from a TOML file (`--config`, falling back to
//! `/etc/klaxon/klaxond.toml` when present); every field has a default so
//! an empty or absent file yields a runnable daemon.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/klaxon/klaxond.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub control: ControlConfig,
}

impl Config {
    /// Load from an explicit path, or from the default path if that file
    /// exists, or fall back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                debug!("Loading config from {:?}", path);
                let contents = fs::read_to_string(path)?;
                Ok(toml::from_str(&contents)?)
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    debug!("Loading config from {:?}", path);
                    let contents = fs::read_to_string(path)?;
                    Ok(toml::from_str(&contents)?)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Control socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Path the control listener binds to
    pub socket: PathBuf,
    /// Longest accepted request line, in bytes; clients exceeding it are
    /// disconnected
    pub max_line: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/klaxon/klaxond.sock"),
            max_line: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.control.socket, PathBuf::from("/run/klaxon/klaxond.sock"));
        assert_eq!(config.control.max_line, 512);
    }

    #[test]
    fn test_partial_config_overrides_one_field() {
        let config: Config = toml::from_str(
            r#"
[control]
socket = "/tmp/test-klaxond.sock"
"#,
        )
        .unwrap();
        assert_eq!(config.control.socket, PathBuf::from("/tmp/test-klaxond.sock"));
        assert_eq!(config.control.max_line, 512);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let parsed: Config = toml::from_str(&Config::default_toml()).unwrap();
        assert_eq!(parsed.control.max_line, Config::default().control.max_line);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/klaxond.toml")));
        assert!(matches!(err, Err(ConfigError::Io(_))));
    }
}
