use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::types::{Config, PolicyKind};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

impl Config {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/swapgate/config.toml` on Unix/macOS,
    /// or equivalent on other platforms via `dirs::config_dir()`.
    /// Falls back to current directory if config_dir is unavailable.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("swapgate").join("config.toml")
    }

    /// Loads configuration from the default config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`.
    ///
    /// - If the file doesn't exist, returns `Config::default()`.
    /// - If the file exists, parses it as TOML.
    ///
    /// Validation is left to the caller so command-line overrides can be
    /// applied first.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validates the configuration.
    ///
    /// Checks:
    /// - A backend command is configured
    /// - Listener addresses parse
    /// - Every selected policy has the settings it needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.command.trim().is_empty() {
            return Err(invalid("backend.command must be set"));
        }

        parse_addr("proxy.bind_addr", &self.proxy.bind_addr)?;
        if let Some(addr) = self.proxy.tunnel_addr() {
            parse_addr("proxy.tunnel_bind_addr", addr)?;
        }

        if let Some(prefix) = &self.proxy.admin_prefix {
            if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
                return Err(invalid(format!(
                    "proxy.admin_prefix '{}' must start with '/' and not end with '/'",
                    prefix
                )));
            }
        }

        if !self.backend.artifact_path.starts_with('/') {
            return Err(invalid("backend.artifact_path must start with '/'"));
        }

        if self.swap.policies.is_empty() {
            return Err(invalid("swap.policies must name at least one policy"));
        }

        for policy in &self.swap.policies {
            match policy {
                PolicyKind::ColdStart => {}
                PolicyKind::NthRequest => {
                    if !matches!(self.swap.nth_request, Some(n) if n > 0) {
                        return Err(invalid(
                            "swap.nth_request must be a positive number for the nth_request policy",
                        ));
                    }
                }
                PolicyKind::Path => {
                    if self.swap.path_contains.as_deref().map_or(true, str::is_empty) {
                        return Err(invalid(
                            "swap.path_contains must be set for the path policy",
                        ));
                    }
                }
                PolicyKind::StaleSource => {
                    if self.swap.watch_paths.is_empty() {
                        return Err(invalid(
                            "swap.watch_paths must be set for the stale_source policy",
                        ));
                    }
                }
            }
        }

        if self.swap.eager_on_change && self.swap.watch_paths.is_empty() {
            return Err(invalid("swap.eager_on_change requires swap.watch_paths"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| invalid(format!("{} '{}' is not a valid address: {}", field, value, e)))
}
