//! Configuration for rexec.
//!
//! The configuration file is located at `~/.rexec/config.toml`:
//!
//! ```toml
//! # Log level written to ~/.rexec/rexec.log (overridden by RUST_LOG)
//! log_level = "info"
//!
//! [session]
//! # How long queued frames may keep flushing after a session closes
//! close_grace_ms = 250
//! # Capacity of the outbound frame queue
//! outbound_queue = 64
//! # Print a notice when an interactive session's remote process exits
//! exit_notice = true
//! ```
//!
//! A missing file means the defaults.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::SessionConfig;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level name (error, warn, info, debug, trace)
    pub log_level: String,
    /// Session settings
    pub session: SessionSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            session: SessionSection::default(),
        }
    }
}

/// `[session]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub close_grace_ms: u64,
    pub outbound_queue: usize,
    pub exit_notice: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            close_grace_ms: defaults.close_grace.as_millis() as u64,
            outbound_queue: defaults.outbound_queue,
            exit_notice: defaults.exit_notice,
        }
    }
}

impl Config {
    /// Load configuration from file.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an
    /// error the caller may fall back from.
    pub fn load() -> Result<Self, String> {
        let Some(path) = Self::get_config_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map_err(|e| format!("Invalid config {}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file, returning where it was written
    pub fn save(&self) -> Result<PathBuf, String> {
        if let Some(path) = Self::get_config_path() {
            let content = toml::to_string_pretty(self)
                .map_err(|e| format!("Failed to serialize config: {}", e))?;
            fs::write(&path, content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
            Ok(path)
        } else {
            Err("Could not determine config path".to_string())
        }
    }

    /// `~/.rexec`, created on demand
    pub fn get_config_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".rexec");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        Self::get_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Session settings for the registry
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            close_grace: Duration::from_millis(self.session.close_grace_ms),
            outbound_queue: self.session.outbound_queue.max(1),
            exit_notice: self.session.exit_notice,
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.session_config().close_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_session_table() {
        let config = Config::parse(
            r#"
            log_level = "debug"

            [session]
            close_grace_ms = 0
            outbound_queue = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.session.exit_notice);

        let session = config.session_config();
        assert_eq!(session.close_grace, Duration::ZERO);
        assert_eq!(session.outbound_queue, 1);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = Config::default();
        config.session.exit_notice = false;
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_type_is_an_error() {
        assert!(Config::parse("[session]\nclose_grace_ms = \"soon\"").is_err());
    }
}
