//! nearchat CLI configuration
//!
//! Loaded from an optional TOML file, then overridden by command-line flags:
//!
//! ```toml
//! backend = "bluez"
//!
//! [chat]
//! chat_name = "Lunch"
//! handshake_timeout_ms = 10000
//!
//! [log]
//! filter = "nearchat_ble=debug,info"
//! ```

use std::path::Path;

use nearchat_core::ChatConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::Cli;
use crate::error::Result;

/// Radio the engines run on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulated radio
    Sim,
    /// Linux Bluetooth stack
    #[default]
    Bluez,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Include the module path in each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            with_target: false,
        }
    }
}

/// Complete configuration for the CLI
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub chat: ChatConfig,
    pub log: LogConfig,
    pub backend: Backend,
}

impl CliConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.chat.validate()?;
        Ok(config)
    }

    /// Apply command-line flags on top of file values
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(backend) = cli.backend {
            self.backend = backend;
        }
        if cli.verbose {
            self.log.filter = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Commands;
    use crate::error::CliError;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CliConfig::from_toml(
            r#"
            backend = "sim"

            [chat]
            chat_name = "Lunch"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, Backend::Sim);
        assert_eq!(config.chat.chat_name, "Lunch");
        assert_eq!(config.chat.max_frame_size, ChatConfig::default().max_frame_size);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(CliConfig::from_toml("").unwrap(), CliConfig::default());
    }

    #[test]
    fn test_invalid_chat_config_rejected() {
        let result = CliConfig::from_toml(
            r#"
            [chat]
            chat_name = ""
            "#,
        );
        assert!(matches!(result, Err(CliError::Chat(_))));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(matches!(
            CliConfig::from_toml("backend = "),
            Err(CliError::TomlParsing(_))
        ));
    }

    #[test]
    fn test_flags_override_file() {
        let mut config = CliConfig::from_toml("backend = \"bluez\"").unwrap();
        let cli = Cli {
            command: Commands::Demo,
            verbose: true,
            config: None,
            backend: Some(Backend::Sim),
        };
        config.apply_overrides(&cli);
        assert_eq!(config.backend, Backend::Sim);
        assert_eq!(config.log.filter, "debug");
    }
}
