// Configuration management for the peerlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/peerlink/config.json
// - Linux: ~/.config/peerlink/config.json
// - Windows: %APPDATA%\peerlink\config.json

use anyhow::{Context, Result};
use peerlink_core::transport::ble::PeerIdentifier;
use peerlink_core::LinkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to the link
    pub link: LinkConfig,

    /// Log filter used when RUST_LOG is not set
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            log_filter: "warn".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("peerlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or defaults if none exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.link.validate().context("Invalid link configuration")?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Set a config value; the result must still validate
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "service_name" => updated.link.service_name = value.to_string(),
            "responder_identifier" => {
                updated.link.responder_identifier = parse_identifier(value)?;
            }
            "initiator_identifier" => {
                updated.link.initiator_identifier = parse_identifier(value)?;
            }
            "encrypted_channel" => {
                updated.link.encrypted_channel =
                    value.parse().context("Invalid boolean value")?;
            }
            "max_message_bytes" => {
                updated.link.max_message_bytes = value.parse().context("Invalid number")?;
            }
            "event_queue_depth" => {
                updated.link.event_queue_depth = value.parse().context("Invalid number")?;
            }
            "log_filter" => updated.log_filter = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.link.validate().context("Invalid link configuration")?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("service_name".to_string(), self.link.service_name.clone()),
            (
                "responder_identifier".to_string(),
                self.link.responder_identifier.to_string(),
            ),
            (
                "initiator_identifier".to_string(),
                self.link.initiator_identifier.to_string(),
            ),
            (
                "encrypted_channel".to_string(),
                self.link.encrypted_channel.to_string(),
            ),
            (
                "max_message_bytes".to_string(),
                self.link.max_message_bytes.to_string(),
            ),
            (
                "event_queue_depth".to_string(),
                self.link.event_queue_depth.to_string(),
            ),
            ("log_filter".to_string(), self.log_filter.clone()),
        ]
    }
}

fn parse_identifier(value: &str) -> Result<PeerIdentifier> {
    let uuid = Uuid::parse_str(value).context("Invalid UUID")?;
    Ok(PeerIdentifier(uuid))
}
