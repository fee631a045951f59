use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::trace;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    Memory,

    /// SQLite database (default)
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleet.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HubConfig {
    /// Gateway bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Base64-encoded 32-byte key for the backup credential cipher. Falls
    /// back to the FLEET_CREDENTIAL_KEY environment variable when absent.
    pub credential_key: Option<String>,

    /// Webhook endpoint for alert notifications. No webhook means alerts
    /// are stored and broadcast but not pushed anywhere.
    pub alert_webhook_url: Option<String>,

    /// Maximum retries per command before it fails terminally.
    #[serde(default = "default_max_retries")]
    pub command_max_retries: u32,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_max_retries() -> u32 {
    crate::commands::DEFAULT_MAX_RETRIES
}

pub fn read_config_file(path: &str) -> anyhow::Result<HubConfig> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config: &HubConfig| trace!("loaded config: {config:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: HubConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert!(matches!(config.storage, StorageConfig::Sqlite { .. }));
        assert_eq!(config.command_max_retries, 3);
        assert!(config.alert_webhook_url.is_none());
    }

    #[test]
    fn memory_storage_is_selectable() {
        let config: HubConfig =
            serde_json::from_str(r#"{"storage": {"backend": "memory"}}"#).unwrap();
        assert!(matches!(config.storage, StorageConfig::Memory));
    }
}
