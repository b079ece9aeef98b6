pub mod catalog;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{CONNECT_RETRIES, CONNECT_RETRY_DELAY_MS, DEFAULT_MTU, DEFAULT_SCAN_DURATION_SECS};
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "gatt_adaptor_config.json";

/// Adaptor settings, stored as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptorConfig {
    /// Connection attempts before a connect gives up
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    /// MTU assumed until an exchange succeeds
    pub default_mtu: u16,
    pub scan_duration_secs: u64,
    /// MTU requested after connecting, 0 for none
    pub requested_mtu: u16,
    /// Bond after connecting
    pub bond: bool,
    /// Republish this crate's log records as adaptor events
    pub deep_logging: bool,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        AdaptorConfig {
            connect_retries: CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            default_mtu: DEFAULT_MTU,
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            requested_mtu: 0,
            bond: false,
            deep_logging: false,
        }
    }
}

impl AdaptorConfig {
    /// Loads the config from `path`, falling back to the defaults if the file is missing.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref();
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the config to `path`, creating parent directories as needed.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let file_path = path.as_ref();
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize adaptor config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Adaptor config saved to {:?}.", file_path_str);
        Ok(())
    }
}
