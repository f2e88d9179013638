pub mod connection_config;
pub mod scan_config;

use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::connection_config::ConnectionConfig;
use crate::config::scan_config::ScanConfig;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "ble_bridge_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub connection: ConnectionConfig,
    /// One of `off`, `error`, `warn`, `info`, `debug`, `trace`
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            scan: ScanConfig::default(),
            connection: ConnectionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the config from a configuration file, falling back to defaults when it is missing.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!(
                "Config file not found at {:?}, using default.",
                file_path_str
            );
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path)
            .await
            .with_context(|| format!("Failed to read config file {}", file_path_str))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("Invalid config file {}", file_path_str))?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Config saved to {:?}", file_path_str);
        Ok(())
    }

    /// Parsed `log_level`; unknown values mean `info`.
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::ScanMode;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_config(&dir.path().join(CONFIG_FILE_NAME))
            .await
            .unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.scan.mode, ScanMode::LowLatency);
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = AppConfig::default();
        config.scan.mode = ScanMode::Balanced;
        config.connection.default_auto_connect = true;
        config.log_level = "debug".to_string();
        config.save_config(&path).await.unwrap();

        let loaded = AppConfig::load_config(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.level_filter(), LevelFilter::Debug);
    }

    #[tokio::test]
    async fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, r#"{ "scan": { "mode": "lowPower" } }"#)
            .await
            .unwrap();

        let loaded = AppConfig::load_config(&path).await.unwrap();
        assert_eq!(loaded.scan.mode, ScanMode::LowPower);
        assert_eq!(loaded.connection, ConnectionConfig::default());
        assert_eq!(loaded.log_level, "info");
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(AppConfig::load_config(&path).await.is_err());
    }

    #[test]
    fn unknown_log_level_means_info() {
        let config = AppConfig {
            log_level: "chatty".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.level_filter(), LevelFilter::Info);
    }
}
