pub mod link_config;
pub mod logging_config;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::link_config::LinkConfig;
use crate::config::logging_config::LoggingConfig;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "printer_link.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads the config from `config_dir`, falling back to defaults when
    /// no file exists yet.
    pub async fn load_config<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let file_path = config_dir.as_ref().join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;
        config.link.validate()?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the config into `config_dir`, creating the directory if needed.
    pub async fn save_config<P: AsRef<Path>>(&self, config_dir: P) -> Result<()> {
        let config_dir = config_dir.as_ref();
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize link config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("Link config saved to {:?}.", file_path_str);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("settings").join("printer");
        let mut config = AppConfig::default();
        config.link.max_connect_attempts = 5;
        config.logging.level = "debug".into();

        config.save_config(&nested).await.unwrap();
        assert!(nested.join(CONFIG_FILE_NAME).exists());

        let loaded = AppConfig::load_config(&nested).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "link": { "max_connect_attempts": 0 } }"#,
        )
        .await
        .unwrap();
        assert!(AppConfig::load_config(dir.path()).await.is_err());

        fs::write(dir.path().join(CONFIG_FILE_NAME), "not json")
            .await
            .unwrap();
        assert!(AppConfig::load_config(dir.path()).await.is_err());
    }
}
