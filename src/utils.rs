use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use log::{error, info};
use regex::Regex;
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

fn mac_pattern() -> Option<&'static Regex> {
    static MAC: OnceLock<Option<Regex>> = OnceLock::new();
    MAC.get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()
}

/// Pulls the last MAC address out of a platform device id, uppercased.
pub fn extract_mac_address(device_id_str: &str) -> Option<String> {
    mac_pattern()?
        .find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

/// Stable address for a platform device id: its MAC when one is embedded,
/// the raw id otherwise.
pub fn device_address(device_id_str: &str) -> String {
    extract_mac_address(device_id_str).unwrap_or_else(|| device_id_str.to_string())
}
