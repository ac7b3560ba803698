//! The persisted configuration blob: a single JSON object holding the
//! device and model lists. Unknown fields are tolerated on load so that
//! hand-edited files survive round trips.

use crate::error::{Result, TuyaError};
use crate::model::Model;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One configured device. `name`, `id` and `key` identify and unlock the
/// device; `model` enables sensing and control once the model table maps
/// it to a data point. `host` is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuyaConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub models: Vec<Model>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub tuya: TuyaConfig,
}

/// Parse a configuration blob. A parse error leaves the caller's live
/// state untouched; nothing is applied from here.
pub fn parse(data: &str) -> Result<ConfigFile> {
    serde_json::from_str(data).map_err(|e| TuyaError::Config(e.to_string()))
}

/// Load the configuration file. A missing file is not an error: the
/// daemon starts empty and discovery fills the table.
pub fn load(path: &Path) -> Result<ConfigFile> {
    match std::fs::read_to_string(path) {
        Ok(data) => {
            let config = parse(&data)?;
            info!(
                "loaded {} devices, {} models from {}",
                config.tuya.devices.len(),
                config.tuya.models.len(),
                path.display()
            );
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no configuration at {}, starting empty", path.display());
            Ok(ConfigFile::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Write the configuration file.
pub fn save(path: &Path, config: &ConfigFile) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)?;
    info!("configuration saved to {}", path.display());
    Ok(())
}
