//! Workbench configuration: defaults for connection parameters and
//! decoder execution, persisted as TOML under the user's config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_DIR_NAME: &str = "logicbench";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the user config directory")]
    NoConfigDir,
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write config file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbenchConfig {
    pub default_serial_port: Option<String>,
    pub default_baud_rate: u32,
    pub default_network_host: String,
    pub default_network_port: u16,
    pub detection_cache_ttl_secs: u64,
    pub decoder_chunk_samples: usize,
    pub auto_connect_retries: u8,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            default_serial_port: None,
            default_baud_rate: 115_200,
            default_network_host: "0.0.0.0".to_string(),
            default_network_port: 24_000,
            detection_cache_ttl_secs: 30,
            decoder_chunk_samples: crate::decode::DEFAULT_CHUNK_SAMPLES,
            auto_connect_retries: 3,
        }
    }
}

impl WorkbenchConfig {
    /// Loads from the platform config directory, falling back to
    /// defaults if no file exists yet.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::default_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn save(&self) -> ConfigResult<()> {
        let path = Self::default_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir { path: parent.to_path_buf(), source })?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    pub fn default_path() -> ConfigResult<PathBuf> {
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Sets a single field by its TOML key name, used by the CLI's
    /// `config set <key> <value>` command.
    pub fn set_field(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "default_serial_port" => self.default_serial_port = Some(value.to_string()),
            "default_baud_rate" => self.default_baud_rate = parse_field(key, value)?,
            "default_network_host" => self.default_network_host = value.to_string(),
            "default_network_port" => self.default_network_port = parse_field(key, value)?,
            "detection_cache_ttl_secs" => self.detection_cache_ttl_secs = parse_field(key, value)?,
            "decoder_chunk_samples" => self.decoder_chunk_samples = parse_field(key, value)?,
            "auto_connect_retries" => self.auto_connect_retries = parse_field(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.parse().map_err(|_| ConfigError::UnknownKey(format!("{key}={value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = WorkbenchConfig::default();
        assert_eq!(cfg.default_baud_rate, 115_200);
        assert_eq!(cfg.default_network_port, 24_000);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = std::env::temp_dir().join(format!("logicbench-config-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut cfg = WorkbenchConfig::default();
        cfg.default_baud_rate = 9600;
        cfg.save_to(&path).unwrap();
        let loaded = WorkbenchConfig::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("logicbench-config-test-missing-does-not-exist.toml");
        let loaded = WorkbenchConfig::load_from(&path).unwrap();
        assert_eq!(loaded, WorkbenchConfig::default());
    }

    #[test]
    fn set_field_rejects_unknown_key() {
        let mut cfg = WorkbenchConfig::default();
        assert!(matches!(cfg.set_field("nonexistent", "1"), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn set_field_updates_baud_rate() {
        let mut cfg = WorkbenchConfig::default();
        cfg.set_field("default_baud_rate", "9600").unwrap();
        assert_eq!(cfg.default_baud_rate, 9600);
    }
}
