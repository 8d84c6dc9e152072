//! Controller configuration management

use crate::persistent::{
    BackoffPolicy, DEFAULT_MAX_DELAY_SECS, DEFAULT_SLICE_SECS, DEFAULT_UNIT_SECS,
    PersistentDeviceEntry,
};
use anyhow::{Context, Result, anyhow};
use protocol::MAX_PORTS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of root hub ports
pub const DEFAULT_NUM_PORTS: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VhciConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub persistent: PersistentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_num_ports")]
    pub num_ports: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Replay persisted devices at startup
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backoff unit; a round waits `unit * attempt / pending`
    #[serde(default = "default_unit_secs")]
    pub unit_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// How often a sleeping worker checks for shutdown
    #[serde(default = "default_slice_secs")]
    pub sleep_slice_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentSettings {
    /// `host,service,busid` per device
    #[serde(default)]
    pub devices: Vec<String>,
}

fn default_num_ports() -> usize {
    DEFAULT_NUM_PORTS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_unit_secs() -> u64 {
    DEFAULT_UNIT_SECS
}

fn default_max_delay_secs() -> u64 {
    DEFAULT_MAX_DELAY_SECS
}

fn default_slice_secs() -> u64 {
    DEFAULT_SLICE_SECS
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            num_ports: default_num_ports(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            unit_secs: DEFAULT_UNIT_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            sleep_slice_secs: DEFAULT_SLICE_SECS,
        }
    }
}

impl ReconnectSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            unit: Duration::from_secs(self.unit_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            slice: Duration::from_secs(self.sleep_slice_secs),
        }
    }
}

impl VhciConfig {
    /// Load configuration from the specified path
    ///
    /// A leading `~` in `path` is expanded to the home directory.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_home(&p)
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-vhci/vhci.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: VhciConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: {} ports, {} persistent devices, reconnect {}",
            config.controller.num_ports,
            config.persistent.devices.len(),
            if config.reconnect.enabled { "on" } else { "off" }
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                // Logging is not up yet
                eprintln!("Config: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-vhci").join("vhci.toml")
        } else {
            PathBuf::from(".config/usbip-vhci/vhci.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.controller.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.controller.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(1..=MAX_PORTS).contains(&self.controller.num_ports) {
            return Err(anyhow!(
                "num_ports must be between 1 and {}, got {}",
                MAX_PORTS,
                self.controller.num_ports
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.unit_secs == 0 || reconnect.sleep_slice_secs == 0 {
            return Err(anyhow!("unit_secs and sleep_slice_secs must be positive"));
        }

        // Persisted devices are parsed when the replay starts; a bad line
        // is dropped there instead of failing startup
        let malformed = self
            .persistent
            .devices
            .iter()
            .filter(|line| line.parse::<PersistentDeviceEntry>().is_err())
            .count();
        if malformed > 0 {
            tracing::warn!("{} persistent devices are malformed and will be skipped", malformed);
        }

        Ok(())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VhciConfig::default();
        assert_eq!(config.controller.num_ports, DEFAULT_NUM_PORTS);
        assert_eq!(config.controller.log_level, "info");
        assert!(config.reconnect.enabled);
        assert!(config.persistent.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_backoff_matches_policy() {
        let config = VhciConfig::default();
        assert_eq!(config.reconnect.backoff_policy(), BackoffPolicy::default());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: VhciConfig = toml::from_str("").unwrap();
        assert_eq!(config.controller.num_ports, DEFAULT_NUM_PORTS);
        assert_eq!(config.reconnect.unit_secs, 10);
    }

    #[test]
    fn test_partial_sections() {
        let config: VhciConfig = toml::from_str(
            r#"
            [controller]
            num_ports = 4

            [persistent]
            devices = ["pi5,3240,1-1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.controller.num_ports, 4);
        assert_eq!(config.controller.log_level, "info");
        assert_eq!(config.persistent.devices.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = VhciConfig::default();
        config.persistent.devices.push("pi5,3240,1-1".into());

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: VhciConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.persistent.devices, config.persistent.devices);
        assert_eq!(parsed.reconnect.max_delay_secs, 1800);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = VhciConfig::default();
        config.controller.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.controller.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_num_ports() {
        let mut config = VhciConfig::default();
        config.controller.num_ports = 0;
        assert!(config.validate().is_err());

        config.controller.num_ports = MAX_PORTS + 1;
        assert!(config.validate().is_err());

        config.controller.num_ports = MAX_PORTS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reconnect() {
        let mut config = VhciConfig::default();
        config.reconnect.sleep_slice_secs = 0;
        assert!(config.validate().is_err());

        let mut config = VhciConfig::default();
        config.reconnect.unit_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_persistent_device_does_not_fail_validation() {
        let mut config = VhciConfig::default();
        config.persistent.devices.push("not-a-device".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vhci.toml");

        let mut config = VhciConfig::default();
        config.controller.num_ports = 16;
        config.persistent.devices.push("pi5,3240,1-1.2".into());
        config.save(&path).unwrap();

        let loaded = VhciConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.controller.num_ports, 16);
        assert_eq!(loaded.persistent.devices, vec!["pi5,3240,1-1.2"]);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vhci.toml");
        fs::write(&path, "[controller]\nnum_ports = 0\n").unwrap();

        assert!(VhciConfig::load(Some(path.clone())).is_err());
        assert_eq!(
            VhciConfig::load_or_default(Some(path)).controller.num_ports,
            DEFAULT_NUM_PORTS
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VhciConfig::load(Some(dir.path().join("missing.toml"))).is_err());
    }
}
