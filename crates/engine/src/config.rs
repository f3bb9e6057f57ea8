//! Engine configuration management

use crate::usb::{SessionSettings, TransferTimeouts, WorkerSettings};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "EngineSettings::default_log_level")]
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl EngineSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Allowed devices as VID:PID patterns; empty allows every device
    #[serde(default)]
    pub filters: Vec<String>,
    /// Claim the read and write interfaces when a device is opened
    #[serde(default)]
    pub claim_on_open: bool,
    /// Detach kernel drivers (usbhid) from interfaces before claiming them
    ///
    /// With this off a claim is no longer forced: an interface still bound
    /// to a kernel driver fails with `InterfaceClaimFailed`.
    #[serde(default = "UsbSettings::default_detach_kernel_driver")]
    pub detach_kernel_driver: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            claim_on_open: false,
            detach_kernel_driver: Self::default_detach_kernel_driver(),
        }
    }
}

impl UsbSettings {
    fn default_detach_kernel_driver() -> bool {
        true
    }
}

/// Transfer timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Used by reads that pass a timeout of 0
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub default_read_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: Self::default_timeout_ms(),
            control_timeout_ms: Self::default_timeout_ms(),
            default_read_timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl TransferSettings {
    fn default_timeout_ms() -> u64 {
        1000
    }

    pub fn timeouts(&self) -> TransferTimeouts {
        TransferTimeouts {
            read: Duration::from_millis(self.default_read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
            control: Duration::from_millis(self.control_timeout_ms),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hid-transport/engine.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
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

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hid-transport").join("engine.toml")
        } else {
            PathBuf::from(".config/hid-transport/engine.toml")
        }
    }

    /// Session settings derived from `[usb]` and `[transfer]`
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            timeouts: self.transfer.timeouts(),
            claim_on_open: self.usb.claim_on_open,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            filters: self.usb.filters.clone(),
            session: self.session_settings(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.engine.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.engine.log_level,
                valid_levels.join(", ")
            ));
        }

        // Validate USB filters (VID:PID format)
        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let timeouts = [
            ("write_timeout_ms", self.transfer.write_timeout_ms),
            ("control_timeout_ms", self.transfer.control_timeout_ms),
            ("default_read_timeout_ms", self.transfer.default_read_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(anyhow!("Invalid {} '0', must be greater than 0", name));
            }
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name,
                    id
                )
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<EngineConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    EngineConfig::load(Some(path_buf))
}
