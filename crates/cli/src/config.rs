//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use bridge::{DeviceIdentity, LineSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub port: PortSettings,
    /// Terminal settings applied to the port on open; stored only
    #[serde(default)]
    pub line: LineSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which USB device to bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Vendor id as a `0x` hex string
    pub vendor_id: String,
    /// Product id as a `0x` hex string
    pub product_id: String,
    /// How long commands wait for the device to show up
    pub attach_timeout_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        // Linux gadget serial
        Self {
            vendor_id: "0x0525".to_string(),
            product_id: "0xa4a7".to_string(),
            attach_timeout_ms: Self::default_attach_timeout(),
        }
    }
}

impl DeviceSettings {
    fn default_attach_timeout() -> u64 {
        5000
    }

    pub fn identity(&self) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity::new(
            parse_hex_id(&self.vendor_id, "vendor_id")?,
            parse_hex_id(&self.product_id, "product_id")?,
        ))
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Port name prefix; the slot number is appended
    pub name: String,
    /// Number of devices that can be bridged at once
    pub slots: u8,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            name: "ttyMYUSB".to_string(),
            slots: 1,
        }
    }
}

/// Request/response policy of the `send` command and console
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub response_timeout_ms: u64,
    /// Reply line (without newline) that ends a request
    pub expected_reply: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3000,
            expected_reply: "Done".to_string(),
        }
    }
}

impl ClientSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-tty-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
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
                tracing::debug!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
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

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-tty-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usb-tty-bridge/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.log_level,
                valid_levels.join(", ")
            ));
        }

        validate_hex_id(&self.device.vendor_id, "vendor_id")?;
        validate_hex_id(&self.device.product_id, "product_id")?;

        if self.port.slots == 0 {
            return Err(anyhow!("port.slots must be at least 1"));
        }
        if self.port.name.is_empty() {
            return Err(anyhow!("port.name must not be empty"));
        }

        if !self.line.has_standard_baud() {
            return Err(anyhow!(
                "Unsupported baud rate {}, must be one of: {:?}",
                self.line.baud_rate,
                bridge::port::STANDARD_BAUD_RATES
            ));
        }
        if !self.line.has_valid_data_bits() {
            return Err(anyhow!(
                "Invalid data_bits {}, must be between 5 and 8",
                self.line.data_bits
            ));
        }

        if self.client.expected_reply.contains('\n') {
            return Err(anyhow!("client.expected_reply must be a single line"));
        }

        Ok(())
    }
}

/// Validate a hex ID (vendor or product)
fn validate_hex_id(id: &str, name: &str) -> Result<()> {
    parse_hex_id(id, name).map(|_| ())
}

fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x0525')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Expand `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.logging.log_level, "info");
        assert_eq!(config.port.name, "ttyMYUSB");
        assert_eq!(config.port.slots, 1);
        assert_eq!(config.client.expected_reply, "Done");
        assert_eq!(config.client.response_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.device.identity().unwrap(),
            DeviceIdentity::new(0x0525, 0xa4a7)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x0525", "vid").unwrap(), 0x0525);
        assert_eq!(parse_hex_id("0XA4A7", "pid").unwrap(), 0xa4a7);
        assert!(parse_hex_id("0525", "vid").is_err());
        assert!(parse_hex_id("0x", "vid").is_err());
        assert!(parse_hex_id("0x12345", "vid").is_err());
        assert!(parse_hex_id("0xGHIJ", "vid").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.logging.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.port.slots = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.line.baud_rate = 1234;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.line.data_bits = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
[device]
vendor_id = "0x1234"
product_id = "0x5678"

[client]
response_timeout_ms = 500
expected_reply = "OK"
"#,
        )
        .unwrap();

        assert_eq!(
            config.device.identity().unwrap(),
            DeviceIdentity::new(0x1234, 0x5678)
        );
        assert_eq!(config.device.attach_timeout_ms, 5000);
        assert_eq!(config.client.response_timeout(), Duration::from_millis(500));
        assert_eq!(config.port.name, "ttyMYUSB");
        assert_eq!(config.line, LineSettings::default());
    }

    #[test]
    fn test_partial_sections_use_field_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
[device]
product_id = "0x0104"

[port]
slots = 3

[client]
response_timeout_ms = 500

[logging]
"#,
        )
        .unwrap();

        assert_eq!(
            config.device.identity().unwrap(),
            DeviceIdentity::new(0x0525, 0x0104)
        );
        assert_eq!(config.port.name, "ttyMYUSB");
        assert_eq!(config.port.slots, 3);
        assert_eq!(config.client.response_timeout(), Duration::from_millis(500));
        assert_eq!(config.client.expected_reply, "Done");
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.toml");

        let mut config = BridgeConfig::default();
        config.port.slots = 2;
        config.line.baud_rate = 115200;
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.port.slots, 2);
        assert_eq!(loaded.line.baud_rate, 115200);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(&path, "[device]\nvendor_id = \"525\"\nproduct_id = \"0xa4a7\"\n").unwrap();

        assert!(BridgeConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_expand_path() {
        let expanded = expand_path("~/bridge.toml");
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
        assert_eq!(expand_path("/etc/bridge.toml"), PathBuf::from("/etc/bridge.toml"));
    }
}
