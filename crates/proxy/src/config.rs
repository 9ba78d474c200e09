//! Proxy configuration management

use crate::address::UsbIpAddress;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A device to attach on start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// USB/IP address, e.g. `usbip://10.0.0.2:1-1.4`
    pub address: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub proxy: ProxySettings,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub log_level: String,
}

/// Socket and timeout settings for USB/IP connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP connect and import handshake timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Synchronous control operations (set_configuration, set_interface,
    /// clear_halted_endpoint, reset) give up after this long (seconds)
    pub control_timeout_secs: u64,
    /// How long a request write may wait for the socket to drain (milliseconds)
    pub write_timeout_ms: u64,
    /// Disable Nagle's algorithm on the connection
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            control_timeout_secs: 30,
            write_timeout_ms: 5000,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy: ProxySettings {
                log_level: "info".to_string(),
            },
            transport: TransportConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-proxy/proxy.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProxyConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!("Config: {} devices", config.devices.len());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging is not initialized yet
                eprintln!("Config: {}", e);
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
            config_dir.join("usbip-proxy").join("proxy.toml")
        } else {
            PathBuf::from(".config/usbip-proxy/proxy.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.proxy.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.proxy.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.transport.connect_timeout_ms == 0 {
            return Err(anyhow!("transport.connect_timeout_ms must be greater than zero"));
        }
        if self.transport.control_timeout_secs == 0 {
            return Err(anyhow!("transport.control_timeout_secs must be greater than zero"));
        }
        if self.transport.write_timeout_ms == 0 {
            return Err(anyhow!("transport.write_timeout_ms must be greater than zero"));
        }

        for device in &self.devices {
            device
                .address
                .parse::<UsbIpAddress>()
                .with_context(|| format!("Invalid device address '{}'", device.address))?;
        }

        Ok(())
    }
}
