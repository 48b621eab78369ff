use crate::errors::{PrinterError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PRINTER_PORT: u16 = 9100;

/// Environment variables read by [`DaemonConfig::from_env`].
pub const ENV_PRINTER_IP: &str = "TF_PRINTER_IP";
pub const ENV_PRINTER_PORT: &str = "TF_PRINTER_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Network printer; the network transport only exists when this is set.
    pub network: Option<NetworkPrinterConfig>,
    pub heartbeat: HeartbeatConfig,
    pub usb: UsbConfig,
    /// Wait before re-dialing a network printer that went away.
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPrinterConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// No inbound bytes for longer than this means the peer is gone.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub write_timeout_ms: u64,
    /// How long the hot-plug thread blocks in libusb per iteration.
    pub hotplug_poll_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PRINTER_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_keepalive_secs() -> u64 {
    30
}

impl NetworkPrinterConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl UsbConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn hotplug_poll(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            timeout_ms: 12000,
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 30_000,
            hotplug_poll_ms: 250,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network: None,
            heartbeat: HeartbeatConfig::default(),
            usb: UsbConfig::default(),
            retry_delay_ms: 15_000,
        }
    }
}

impl DaemonConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Load a JSON config file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Build a config from `TF_PRINTER_IP` / `TF_PRINTER_PORT`.
    ///
    /// Without an IP the network transport stays disabled and only USB is used.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = DaemonConfig::default();

        let host = lookup(ENV_PRINTER_IP).filter(|v| !v.trim().is_empty());
        let port = match lookup(ENV_PRINTER_PORT).filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                PrinterError::Config(format!("{} must be a number, got {:?}", ENV_PRINTER_PORT, raw))
            })?,
            None => DEFAULT_PRINTER_PORT,
        };

        match host {
            Some(host) => {
                config.network = Some(NetworkPrinterConfig::new(host.trim(), port));
            }
            None => info!("{} not set, network printer disabled", ENV_PRINTER_IP),
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(PrinterError::Config("heartbeat.interval_ms must be > 0".to_string()));
        }
        if self.retry_delay_ms == 0 {
            return Err(PrinterError::Config("retry_delay_ms must be > 0".to_string()));
        }
        if let Some(network) = &self.network {
            if network.host.trim().is_empty() {
                return Err(PrinterError::Config("network.host must not be empty".to_string()));
            }
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            warn!(
                "Heartbeat timeout ({}ms) is not longer than its interval ({}ms); every tick may report late",
                self.heartbeat.timeout_ms, self.heartbeat.interval_ms
            );
        }
        Ok(())
    }
}
