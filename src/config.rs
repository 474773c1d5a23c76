//! Configuration management for the CIP client
//!
//! Loads a YAML file into [`ClientConfig`]. Everything except the processor
//! address and IP-ID has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::codec::MAX_SERIAL_WIRE_LEN;
use crate::join::SignalKind;

/// Highest digital join the wire format can address (15-bit wire number)
pub const MAX_DIGITAL_JOIN: u16 = 32768;
/// Highest analog/serial join the wire format can address
pub const MAX_WORD_JOIN: u16 = u16::MAX;

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Processor hostname or IP address
    pub host: String,
    /// IP-ID this client registers as
    pub ip_id: u8,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    /// How long to wait for the end of the initial update before going active
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Link is declared lost after this long without any processor traffic
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Re-send interval for held buttons
    #[serde(default = "default_button_repeat_ms")]
    pub button_repeat_ms: u64,
    #[serde(default)]
    pub joins: JoinLimits,
    #[serde(default = "default_max_serial_length")]
    pub max_serial_length: usize,
}

/// Highest join number accepted per signal kind
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinLimits {
    #[serde(default = "default_join_limit")]
    pub digital: u16,
    #[serde(default = "default_join_limit")]
    pub analog: u16,
    #[serde(default = "default_join_limit")]
    pub serial: u16,
}

impl Default for JoinLimits {
    fn default() -> Self {
        Self {
            digital: default_join_limit(),
            analog: default_join_limit(),
            serial: default_join_limit(),
        }
    }
}

impl JoinLimits {
    pub fn max_for(&self, kind: SignalKind) -> u16 {
        match kind {
            SignalKind::Digital => self.digital,
            SignalKind::Analog => self.analog,
            SignalKind::Serial => self.serial,
        }
    }
}

impl ClientConfig {
    /// Configuration with defaults for everything but the address and IP-ID
    pub fn new(host: impl Into<String>, ip_id: u8) -> Self {
        Self {
            host: host.into(),
            ip_id,
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            registration_timeout_ms: default_registration_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            button_repeat_ms: default_button_repeat_ms(),
            joins: JoinLimits::default(),
            max_serial_length: default_max_serial_length(),
        }
    }

    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: ClientConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("Processor host cannot be empty");
        }
        if !(0x03..=0xFE).contains(&self.ip_id) {
            anyhow::bail!("IP-ID 0x{:02x} is invalid (must be 0x03-0xFE)", self.ip_id);
        }
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("registration_timeout_ms", self.registration_timeout_ms),
            ("sync_timeout_ms", self.sync_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
            ("button_repeat_ms", self.button_repeat_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            anyhow::bail!(
                "heartbeat_timeout_ms ({}) must be greater than heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms,
                self.heartbeat_interval_ms
            );
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            anyhow::bail!(
                "reconnect_max_ms ({}) cannot be below reconnect_base_ms ({})",
                self.reconnect_max_ms,
                self.reconnect_base_ms
            );
        }

        for kind in SignalKind::all() {
            let max = self.joins.max_for(*kind);
            let wire_max = match kind {
                SignalKind::Digital => MAX_DIGITAL_JOIN,
                SignalKind::Analog | SignalKind::Serial => MAX_WORD_JOIN,
            };
            if max == 0 || max > wire_max {
                anyhow::bail!("{} join limit {} is invalid (must be 1-{})", kind, max, wire_max);
            }
        }

        if self.max_serial_length > MAX_SERIAL_WIRE_LEN {
            anyhow::bail!(
                "max_serial_length {} exceeds the frame limit of {}",
                self.max_serial_length,
                MAX_SERIAL_WIRE_LEN
            );
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn button_repeat(&self) -> Duration {
        Duration::from_millis(self.button_repeat_ms)
    }

    /// Delay before reconnect attempt `retry_count` (1-based), growing
    /// linearly up to `reconnect_max_ms`
    pub fn reconnect_delay(&self, retry_count: u32) -> Duration {
        let delay_ms = std::cmp::min(
            self.reconnect_max_ms,
            self.reconnect_base_ms.saturating_mul(u64::from(retry_count.max(1))),
        );
        Duration::from_millis(delay_ms)
    }
}

fn default_port() -> u16 { 41794 }
fn default_connect_timeout_ms() -> u64 { 2000 }
fn default_registration_timeout_ms() -> u64 { 5000 }
fn default_sync_timeout_ms() -> u64 { 10_000 }
fn default_heartbeat_interval_ms() -> u64 { 15_000 }
fn default_heartbeat_timeout_ms() -> u64 { 45_000 }
fn default_reconnect_base_ms() -> u64 { 1000 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_button_repeat_ms() -> u64 { 500 }
fn default_join_limit() -> u16 { 4000 }
fn default_max_serial_length() -> usize { 247 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_applies_defaults() {
        let file = write_config("host: 192.168.1.50\nip_id: 3\n");
        let config = ClientConfig::load(file.path().to_str().unwrap()).await.unwrap();

        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.ip_id, 0x03);
        assert_eq!(config.port, 41794);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.button_repeat(), Duration::from_millis(500));
        assert_eq!(config.joins.max_for(SignalKind::Serial), 4000);
        assert_eq!(config.max_serial_length, 247);
    }

    #[tokio::test]
    async fn test_load_overrides() {
        let file = write_config(
            "host: processor.local\nip_id: 10\nport: 41795\njoins:\n  analog: 1000\nheartbeat_interval_ms: 5000\n",
        );
        let config = ClientConfig::load(file.path().to_str().unwrap()).await.unwrap();

        assert_eq!(config.port, 41795);
        assert_eq!(config.joins.analog, 1000);
        assert_eq!(config.joins.digital, 4000);
        assert_eq!(config.heartbeat_interval_ms, 5000);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let file = write_config("host: processor.local\nip_id: 2\n");
        assert!(ClientConfig::load(file.path().to_str().unwrap()).await.is_err());

        let file = write_config("port: 41794\n");
        assert!(ClientConfig::load(file.path().to_str().unwrap()).await.is_err());

        assert!(ClientConfig::load("/nonexistent/cip.yaml").await.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::new("10.0.0.1", 0x03).validate().is_ok());
        assert!(ClientConfig::new("10.0.0.1", 0xFE).validate().is_ok());
        assert!(ClientConfig::new("", 0x03).validate().is_err());
        assert!(ClientConfig::new("10.0.0.1", 0x02).validate().is_err());
        assert!(ClientConfig::new("10.0.0.1", 0xFF).validate().is_err());

        let mut config = ClientConfig::new("10.0.0.1", 0x03);
        config.heartbeat_timeout_ms = config.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("10.0.0.1", 0x03);
        config.joins.digital = 40000;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("10.0.0.1", 0x03);
        config.max_serial_length = 252;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("10.0.0.1", 0x03);
        config.sync_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let config = ClientConfig::new("10.0.0.1", 0x03);
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay(100), Duration::from_secs(30));
    }
}
