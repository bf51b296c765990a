//! Configuration management

mod server_entry;

pub use server_entry::ServerEntry;

use crate::protocol::TunnelProtocol;
use crate::transport::{DeviceBinder, DialConfig, PendingConns};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Force a specific tunnel protocol instead of auto-selection
    pub tunnel_protocol: Option<TunnelProtocol>,
    /// Transport connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-read timeout in seconds (none = wait indefinitely)
    pub read_timeout_secs: Option<u64>,
    /// Per-write timeout in seconds (none = wait indefinitely)
    pub write_timeout_secs: Option<u64>,
    /// Period between SSH keepalive probes in seconds
    pub keepalive_period_secs: u64,
    /// Port forward failures tolerated before a tunnel is failed
    pub port_forward_failure_threshold: usize,
    /// Bind tunnel sockets to a device (e.g. VPN protect service)
    pub device_binding: Option<DeviceBinding>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values the tunnel cannot operate with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.port_forward_failure_threshold == 0 {
            return Err(crate::Error::Config(
                "port_forward_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.keepalive_period_secs == 0 {
            return Err(crate::Error::Config(
                "keepalive_period_secs must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_period_secs)
    }

    /// Build the dial configuration shared by every transport stage
    pub fn dial_config(
        &self,
        pending_conns: Option<Arc<PendingConns>>,
        device_binder: Option<Arc<dyn DeviceBinder>>,
    ) -> DialConfig {
        DialConfig {
            connect_timeout: self.connect_timeout(),
            read_timeout: self.read_timeout_secs.map(Duration::from_secs),
            write_timeout: self.write_timeout_secs.map(Duration::from_secs),
            pending_conns,
            device_binding: self.device_binding.clone(),
            device_binder,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel_protocol: None,
            connect_timeout_secs: 20,
            read_timeout_secs: None,
            write_timeout_secs: Some(30),
            keepalive_period_secs: 60,
            port_forward_failure_threshold: 10,
            device_binding: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Device binding parameters, handed to the platform's [`DeviceBinder`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// Address of the service that binds sockets to the device
    pub service_address: String,
    /// DNS server reachable from the bound device
    pub dns_server: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.tunnel_protocol.is_none());
        assert_eq!(config.keepalive_period_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_forced_protocol() {
        let toml = r#"
            tunnel_protocol = "UNFRONTED-MEEK-OSSH"
            port_forward_failure_threshold = 3

            [device_binding]
            service_address = "127.0.0.1:9000"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.tunnel_protocol, Some(TunnelProtocol::UnfrontedMeek));
        assert_eq!(config.port_forward_failure_threshold, 3);
        assert_eq!(
            config.device_binding.unwrap().service_address,
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result: Result<Config, _> = toml::from_str(r#"tunnel_protocol = "QUIC""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_threshold_invalid() {
        let config = Config {
            port_forward_failure_threshold: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_dial_config_timeouts() {
        let config = Config {
            read_timeout_secs: Some(5),
            ..Config::default()
        };
        let dial = config.dial_config(None, None);
        assert_eq!(dial.connect_timeout, Duration::from_secs(20));
        assert_eq!(dial.read_timeout, Some(Duration::from_secs(5)));
        assert_eq!(dial.write_timeout, Some(Duration::from_secs(30)));
        assert!(dial.pending_conns.is_none());
    }
}
