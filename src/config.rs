use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8081;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

/// How a CONNECT tunnel is torn down once one relay direction finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Close both sockets as soon as either direction reaches EOF or fails.
    /// Data still in flight on the other direction is dropped.
    #[default]
    FirstFinisher,
    /// Shut down the write side of the peer when a direction ends and wait
    /// for both directions before closing.
    HalfClose,
}

/// Settings for the shared outbound transport and the tunnel dialer.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub pool_max_idle: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            pool_max_idle: 100,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

fn default_pool_max_idle() -> usize {
    100
}

fn default_header_read_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    16 * 1024 // 16KB default header size limit
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    // Dial timeout for CONNECT targets
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    // Deadline for a client to deliver a complete request head
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,
    #[serde(default)]
    pub tunnel_teardown: TeardownPolicy,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            tls_handshake_timeout_secs: default_tls_handshake_timeout(),
            pool_max_idle: default_pool_max_idle(),
            max_header_size: default_max_header_size(),
            header_read_timeout_secs: default_header_read_timeout(),
            tunnel_teardown: TeardownPolicy::default(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.connect_timeout_secs == 0 {
            return Err(ProxyError::Config("connect_timeout_secs must be greater than 0".to_string()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ProxyError::Config("idle_timeout_secs must be greater than 0".to_string()));
        }
        if self.tls_handshake_timeout_secs == 0 {
            return Err(ProxyError::Config("tls_handshake_timeout_secs must be greater than 0".to_string()));
        }
        if self.header_read_timeout_secs == 0 {
            return Err(ProxyError::Config("header_read_timeout_secs must be greater than 0".to_string()));
        }
        if self.max_header_size == 0 {
            return Err(ProxyError::Config("max_header_size must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            tls_handshake_timeout: Duration::from_secs(self.tls_handshake_timeout_secs),
            pool_max_idle: self.pool_max_idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_transport_settings() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.tunnel_teardown, TeardownPolicy::FirstFinisher);

        let settings = config.transport_settings();
        assert_eq!(settings.pool_max_idle, 100);
        assert_eq!(settings.idle_timeout, Duration::from_secs(90));
        assert_eq!(settings.tls_handshake_timeout, Duration::from_secs(10));
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"listen_addr": "127.0.0.1:9000", "tunnel_teardown": "half_close"}"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.tunnel_teardown, TeardownPolicy::HalfClose);
        assert_eq!(config.idle_timeout_secs, 90);
        assert_eq!(config.max_header_size, 16 * 1024);
        assert_eq!(config.header_read_timeout_secs, 30);
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.connect_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));

        let config = Config { max_header_size: 0, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { header_read_timeout_secs: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
