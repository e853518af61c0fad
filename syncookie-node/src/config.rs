use crate::secret::Secret;
use crate::status::SyncookieMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use syncookie_common::KEY_LIFETIME_SECS;

/// Default state table size the watermarks are derived from
pub const DEFAULT_STATE_LIMIT: u64 = 100_000;

/// Main configuration for the SYN cookie node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// SYN cookie mode and watermarks
    pub syncookies: SyncookiesConfig,
    /// Packet I/O configuration
    pub network: NetworkConfig,
    /// Half-open handshake tracking
    pub handshake: HandshakeConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Management API configuration
    pub management: ManagementApiConfig,
}

/// SYN cookie settings applied at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncookiesConfig {
    /// Issue cookies at all
    pub enabled: bool,
    /// Only issue cookies while a flood is detected
    pub adaptive: bool,
    /// Half-open count above which adaptive mode activates
    pub hiwat: u64,
    /// Half-open count below which adaptive mode deactivates
    pub lowat: u64,
    /// Seconds between key rotations
    pub key_lifetime_seconds: u64,
}

/// Packet I/O configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address segments are accepted on
    pub interface_addr: String,
    /// Capture and answer segments through a raw socket (needs CAP_NET_RAW)
    pub raw_socket_enabled: bool,
    /// Transport channel buffer size in bytes
    pub channel_buffer_size: usize,
    /// MSS advertised when the peer sent a smaller one or none
    pub default_mss: u16,
    /// TTL of reconstructed SYNs and cookie SYN-ACKs
    pub synthetic_ttl: u8,
}

/// Half-open handshake tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Seconds before an unanswered handshake is forgotten
    pub timeout_seconds: u64,
    /// Seconds between cleanup passes
    pub cleanup_interval_seconds: u64,
    /// Maximum number of tracked handshakes
    pub max_tracked: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Metrics server address
    pub listen_addr: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, text)
    pub format: Option<String>,
}

/// Management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementApiConfig {
    /// Enable the management API
    pub enabled: bool,
    /// Listen address
    pub listen_addr: String,
    /// Bearer token required on every request when set
    pub auth_token: Option<Secret<String>>,
}

impl NodeConfig {
    pub fn key_lifetime(&self) -> Duration {
        Duration::from_secs(self.syncookies.key_lifetime_seconds)
    }

    pub fn handshake_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.handshake.cleanup_interval_seconds)
    }

    pub fn interface_addr(&self) -> Result<std::net::IpAddr, std::net::AddrParseError> {
        self.network.interface_addr.parse()
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.metrics.listen_addr.parse()
    }

    pub fn management_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.management.listen_addr.parse()
    }

    /// Check if metrics are enabled
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.enabled
    }

    /// Check if the management API is enabled
    pub fn management_enabled(&self) -> bool {
        self.management.enabled
    }

    pub fn json_logging(&self) -> bool {
        self.logging.format.as_deref() == Some("json")
    }
}

impl SyncookiesConfig {
    pub fn mode(&self) -> SyncookieMode {
        SyncookieMode::from_flags(self.enabled, self.adaptive)
    }
}

impl Default for SyncookiesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            adaptive: false,
            hiwat: DEFAULT_STATE_LIMIT / 4,
            lowat: DEFAULT_STATE_LIMIT / 8,
            key_lifetime_seconds: KEY_LIFETIME_SECS,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            syncookies: SyncookiesConfig::default(),
            network: NetworkConfig {
                interface_addr: "0.0.0.0".to_string(),
                raw_socket_enabled: false,
                channel_buffer_size: 65536,
                default_mss: 536,
                synthetic_ttl: 64,
            },
            handshake: HandshakeConfig {
                timeout_seconds: 30,
                cleanup_interval_seconds: 5,
                max_tracked: 200_000,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "0.0.0.0:9191".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: Some("text".to_string()),
            },
            management: ManagementApiConfig {
                enabled: true,
                listen_addr: "127.0.0.1:9999".to_string(),
                auth_token: None,
            },
        }
    }
}

impl NodeConfig {
    /// Load configuration from file, with `SYNCOOKIE__SECTION__FIELD` environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SYNCOOKIE").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.syncookies.lowat >= self.syncookies.hiwat {
            return Err(format!(
                "Low watermark {} must be below high watermark {}",
                self.syncookies.lowat, self.syncookies.hiwat
            ));
        }

        if self.syncookies.key_lifetime_seconds == 0 {
            return Err("Key lifetime cannot be 0".to_string());
        }

        if self.handshake.timeout_seconds == 0 {
            return Err("Handshake timeout cannot be 0".to_string());
        }

        if self.network.default_mss < 64 {
            return Err(format!(
                "Default MSS {} is too small",
                self.network.default_mss
            ));
        }

        if self.management.enabled && self.management_addr().is_err() {
            return Err(format!(
                "Invalid management listen address: {}",
                self.management.listen_addr
            ));
        }

        Ok(())
    }
}
