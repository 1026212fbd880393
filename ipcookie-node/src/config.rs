use ipcookie_common::LIFETIME_LOG2_INFINITE;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

/// Main configuration for an IP cookie node (daemon and shim share it)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Protocol timing parameters
    pub protocol: ProtocolConfig,
    /// Peer cookie cache sizing
    pub cache: CacheConfig,
    /// Local cookie-use policy
    pub policy: PolicyConfig,
    /// Stateless secret rotation
    pub rotation: RotationConfig,
    /// Control message handling in the daemon
    pub daemon: DaemonConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Timing knobs of the renewal/fallback state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Seconds to wait for SET-COOKIE after renewal was due before falling back
    pub t_recover_seconds: u64,
    /// log2 seconds of cookie-less operation once fallback triggers
    pub fallback_lt2: u8,
    /// log2 seconds to retry cookies after a fallback period expires
    pub try_lt2: u8,
    /// lt_log2 advertised in the SET-COOKIE messages we send
    pub setcookie_lifetime_log2: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            t_recover_seconds: 3,
            fallback_lt2: 8,
            try_lt2: 3,
            setcookie_lifetime_log2: 6,
        }
    }
}

/// Peer cookie cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of peers tracked before FIFO eviction
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// What the receive path does with datagrams that carry no cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmarkedPolicy {
    /// Hand the datagram to the host stack
    #[default]
    Pass,
    /// Drop the datagram
    Drop,
}

/// Local policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Peers (CIDR ranges) we never attach cookies for
    pub disabled_prefixes: Vec<String>,
    /// Handling of inbound datagrams without a cookie
    pub unmarked_traffic: UnmarkedPolicy,
}

impl PolicyConfig {
    /// Parse disabled prefixes, skipping (and logging) invalid entries
    pub fn parsed_disabled_prefixes(&self) -> Vec<IpNet> {
        self.disabled_prefixes
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(cidr = %cidr, error = %e, "Failed to parse disabled prefix CIDR");
                    None
                }
            })
            .collect()
    }
}

/// Secret rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Enable periodic rotation in the daemon
    pub enabled: bool,
    /// Seconds between rotations
    pub interval_seconds: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 64,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log lines per minute allowed for forged SETCOOKIE-NOT-EXPECTED messages
    pub forged_log_per_minute: u32,
    /// Receive poll timeout in milliseconds (bounds shutdown latency)
    pub recv_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            forged_log_per_minute: 10,
            recv_timeout_ms: 500,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Metrics server address
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Include thread ID
    pub include_thread_id: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            include_thread_id: true,
        }
    }
}

impl CookieConfig {
    /// Load configuration from file, with IPCOOKIES_* environment overrides
    ///
    /// Nested keys use a double underscore, e.g. `IPCOOKIES_CACHE__CAPACITY`.
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("IPCOOKIES")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Get T_RECOVER as Duration
    pub fn t_recover(&self) -> Duration {
        Duration::from_secs(self.protocol.t_recover_seconds)
    }

    /// Get rotation interval as Duration
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation.interval_seconds)
    }

    /// Get metrics listen address
    pub fn metrics_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.metrics.listen_addr.parse()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.capacity == 0 {
            return Err("Cache capacity cannot be 0".to_string());
        }

        // 0xF is reserved for "infinite" and cannot be used as a timed lifetime
        let timed = [
            ("fallback_lt2", self.protocol.fallback_lt2),
            ("try_lt2", self.protocol.try_lt2),
            ("setcookie_lifetime_log2", self.protocol.setcookie_lifetime_log2),
        ];
        for (name, value) in timed {
            if value >= LIFETIME_LOG2_INFINITE {
                return Err(format!(
                    "protocol.{} must be below {}, got {}",
                    name, LIFETIME_LOG2_INFINITE, value
                ));
            }
        }

        if self.rotation.enabled && self.rotation.interval_seconds == 0 {
            return Err("Rotation interval cannot be 0 when rotation is enabled".to_string());
        }

        for cidr in &self.policy.disabled_prefixes {
            if cidr.parse::<IpNet>().is_err() {
                return Err(format!("Invalid disabled prefix: {}", cidr));
            }
        }

        if self.metrics.enabled && self.metrics_addr().is_err() {
            return Err(format!("Invalid metrics listen address: {}", self.metrics.listen_addr));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(format!("Unknown log format: {}", self.logging.format));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = CookieConfig::default();
        assert_eq!(config.protocol.t_recover_seconds, 3);
        assert_eq!(config.protocol.fallback_lt2, 8);
        assert_eq!(config.protocol.try_lt2, 3);
        assert_eq!(config.t_recover(), Duration::from_secs(3));
        assert_eq!(config.policy.unmarked_traffic, UnmarkedPolicy::Pass);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CookieConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = CookieConfig::default();
        config.protocol.fallback_lt2 = 15;
        let err = config.validate().unwrap_err();
        assert!(err.contains("fallback_lt2"));

        let mut config = CookieConfig::default();
        config.policy.disabled_prefixes = vec!["not-a-cidr".to_string()];
        assert!(config.validate().is_err());

        let mut config = CookieConfig::default();
        config.rotation.interval_seconds = 0;
        assert!(config.validate().is_err());
        config.rotation.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = CookieConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parsed_disabled_prefixes_skips_invalid() {
        let policy = PolicyConfig {
            disabled_prefixes: vec![
                "2001:db8::/32".to_string(),
                "garbage".to_string(),
                "fe80::/10".to_string(),
            ],
            unmarked_traffic: UnmarkedPolicy::Drop,
        };
        let parsed = policy.parsed_disabled_prefixes();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].contains(&"2001:db8::1".parse::<std::net::IpAddr>().unwrap()));
    }
}
