//! Process configuration for the control plane.

use crate::load_balancer::LoadBalancerStrategy;
use crate::registry::ConsulConfig;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid gateway listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// Registry host missing or port zero.
    #[error("invalid registry endpoint '{host}:{port}'")]
    InvalidRegistry { host: String, port: u16 },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// Interval of a periodic loop is zero.
    #[error("{name} interval must be greater than zero")]
    InvalidInterval { name: &'static str },

    #[error("max body size must be greater than zero")]
    InvalidBodyLimit,

    #[error("proxy config directory must not be empty")]
    EmptyConfigDir,
}

/// Control-plane configuration loaded at startup.
///
/// # Environment Variables
///
/// * `CONSUL_HOST` / `CONSUL_PORT` / `CONSUL_TOKEN` / `CONSUL_SECURE` - registry endpoint
///   (default: 127.0.0.1:8500, no token, plain HTTP)
/// * `GATEWAY_LISTEN_ADDR` - gateway listen address (default: "127.0.0.1:8080")
/// * `GATEWAY_REQUEST_TIMEOUT_MS` - forwarding timeout (default: 30000)
/// * `GATEWAY_MAX_BODY_BYTES` - largest request body buffered by the gateway (default: 1 MiB)
/// * `LB_STRATEGY` - default load balancing strategy (default: "round-robin")
/// * `GATEWAY_ROUTES_FILE` - optional TOML/JSON routing file
/// * `MESH_HEALTH_CHECK_INTERVAL_MS` - health sweep cadence (default: 30000)
/// * `MESH_METRICS_INTERVAL_MS` - metrics recompute cadence (default: 60000)
/// * `PROXY_CONFIG_DIR` - generated sidecar config directory (default: "/tmp/envoy-configs")
/// * `PROXY_CONFIG_REFRESH_MS` - sidecar config refresh cadence (default: 30000)
///
/// # Example
///
/// ```
/// use rust_meshplane::config::MeshConfig;
///
/// let config = MeshConfig::from_env();
/// assert!(!config.consul.host.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub consul: ConsulConfig,
    pub listen_addr: String,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub lb_strategy: LoadBalancerStrategy,
    pub routes_file: Option<PathBuf>,
    pub health_check_interval: Duration,
    pub metrics_interval: Duration,
    pub proxy_config_dir: PathBuf,
    pub proxy_config_refresh: Duration,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            consul: ConsulConfig::default(),
            listen_addr: "127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: default_max_body_bytes(),
            lb_strategy: LoadBalancerStrategy::RoundRobin,
            routes_file: None,
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            proxy_config_dir: PathBuf::from("/tmp/envoy-configs"),
            proxy_config_refresh: Duration::from_secs(30),
        }
    }
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(name)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

impl MeshConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let consul = ConsulConfig {
            host: env::var("CONSUL_HOST").unwrap_or(defaults.consul.host),
            port: env::var("CONSUL_PORT")
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(defaults.consul.port),
            token: env::var("CONSUL_TOKEN").ok().filter(|t| !t.is_empty()),
            secure: env::var("CONSUL_SECURE")
                .map(|s| s.eq_ignore_ascii_case("true") || s == "1")
                .unwrap_or(false),
            ..defaults.consul
        };

        let listen_addr = env::var("GATEWAY_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

        let max_body_bytes = env::var("GATEWAY_MAX_BODY_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(default_max_body_bytes);

        let lb_strategy = env::var("LB_STRATEGY")
            .map(|s| LoadBalancerStrategy::parse_or_default(&s))
            .unwrap_or_default();

        let routes_file = env::var("GATEWAY_ROUTES_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let proxy_config_dir = env::var("PROXY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.proxy_config_dir);

        Self {
            consul,
            listen_addr,
            request_timeout: env_millis("GATEWAY_REQUEST_TIMEOUT_MS", 30_000),
            max_body_bytes,
            lb_strategy,
            routes_file,
            health_check_interval: env_millis("MESH_HEALTH_CHECK_INTERVAL_MS", 30_000),
            metrics_interval: env_millis("MESH_METRICS_INTERVAL_MS", 60_000),
            proxy_config_dir,
            proxy_config_refresh: env_millis("PROXY_CONFIG_REFRESH_MS", 30_000),
        }
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Listen address is not a valid socket address
    /// - Registry host is empty or its port is zero
    /// - Request timeout is zero or exceeds one hour
    /// - Any periodic interval is zero
    /// - Body limit is zero or the config directory is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.consul.host.trim().is_empty() || self.consul.port == 0 {
            return Err(ConfigError::InvalidRegistry {
                host: self.consul.host.clone(),
                port: self.consul.port,
            });
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        if self.request_timeout > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeout must not exceed 1 hour".to_string(),
            });
        }

        for (name, interval) in [
            ("health check", self.health_check_interval),
            ("metrics", self.metrics_interval),
            ("proxy config refresh", self.proxy_config_refresh),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidInterval { name });
            }
        }

        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidBodyLimit);
        }

        if self.proxy_config_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyConfigDir);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.consul.port, 8500);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.metrics_interval, Duration::from_secs(60));
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.lb_strategy, LoadBalancerStrategy::RoundRobin);
    }

    #[test]
    fn test_from_env() {
        let config = MeshConfig::from_env();
        assert!(!config.listen_addr.is_empty());
        assert!(!config.consul.host.is_empty());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_listen_addr() {
        let config = MeshConfig {
            listen_addr: "invalid".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidListenAddr { .. }
        ));
    }

    #[test]
    fn test_validate_invalid_registry() {
        let config = MeshConfig {
            consul: ConsulConfig {
                port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidRegistry { .. }
        ));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = MeshConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidTimeout { .. }
        ));
    }

    #[test]
    fn test_validate_excessive_timeout() {
        let config = MeshConfig {
            request_timeout: Duration::from_secs(7200),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidTimeout { .. }
        ));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = MeshConfig {
            metrics_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidInterval { name: "metrics" }
        ));
    }

    #[test]
    fn test_validate_zero_body_limit() {
        let config = MeshConfig {
            max_body_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidBodyLimit
        ));
    }
}
