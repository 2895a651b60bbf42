//! Pool configuration and fail-fast validation.

use std::time::Duration;

use serde::Deserialize;

use crate::error::PoolError;

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_user() -> String {
    "root".to_owned()
}

const fn default_port() -> u16 {
    3306
}

const fn default_min_connections() -> u32 {
    0
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_validation_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_idle_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

const fn default_max_lifetime() -> Duration {
    Duration::from_secs(30 * 60)
}

const fn default_keepalive_time() -> Duration {
    Duration::from_secs(2 * 60)
}

const fn default_maintenance_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_adaptive_interval() -> Duration {
    Duration::from_secs(60)
}

/// Configuration recognized by the pool.
///
/// All fields are optional in the sense that [`Default`] produces a usable
/// value, except `host`/`user`, which must be non-empty for
/// [`PoolConfigValidator::validate`] to succeed.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    pub ssl: bool,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: Duration,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: Duration,
    #[serde(default = "default_keepalive_time")]
    pub keepalive_time: Duration,
    pub leak_detection_threshold: Option<Duration>,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: Duration,
    #[serde(default = "default_adaptive_interval")]
    pub adaptive_interval: Duration,
    pub adaptive_sizing: bool,

    pub debug: bool,
    pub read_timeout: Option<Duration>,
    pub socket_options: Option<String>,
    pub allow_public_key_retrieval: bool,
    pub max_packet_size: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            database: None,
            ssl: false,
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connection_timeout: default_connection_timeout(),
            validation_timeout: default_validation_timeout(),
            idle_timeout: default_idle_timeout(),
            max_lifetime: default_max_lifetime(),
            keepalive_time: default_keepalive_time(),
            leak_detection_threshold: None,
            maintenance_interval: default_maintenance_interval(),
            adaptive_interval: default_adaptive_interval(),
            adaptive_sizing: false,
            debug: false,
            read_timeout: None,
            socket_options: None,
            allow_public_key_retrieval: false,
            max_packet_size: None,
        }
    }
}

/// Fail-fast validation, run once at [`crate::pool::PooledDataSource`]
/// construction.
pub struct PoolConfigValidator;

impl PoolConfigValidator {
    /// Validate `cfg`, returning the first rule that fails, in the order
    /// documented in spec.md §4.6.
    pub fn validate(cfg: &PoolConfig) -> Result<(), PoolError> {
        if cfg.max_connections < 1 {
            return Err(PoolError::Config(
                "maxConnections must be at least 1".into(),
            ));
        }
        if cfg.min_connections > cfg.max_connections {
            return Err(PoolError::Config(
                "minConnections must be <= maxConnections".into(),
            ));
        }
        if cfg.connection_timeout < Duration::from_millis(250) {
            return Err(PoolError::Config(
                "connectionTimeout must be >= 250ms".into(),
            ));
        }
        if cfg.validation_timeout < Duration::from_millis(250) {
            return Err(PoolError::Config(
                "validationTimeout must be >= 250ms".into(),
            ));
        }
        if cfg.max_lifetime < Duration::from_secs(30) {
            return Err(PoolError::Config("maxLifetime must be >= 30s".into()));
        }
        if !cfg.idle_timeout.is_zero() && cfg.idle_timeout > cfg.max_lifetime {
            return Err(PoolError::Config(
                "idleTimeout must be <= maxLifetime".into(),
            ));
        }
        if let Some(threshold) = cfg.leak_detection_threshold {
            if threshold < Duration::from_secs(2) || threshold > cfg.max_lifetime {
                return Err(PoolError::Config(
                    "leakDetectionThreshold must be >= 2s and <= maxLifetime".into(),
                ));
            }
        }
        if cfg.user.is_empty() {
            return Err(PoolError::Config("user must not be empty".into()));
        }
        if cfg.host.is_empty() {
            return Err(PoolError::Config("host must not be empty".into()));
        }
        if cfg.port == 0 {
            return Err(PoolError::Config("port must be in [1, 65535]".into()));
        }
        if cfg.maintenance_interval < Duration::from_secs(1) {
            return Err(PoolError::Config(
                "maintenanceInterval must be >= 1s".into(),
            ));
        }

        if cfg.debug && cfg.max_connections > 100 {
            tracing::warn!(
                max_connections = cfg.max_connections,
                "pool configured with debug=true and maxConnections > 100"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> PoolConfig {
        PoolConfig {
            min_connections: 2,
            max_connections: 5,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(PoolConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut cfg = valid_config();
        cfg.min_connections = 10;
        cfg.max_connections = 5;
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn rejects_max_connections_below_one() {
        let mut cfg = valid_config();
        cfg.max_connections = 0;
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn rejects_short_connection_timeout() {
        let mut cfg = valid_config();
        cfg.connection_timeout = Duration::from_millis(10);
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn rejects_short_max_lifetime() {
        let mut cfg = valid_config();
        cfg.max_lifetime = Duration::from_secs(5);
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn rejects_idle_timeout_above_max_lifetime() {
        let mut cfg = valid_config();
        cfg.idle_timeout = Duration::from_secs(3600);
        cfg.max_lifetime = Duration::from_secs(1800);
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn zero_idle_timeout_means_never_idle_out() {
        let mut cfg = valid_config();
        cfg.idle_timeout = Duration::ZERO;
        assert!(PoolConfigValidator::validate(&cfg).is_ok());
    }

    #[test]
    fn rejects_leak_threshold_out_of_range() {
        let mut cfg = valid_config();
        cfg.leak_detection_threshold = Some(Duration::from_millis(100));
        assert!(PoolConfigValidator::validate(&cfg).is_err());

        let mut cfg = valid_config();
        cfg.leak_detection_threshold = Some(cfg.max_lifetime + Duration::from_secs(1));
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn rejects_empty_user_and_host() {
        let mut cfg = valid_config();
        cfg.user = String::new();
        assert!(PoolConfigValidator::validate(&cfg).is_err());

        let mut cfg = valid_config();
        cfg.host = String::new();
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }

    #[test]
    fn rejects_short_maintenance_interval() {
        let mut cfg = valid_config();
        cfg.maintenance_interval = Duration::from_millis(500);
        assert!(PoolConfigValidator::validate(&cfg).is_err());
    }
}
