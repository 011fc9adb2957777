//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via `-f` flag or `TRIGCTL_CONFIG`.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - base configuration
//! 2. **Environment variables** - `TRIGCTL_` prefixed variables override
//!    YAML values; nested fields use double underscores
//!    (`TRIGCTL_ENGINE__MAX_FAILURE_COUNT=3`)
//! 3. **DATABASE_URL** - special case: overrides `database.url` if set
//!
//! Durations are humantime strings (`"30s"`, `"5m"`).

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::consumer::InitialOffset;
use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TRIGCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the service.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Special-case override for `database.url` (set via DATABASE_URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// PostgreSQL connection settings
    pub database: DatabaseConfig,
    /// Message bus (JetStream) settings
    pub nats: NatsConfig,
    /// Hot-path engine knobs
    pub engine: EngineConfig,
    /// Permission oracle (token exchange) client settings
    pub permissions: PermissionsConfig,
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string
    pub url: String,
    /// Connection pool sizing
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/vehicle_triggers".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

/// Individual pool configuration with all SQLx parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Message bus configuration: two JetStream streams, one durable consumer
/// group per process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatsConfig {
    /// Run the consumer loops (disable for API-only instances)
    pub enabled: bool,
    /// Server URL
    pub url: String,
    /// Stream holding signal messages
    pub signals_stream: String,
    /// Subject the signals stream captures
    pub signals_subject: String,
    /// Stream holding event messages
    pub events_stream: String,
    /// Subject the events stream captures
    pub events_subject: String,
    /// Durable consumer group name (per process)
    pub consumer_group: String,
    /// Where a fresh consumer group starts: oldest (dev) or latest (prod)
    pub initial_offset: InitialOffset,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "nats://localhost:4222".to_string(),
            signals_stream: "TELEMETRY_SIGNALS".to_string(),
            signals_subject: "telemetry.signals".to_string(),
            events_stream: "TELEMETRY_EVENTS".to_string(),
            events_subject: "telemetry.events".to_string(),
            consumer_group: "vehicle-triggers".to_string(),
            initial_offset: InitialOffset::Latest,
        }
    }
}

/// Hot-path engine knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Consecutive delivery failures before a webhook is circuit-broken
    pub max_failure_count: i32,
    /// Cooldown applied when a webhook is created without one
    #[serde(with = "humantime_serde")]
    pub cooldown_default: Duration,
    /// Unconditional index rebuild interval
    #[serde(with = "humantime_serde")]
    pub cache_refresh_interval: Duration,
    /// Coalescing window for requested refreshes
    #[serde(with = "humantime_serde")]
    pub cache_refresh_debounce: Duration,
    /// Concurrent webhook tasks per bus message
    pub dispatch_concurrency: usize,
    /// Total deadline for one webhook HTTP delivery
    #[serde(with = "humantime_serde")]
    pub http_dispatch_timeout: Duration,
    /// Op budget for one condition evaluation
    pub xl_cost_limit: u64,
    /// Per-message handler deadline; an expired message is redelivered
    #[serde(with = "humantime_serde")]
    pub handler_deadline: Duration,
    /// CloudEvents `source` field on deliveries
    pub delivery_source: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_failure_count: 5,
            cooldown_default: Duration::from_secs(0),
            cache_refresh_interval: Duration::from_secs(60),
            cache_refresh_debounce: Duration::from_secs(5),
            dispatch_concurrency: 100,
            http_dispatch_timeout: Duration::from_secs(30),
            xl_cost_limit: 1000,
            handler_deadline: Duration::from_secs(30),
            delivery_source: "vehicle-triggers".to_string(),
        }
    }
}

/// Permission oracle client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionsConfig {
    /// Token-exchange endpoint answering permission checks
    pub token_exchange_url: String,
    /// Per-check request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            token_exchange_url: "http://localhost:8090/v1/permissions/check".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3007,
            database_url: None,
            database: DatabaseConfig::default(),
            nats: NatsConfig::default(),
            engine: EngineConfig::default(),
            permissions: PermissionsConfig::default(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // DATABASE_URL wins over the config file.
        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("TRIGCTL_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.database.url.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: database.url must not be empty".to_string(),
            });
        }
        if self.engine.max_failure_count < 1 {
            return Err(Error::Internal {
                operation: "Config validation: engine.max_failure_count must be at least 1"
                    .to_string(),
            });
        }
        if self.engine.dispatch_concurrency < 1 {
            return Err(Error::Internal {
                operation: "Config validation: engine.dispatch_concurrency must be at least 1"
                    .to_string(),
            });
        }
        if self.engine.xl_cost_limit < 1 {
            return Err(Error::Internal {
                operation: "Config validation: engine.xl_cost_limit must be at least 1".to_string(),
            });
        }
        if self.nats.enabled && self.nats.url.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: nats.url must not be empty when the consumer loops are enabled"
                    .to_string(),
            });
        }
        if Url::parse(&self.permissions.token_exchange_url).is_err() {
            return Err(Error::Internal {
                operation: "Config validation: permissions.token_exchange_url must be a valid URL"
                    .to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_yaml_and_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 9100
engine:
  max_failure_count: 3
  cache_refresh_debounce: 2s
nats:
  initial_offset: oldest
"#,
            )?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args)?;

            assert_eq!(config.port, 9100);
            assert_eq!(config.engine.max_failure_count, 3);
            assert_eq!(config.engine.cache_refresh_debounce, Duration::from_secs(2));
            // Untouched values keep their defaults.
            assert_eq!(config.engine.dispatch_concurrency, 100);
            assert_eq!(config.engine.http_dispatch_timeout, Duration::from_secs(30));
            assert_eq!(config.nats.initial_offset, InitialOffset::Oldest);
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "port: 9100\n")?;
            jail.set_env("TRIGCTL_HOST", "127.0.0.1");
            jail.set_env("TRIGCTL_ENGINE__DISPATCH_CONCURRENCY", "8");
            jail.set_env("DATABASE_URL", "postgres://db:5432/triggers");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args)?;

            assert_eq!(config.host, "127.0.0.1");
            assert_eq!(config.port, 9100);
            assert_eq!(config.engine.dispatch_concurrency, 8);
            assert_eq!(config.database.url, "postgres://db:5432/triggers");
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_failure_threshold() {
        let mut config = Config::default();
        config.engine.max_failure_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_oracle_url() {
        let mut config = Config::default();
        config.permissions.token_exchange_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
