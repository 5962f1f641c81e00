//! Configuration management for the reservation service.
//!
//! Loads configuration from environment variables with sensible defaults.
//! A variable that is set but does not parse fails startup.

use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A configuration variable has an unusable value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value does not parse.
    #[error("invalid value {value:?} for {var}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Event store configuration
    pub database: DatabaseConfig,
    /// Event delivery configuration
    pub delivery: DeliveryConfig,
    /// Command handling configuration
    pub commands: CommandConfig,
    /// Read model configuration
    pub projection: ProjectionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Serve Prometheus metrics at `/metrics`
    pub metrics_enabled: bool,
    /// Seconds to wait for delivery lanes to drain on shutdown
    pub shutdown_timeout: u64,
}

/// Event store configuration
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL, in-memory store when unset
    #[serde(skip_serializing)]
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Event delivery configuration
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryConfig {
    /// Parallel lanes per subscriber
    pub lanes: usize,
    /// Retries before an event is quarantined
    pub max_retries: usize,
    /// First backoff delay in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Quarantine capacity
    pub quarantine_capacity: usize,
    /// Replay the whole log to every subscriber at startup
    pub catch_up_on_start: bool,
}

/// Command handling configuration
#[derive(Debug, Clone, Serialize)]
pub struct CommandConfig {
    /// Reload-and-retry attempts after a concurrency conflict
    pub max_conflict_retries: usize,
}

/// Read model configuration
#[derive(Debug, Clone, Serialize)]
pub struct ProjectionConfig {
    /// Page size when replaying the log
    pub rebuild_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                metrics_enabled: true,
                shutdown_timeout: 30,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            delivery: DeliveryConfig {
                lanes: 4,
                max_retries: 5,
                initial_delay_ms: 100,
                max_delay_ms: 10_000,
                quarantine_capacity: 10_000,
                catch_up_on_start: false,
            },
            commands: CommandConfig {
                max_conflict_retries: 3,
            },
            projection: ProjectionConfig {
                rebuild_batch_size: 500,
            },
        }
    }
}

impl Config {
    /// Load configuration from the process environment, after `.env`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a variable that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a variable that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let vars = Vars(&lookup);

        Ok(Self {
            server: ServerConfig {
                host: lookup("HOST").unwrap_or(defaults.server.host),
                port: vars.parse("PORT", defaults.server.port)?,
                metrics_enabled: vars.flag("METRICS_ENABLED", defaults.server.metrics_enabled)?,
                shutdown_timeout: vars.parse("SHUTDOWN_TIMEOUT", defaults.server.shutdown_timeout)?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                max_connections: vars.parse("DATABASE_MAX_CONNECTIONS", defaults.database.max_connections)?,
            },
            delivery: DeliveryConfig {
                lanes: vars.parse("PROJECTION_LANES", defaults.delivery.lanes)?,
                max_retries: vars.parse("DELIVERY_MAX_RETRIES", defaults.delivery.max_retries)?,
                initial_delay_ms: vars.parse("DELIVERY_INITIAL_DELAY_MS", defaults.delivery.initial_delay_ms)?,
                max_delay_ms: vars.parse("DELIVERY_MAX_DELAY_MS", defaults.delivery.max_delay_ms)?,
                quarantine_capacity: vars.parse("QUARANTINE_CAPACITY", defaults.delivery.quarantine_capacity)?,
                catch_up_on_start: vars.flag("CATCH_UP_ON_START", defaults.delivery.catch_up_on_start)?,
            },
            commands: CommandConfig {
                max_conflict_retries: vars.parse(
                    "COMMAND_MAX_CONFLICT_RETRIES",
                    defaults.commands.max_conflict_retries,
                )?,
            },
            projection: ProjectionConfig {
                rebuild_batch_size: vars.parse("REBUILD_BATCH_SIZE", defaults.projection.rebuild_batch_size)?,
            },
        })
    }

    /// `host:port` to bind the HTTP server to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Time allowed for delivery lanes to drain on shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.0)(var) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value }),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match (self.0)(var) {
            None => Ok(default),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { var, value }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(config.database.url.is_none());
        assert_eq!(config.delivery.lanes, 4);
        assert_eq!(config.commands.max_conflict_retries, 3);
        assert!(config.server.metrics_enabled);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn variables_override_defaults() {
        let config = config(&[
            ("PORT", "9000"),
            ("DATABASE_URL", "postgres://localhost/medtour"),
            ("PROJECTION_LANES", "8"),
            ("METRICS_ENABLED", "off"),
            ("CATCH_UP_ON_START", "true"),
        ])
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/medtour"));
        assert_eq!(config.delivery.lanes, 8);
        assert!(!config.server.metrics_enabled);
        assert!(config.delivery.catch_up_on_start);
    }

    #[test]
    fn unparsable_values_are_reported() {
        assert_eq!(
            config(&[("PORT", "eighty")]).unwrap_err(),
            ConfigError::Invalid {
                var: "PORT",
                value: "eighty".to_string()
            }
        );
        assert!(config(&[("METRICS_ENABLED", "maybe")]).is_err());
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        assert!(config(&[("DATABASE_URL", "  ")]).unwrap().database.url.is_none());
    }
}
