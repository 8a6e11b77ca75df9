use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionSettings;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GatewayConfig {
    pub db_path: String,

    pub config_watch_interval_secs: u64,
    pub command_queue_timeout_ms: u64,

    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_max_retry_interval_ms: u64,
    pub mqtt_client_id_prefix: String,

    pub idle_sweep_interval_secs: u64,

    pub default_stream_name: String,
    pub archive_group: String,
    pub archive_consumer: String,
    pub archive_batch_size: usize,
    pub archive_block_ms: u64,
    pub archive_interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: "mqtt_gateway.db".to_string(),
            config_watch_interval_secs: 30,
            command_queue_timeout_ms: 1000,
            mqtt_connect_timeout_ms: 10_000,
            mqtt_keep_alive_secs: 60,
            mqtt_retry_interval_ms: 5000,
            mqtt_max_retry_interval_ms: 60_000,
            mqtt_client_id_prefix: "mqtt_gateway".to_string(),
            idle_sweep_interval_secs: 60,
            default_stream_name: "mqtt_stream_default".to_string(),
            archive_group: "archive_consumers".to_string(),
            archive_consumer: "archive_worker".to_string(),
            archive_batch_size: 1000,
            archive_block_ms: 1000,
            archive_interval_secs: 10,
        }
    }
}

/// Read `name` and parse it, falling back to `default` when unset.
fn var_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", name))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::MissingOrInvalid(name.to_string())),
    }
}

fn string_or(name: &str, default: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Err(ConfigError::MissingOrInvalid(name.to_string())),
        Ok(raw) => Ok(raw.trim().to_string()),
        Err(env::VarError::NotPresent) => Ok(default.to_string()),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::MissingOrInvalid(name.to_string())),
    }
}

impl GatewayConfig {
    /// Validate timeout values and other critical configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        let timeouts = [
            ("COMMAND_QUEUE_TIMEOUT_MS", self.command_queue_timeout_ms),
            ("MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("MQTT_RETRY_INTERVAL_MS", self.mqtt_retry_interval_ms),
            ("MQTT_MAX_RETRY_INTERVAL_MS", self.mqtt_max_retry_interval_ms),
            ("ARCHIVE_BLOCK_MS", self.archive_block_ms),
        ];
        for (name, value) in timeouts {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.mqtt_max_retry_interval_ms < self.mqtt_retry_interval_ms {
            return Err(ConfigError::ParsingError(
                "MQTT_MAX_RETRY_INTERVAL_MS must not be below MQTT_RETRY_INTERVAL_MS".to_string(),
            ));
        }

        let intervals = [
            ("CONFIG_WATCH_INTERVAL_SECS", self.config_watch_interval_secs),
            ("MQTT_KEEP_ALIVE_SECS", self.mqtt_keep_alive_secs),
            ("IDLE_SWEEP_INTERVAL_SECS", self.idle_sweep_interval_secs),
            ("ARCHIVE_INTERVAL_SECS", self.archive_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ParsingError(format!("{} must be positive", name)));
            }
        }

        if self.archive_batch_size == 0 {
            return Err(ConfigError::ParsingError(
                "ARCHIVE_BATCH_SIZE must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let defaults = Self::default();
        let config = Self {
            db_path: string_or("GATEWAY_DB_PATH", &defaults.db_path)?,
            config_watch_interval_secs: var_or(
                "CONFIG_WATCH_INTERVAL_SECS",
                defaults.config_watch_interval_secs,
            )?,
            command_queue_timeout_ms: var_or(
                "COMMAND_QUEUE_TIMEOUT_MS",
                defaults.command_queue_timeout_ms,
            )?,
            mqtt_connect_timeout_ms: var_or(
                "MQTT_CONNECT_TIMEOUT_MS",
                defaults.mqtt_connect_timeout_ms,
            )?,
            mqtt_keep_alive_secs: var_or("MQTT_KEEP_ALIVE_SECS", defaults.mqtt_keep_alive_secs)?,
            mqtt_retry_interval_ms: var_or(
                "MQTT_RETRY_INTERVAL_MS",
                defaults.mqtt_retry_interval_ms,
            )?,
            mqtt_max_retry_interval_ms: var_or(
                "MQTT_MAX_RETRY_INTERVAL_MS",
                defaults.mqtt_max_retry_interval_ms,
            )?,
            mqtt_client_id_prefix: string_or(
                "MQTT_CLIENT_ID_PREFIX",
                &defaults.mqtt_client_id_prefix,
            )?,
            idle_sweep_interval_secs: var_or(
                "IDLE_SWEEP_INTERVAL_SECS",
                defaults.idle_sweep_interval_secs,
            )?,
            default_stream_name: string_or("DEFAULT_STREAM_NAME", &defaults.default_stream_name)?,
            archive_group: string_or("ARCHIVE_GROUP", &defaults.archive_group)?,
            archive_consumer: string_or("ARCHIVE_CONSUMER", &defaults.archive_consumer)?,
            archive_batch_size: var_or("ARCHIVE_BATCH_SIZE", defaults.archive_batch_size)?,
            archive_block_ms: var_or("ARCHIVE_BLOCK_MS", defaults.archive_block_ms)?,
            archive_interval_secs: var_or(
                "ARCHIVE_INTERVAL_SECS",
                defaults.archive_interval_secs,
            )?,
        };

        // Validate timeouts after constructing the configuration
        config.validate()?;

        Ok(config)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.mqtt_connect_timeout_ms),
            retry_interval: Duration::from_millis(self.mqtt_retry_interval_ms),
            max_retry_interval: Duration::from_millis(self.mqtt_max_retry_interval_ms),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs)
    }

    pub fn config_watch_interval(&self) -> Duration {
        Duration::from_secs(self.config_watch_interval_secs)
    }

    pub fn command_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.command_queue_timeout_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn archive_block(&self) -> Duration {
        Duration::from_millis(self.archive_block_ms)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }
}
