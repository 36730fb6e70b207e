//! Application configuration.
//!
//! Broker, consumer and producer settings loaded from YAML files and
//! environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::{BatchSettings, Broker, BrokerBuilder, BrokerError, ConsumerSettings, DEFAULT_CONNECT_RETRIES};
use crate::error_policy::{ErrorPolicy, PolicyError};
use crate::messages::Endpoint;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";

/// Errors that can occur while loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid error policy: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    /// Consumers created before the broker connects.
    pub consumers: Vec<ConsumerConfig>,
    /// Producers created eagerly.
    pub producers: Vec<ProducerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Subscribe attempts before a consumer gives up connecting.
    pub connect_retries: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_retries: DEFAULT_CONNECT_RETRIES,
        }
    }
}

impl BrokerConfig {
    pub fn apply(&self, builder: BrokerBuilder) -> BrokerBuilder {
        builder.connect_retries(self.connect_retries)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub endpoint: Endpoint,
    pub batch: BatchConfig,
    pub error_policy: Option<ErrorPolicyConfig>,
}

impl ConsumerConfig {
    /// Validated consumer settings.
    pub fn settings(&self) -> Result<ConsumerSettings, ConfigError> {
        let error_policy = self
            .error_policy
            .as_ref()
            .map(ErrorPolicy::try_from)
            .transpose()?;
        Ok(ConsumerSettings {
            batch: BatchSettings {
                size: self.batch.size,
                max_wait: Duration::from_millis(self.batch.max_wait_ms),
            },
            error_policy,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 1,
            max_wait_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub endpoint: Endpoint,
}

/// Error policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorPolicyConfig {
    Skip,
    Retry {
        max_failed_attempts: u32,
        #[serde(default)]
        initial_delay_ms: u64,
        #[serde(default)]
        delay_increment_ms: u64,
    },
    Move {
        endpoint: Endpoint,
        #[serde(default = "default_move_attempts")]
        max_failed_attempts: u32,
    },
    Chain {
        policies: Vec<ErrorPolicyConfig>,
    },
}

fn default_move_attempts() -> u32 {
    1
}

impl TryFrom<&ErrorPolicyConfig> for ErrorPolicy {
    type Error = PolicyError;

    fn try_from(config: &ErrorPolicyConfig) -> Result<Self, Self::Error> {
        let policy = match config {
            ErrorPolicyConfig::Skip => ErrorPolicy::skip(),
            ErrorPolicyConfig::Retry {
                max_failed_attempts,
                initial_delay_ms,
                delay_increment_ms,
            } => ErrorPolicy::retry_with_delay(
                *max_failed_attempts,
                Duration::from_millis(*initial_delay_ms),
                Duration::from_millis(*delay_increment_ms),
            ),
            ErrorPolicyConfig::Move {
                endpoint,
                max_failed_attempts,
            } => ErrorPolicy::move_to(endpoint.clone(), *max_failed_attempts),
            ErrorPolicyConfig::Chain { policies } => {
                return ErrorPolicy::chain(
                    policies
                        .iter()
                        .map(ErrorPolicy::try_from)
                        .collect::<Result<Vec<_>, _>>()?,
                );
            }
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COURIER_CONFIG` environment variable (if set)
    /// 4. Environment variables with `COURIER` prefix and `__` separator
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Creates the configured consumers and producers on `broker`.
    ///
    /// Fails on the first invalid error policy, before touching the broker.
    pub fn apply(&self, broker: &Broker) -> Result<(), ConfigError> {
        let consumers = self
            .consumers
            .iter()
            .map(|c| Ok((c.endpoint.clone(), c.settings()?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        for (endpoint, settings) in consumers {
            broker.get_consumer_with(&endpoint, settings)?;
        }
        for producer in &self.producers {
            broker.get_producer(&producer.endpoint);
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "in-memory"))]
mod tests;
