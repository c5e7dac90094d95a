// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Settings are read from a `.env` file (when present) and from the process
//! environment. Each section has its own prefix:
//!
//! - `APP_*` - application identity
//! - `RABBITMQ_*` - broker endpoint and credentials
//! - `AMQP_*` - retry, concurrency and shutdown tuning of the client

use crate::backoff::Backoff;
use config::{Config, ConfigError, Environment};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

/// Application identity, used to name broker connections.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfigs {
    pub name: String,
    pub env: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "amqp-supervisor".to_owned(),
            env: "dev".to_owned(),
        }
    }
}

/// Broker endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// AMQP URI composed from the endpoint settings.
    ///
    /// The default vhost `/` is percent-encoded so it survives URI parsing.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "%2f",
            other => other.trim_start_matches('/'),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

/// Client tuning.
///
/// Zero values for `publish_max_attempts` and `max_redeliveries` mean
/// "unbounded".
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AmqpConfigs {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub publish_max_attempts: u32,
    pub max_redeliveries: u32,
    pub concurrency: u16,
    pub drain_timeout_ms: u64,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            backoff_initial_ms: 100,
            backoff_max_ms: 10_000,
            backoff_multiplier: 2.0,
            publish_max_attempts: 0,
            max_redeliveries: 0,
            concurrency: 6,
            drain_timeout_ms: 10_000,
        }
    }
}

impl AmqpConfigs {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .multiplier(self.backoff_multiplier)
    }

    pub fn publish_max_attempts(&self) -> Option<u32> {
        (self.publish_max_attempts > 0).then_some(self.publish_max_attempts)
    }

    pub fn max_redeliveries(&self) -> Option<u32> {
        (self.max_redeliveries > 0).then_some(self.max_redeliveries)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// All settings needed to run a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub amqp: AmqpConfigs,
}

impl Configs {
    /// Loads `.env` (if any) and then reads every section from the environment.
    pub fn load() -> Result<Configs, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(ConfigError::Foreign(Box::new(err)));
            }
        }

        Ok(Configs {
            app: load_section(
                "APP",
                &[("name", "amqp-supervisor".into()), ("env", "dev".into())],
            )?,
            rabbitmq: load_section(
                "RABBITMQ",
                &[
                    ("host", "localhost".into()),
                    ("port", 5672_i64.into()),
                    ("user", "guest".into()),
                    ("password", "guest".into()),
                    ("vhost", "/".into()),
                ],
            )?,
            amqp: load_section(
                "AMQP",
                &[
                    ("backoff_initial_ms", 100_i64.into()),
                    ("backoff_max_ms", 10_000_i64.into()),
                    ("backoff_multiplier", 2.0_f64.into()),
                    ("publish_max_attempts", 0_i64.into()),
                    ("max_redeliveries", 0_i64.into()),
                    ("concurrency", 6_i64.into()),
                    ("drain_timeout_ms", 10_000_i64.into()),
                ],
            )?,
        })
    }
}

fn load_section<T>(prefix: &str, defaults: &[(&str, config::Value)]) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    let mut builder = Config::builder();
    for (key, value) in defaults {
        builder = builder.set_default(*key, value.clone())?;
    }

    builder
        .add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("_")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
