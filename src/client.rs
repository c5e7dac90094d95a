// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! One explicitly constructed value owning both sides of the broker: a
//! send-side [`Publisher`] and a receive-side [`Consumer`], each on its own
//! connection. Build it once at startup and pass it by reference to whatever
//! publishes or consumes.
//!
//! ```no_run
//! use amqp_supervisor::{client::RabbitClient, configs::Configs};
//! use opentelemetry::Context;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cfgs = Configs::load()?;
//! let client = RabbitClient::from_configs(&cfgs);
//!
//! client
//!     .publish(&Context::current(), "mail-exchange", "mail-queue", "confirm", "{}")
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    backoff::Backoff,
    channel::LapinConnector,
    configs::{AmqpConfigs, Configs},
    consumer::{Consumer, RetryPolicy},
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::Publisher,
    topology::Binding,
    transport::Connector,
};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::info;

/// Retry and shutdown tuning shared by both sides of the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientSettings {
    pub backoff: Backoff,
    pub publish_max_attempts: Option<u32>,
    pub max_redeliveries: Option<u32>,
    pub drain_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings::from(&AmqpConfigs::default())
    }
}

impl From<&AmqpConfigs> for ClientSettings {
    fn from(cfg: &AmqpConfigs) -> Self {
        ClientSettings {
            backoff: cfg.backoff(),
            publish_max_attempts: cfg.publish_max_attempts(),
            max_redeliveries: cfg.max_redeliveries(),
            drain_timeout: cfg.drain_timeout(),
        }
    }
}

pub struct RabbitClient {
    publisher: Arc<Publisher>,
    consumer: Consumer,
    shutdown: watch::Sender<bool>,
}

impl RabbitClient {
    pub fn new(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        let (shutdown, stopped) = watch::channel(false);
        let publisher = Arc::new(Publisher::new(
            connector.clone(),
            settings.backoff,
            settings.publish_max_attempts,
        ));

        RabbitClient {
            publisher: publisher.clone(),
            consumer: Consumer::new(
                connector,
                publisher,
                settings.backoff,
                RetryPolicy {
                    max_redeliveries: settings.max_redeliveries,
                },
                settings.drain_timeout,
                stopped,
            ),
            shutdown,
        }
    }

    /// Client talking to the RabbitMQ instance described by `cfgs`.
    pub fn from_configs(cfgs: &Configs) -> Self {
        RabbitClient::new(
            Arc::new(LapinConnector::new(cfgs)),
            ClientSettings::from(&cfgs.amqp),
        )
    }

    /// Publishes a JSON `body` tagged `msg_type` to `exchange`, routed to `queue`.
    ///
    /// Blocks until the broker accepted the message (or the configured attempt
    /// limit is reached).
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        queue: &str,
        msg_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), AmqpError> {
        self.publisher
            .publish(ctx, exchange, queue, msg_type, body)
            .await
    }

    /// Consumes `queue` (bound to `exchange`) until [`RabbitClient::stop_consuming`].
    pub async fn consume(
        &self,
        exchange: &str,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        concurrency: u16,
    ) -> Result<(), AmqpError> {
        let binding = Binding::new(exchange, queue);
        self.consumer.consume(&binding, handler, concurrency).await
    }

    /// Asks the consume loop to stop; it drains its workers before returning.
    pub fn stop_consuming(&self) {
        info!("stopping consumer");
        self.shutdown.send_replace(true);
    }

    /// Closes the consumer side, then the publisher side.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.consumer.close().await?;
        self.publisher.close().await?;
        info!("broker connections closed");
        Ok(())
    }
}
