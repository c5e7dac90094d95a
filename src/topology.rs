// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! A [`Binding`] ties one exchange to one queue. The publisher installs it
//! before every publish and the consumer before every subscribe, so a broker
//! that lost its topology heals without a restart. Every step is a plain AMQP declare, which
//! the broker treats as a no-op when the entity already exists with the same
//! arguments.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use tracing::debug;

/// Header field used to put a queue in lazy mode
pub const AMQP_HEADERS_QUEUE_MODE: &str = "x-queue-mode";
/// Value of [`AMQP_HEADERS_QUEUE_MODE`] for lazy queues
pub const AMQP_QUEUE_MODE_LAZY: &str = "lazy";

/// An exchange, a queue and the binding between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
}

impl Binding {
    /// Durable direct `exchange`, durable lazy `queue`, routed by the queue name.
    pub fn new(exchange: &str, queue: &str) -> Binding {
        Binding {
            exchange: ExchangeDefinition::new(exchange).durable(),
            queue: QueueDefinition::new(queue).durable().lazy(),
            binding: QueueBinding::new(queue).exchange(exchange),
        }
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.queue.dlq_name()
    }

    /// Declares a companion dead letter queue for the bound queue.
    pub fn with_dlq(mut self) -> Self {
        if self.queue.dlq_name.is_none() {
            self.queue = self.queue.with_dlq();
        }
        self
    }

    /// Declares the queue (and its DLQ), the exchange, then binds them.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        debug!("creating queue: {}", self.queue.name);
        channel.declare_queue(&self.queue).await?;

        if let Some(dlq) = self.queue.dlq_definition() {
            debug!("creating dlq: {}", dlq.name);
            channel.declare_queue(&dlq).await?;
        }

        debug!("creating exchange: {}", self.exchange.name);
        channel.declare_exchange(&self.exchange).await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.binding.queue_name, self.binding.exchange_name, self.binding.routing_key
        );
        channel.bind_queue(&self.binding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;

    #[test]
    fn defaults_match_mail_pipeline_topology() {
        let binding = Binding::new("mail-exchange", "mail-queue");

        assert_eq!(binding.exchange_name(), "mail-exchange");
        assert_eq!(binding.queue_name(), "mail-queue");
        assert_eq!(binding.binding.routing_key, "mail-queue");
        assert!(binding.exchange.durable);
        assert!(binding.queue.durable && binding.queue.lazy);
        assert_eq!(binding.dlq_name(), None);
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let broker = FakeBroker::new();
        let channel = broker.open_channel().await;
        let binding = Binding::new("mail-exchange", "mail-queue").with_dlq();

        for _ in 0..3 {
            binding.install(channel.as_ref()).await.unwrap();
        }

        assert_eq!(broker.bindings(), vec![(
            "mail-exchange".to_owned(),
            "mail-queue".to_owned(),
            "mail-queue".to_owned()
        )]);
        assert!(broker.has_queue("mail-queue"));
        assert!(broker.has_queue("mail-queue-dlq"));
        assert!(broker.has_exchange("mail-exchange"));
    }

    #[tokio::test]
    async fn install_stops_at_first_failure() {
        let broker = FakeBroker::new();
        let channel = broker.open_channel().await;
        broker.fail_next_declares(1);

        let err = Binding::new("mail-exchange", "mail-queue")
            .install(channel.as_ref())
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("mail-queue".to_owned()));
        assert!(broker.bindings().is_empty());
    }
}
