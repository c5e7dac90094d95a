// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! Types for defining queues and their bindings to exchanges, including the
//! lazy-queue mode and the companion dead letter queue used by the consumer
//! once a delivery runs out of redeliveries.

/// Arguments of a `queue.declare`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) lazy: bool,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// A transient, shared, non-lazy queue called `name`.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            lazy: false,
            dlq_name: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Survives a broker restart.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Keeps messages on disk rather than in memory (`x-queue-mode: lazy`).
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Pairs the queue with `<name>-dlq`, declared alongside it.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Definition of the companion DLQ, sharing durability and laziness.
    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|name| QueueDefinition {
            name: name.clone(),
            durable: self.durable,
            lazy: self.lazy,
            dlq_name: None,
        })
    }
}

/// Arguments of a `queue.bind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Binds `queue` using its own name as routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: queue.to_owned(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }
}
