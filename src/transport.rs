// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seams
//!
//! The supervisors, the publisher and the consumer only talk to the broker
//! through these traits. [`crate::channel`] implements them on top of lapin;
//! tests plug in an in-memory broker.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};
use tokio::sync::broadcast;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries for one consumer registration.
///
/// The stream ends (or yields an error) when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Which side of the client a connection or channel serves.
///
/// Publishing and consuming never share a connection, so a slow consumer
/// cannot stall publishes and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Send,
    Receive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Send => write!(f, "publisher"),
            Role::Receive => write!(f, "consumer"),
        }
    }
}

/// Asynchronous notifications raised by a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionClosed,
    ConnectionBlocked,
    ChannelClosed,
}

/// Dials the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, role: Role) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Subscribes to close/blocked notifications of this connection.
    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent>;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel multiplexed over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Sets the prefetch bound (per consumer, not global).
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Publishes with `mandatory = false` and `immediate = false`. On a
    /// channel in confirm mode this resolves once the broker confirmed it.
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Registers a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}
