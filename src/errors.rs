// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker:
//! connection and channel lifecycle, topology declaration, publishing and
//! acknowledging deliveries. `HandlerError` is what message handlers return
//! when the business logic behind a delivery fails.

use thiserror::Error;

/// Broker-side failures.
///
/// Most variants are transient from the point of view of the supervisors:
/// the publisher and the consumer loop retry them after forcing a reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    #[error("internal error")]
    InternalError,

    /// Dialing the broker failed
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// `queue.bind` failed; carries the exchange and the queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// `basic.consume` was refused for the queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The publisher gave up after the configured number of attempts
    #[error("failure to publish after {0} attempts")]
    PublishAttemptsExhausted(u32),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    /// A dead-lettered delivery could not be published to its DLQ
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Setting the prefetch window failed
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The delivery stream of a consumer failed
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// `consume` was called while another consume loop owns the receive side
    #[error("a consumer is already running on this client")]
    AlreadyConsuming,

    /// A prefetch of 0 would lift the limit on unacknowledged deliveries
    #[error("consumer concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("failure to close `{0}`")]
    CloseError(String),
}

/// Errors returned by message handlers.
///
/// Any of these leads to a negative acknowledgement (or a retry/dead-letter
/// republish when a redelivery ceiling is configured).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// No handler is registered for the message type tag
    #[error("job handler for `{0}` not found")]
    UnsupportedType(String),

    /// The message body could not be decoded
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// The handler ran and reported a failure
    #[error("{0}")]
    Failed(String),
}
