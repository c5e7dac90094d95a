// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Broker-agnostic shapes of what goes out (`OutboundMessage`) and what comes
//! in (`Delivery`). The lapin adapter in [`crate::channel`] converts them to and
//! from AMQP properties.

use crate::{errors::AmqpError, transport::Acker};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying how many times a delivery already failed processing
pub const AMQP_HEADERS_ATTEMPT: &str = "x-attempt";

/// Message headers. Values are carried as AMQP long strings.
pub type Headers = BTreeMap<String, String>;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub message_id: String,
    pub headers: Headers,
}

impl OutboundMessage {
    /// Creates a persistent JSON message with a fresh time-ordered id.
    ///
    /// The id is generated once here, so every publish attempt for this value
    /// carries the same id.
    pub fn new(exchange: &str, routing_key: &str, msg_type: &str, body: impl Into<Vec<u8>>) -> Self {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            msg_type: msg_type.to_owned(),
            body: body.into(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            persistent: true,
            message_id: Uuid::now_v7().to_string(),
            headers: Headers::default(),
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// An inbound message together with the handle used to settle it.
///
/// `ack` and `nack` consume the delivery, so at most one disposition can be
/// issued for it.
pub struct Delivery {
    pub message_id: String,
    pub msg_type: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub data: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        message_id: String,
        msg_type: String,
        exchange: String,
        routing_key: String,
        data: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Delivery {
            message_id,
            msg_type,
            exchange,
            routing_key,
            redelivered: false,
            headers: Headers::default(),
            data,
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Number of failed processing attempts recorded in the headers.
    pub fn attempts(&self) -> u32 {
        self.headers
            .get(AMQP_HEADERS_ATTEMPT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Acknowledges this single delivery.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges this single delivery.
    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("msg_type", &self.msg_type)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("len", &self.data.len())
            .finish()
    }
}
