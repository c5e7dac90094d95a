// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! What the consumer loop hands to application code for every delivery.

use crate::{errors::HandlerError, message::Delivery};
use async_trait::async_trait;
use opentelemetry::Context;

#[cfg(test)]
use mockall::automock;

/// A received message, detached from its acknowledgement handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub from: String,
    pub msg_type: String,
    pub message_id: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub fn new(from: &str, msg_type: &str, message_id: &str, data: &[u8]) -> Self {
        ConsumerMessage {
            from: from.to_owned(),
            msg_type: msg_type.to_owned(),
            message_id: message_id.to_owned(),
            redelivered: false,
            data: data.to_vec(),
        }
    }

    pub(crate) fn from_delivery(queue: &str, delivery: &Delivery) -> Self {
        ConsumerMessage {
            redelivered: delivery.redelivered,
            ..ConsumerMessage::new(queue, &delivery.msg_type, &delivery.message_id, &delivery.data)
        }
    }
}

/// Processes one message. `Ok` acknowledges the delivery, `Err` rejects it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}
