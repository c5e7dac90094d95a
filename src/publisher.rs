// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes through the send-side [`ChannelSupervisor`]. Every attempt
//! re-declares the exchange, the queue and their binding, so a broker that lost
//! its topology is healed before the message goes out. Any failure forces a
//! reconnect and the publish is retried with backoff, by default until it
//! succeeds. Publishes are serialized: the send channel is only ever used by
//! one publish at a time.

use crate::{
    backoff::Backoff,
    errors::AmqpError,
    message::OutboundMessage,
    otel,
    supervisor::ChannelSupervisor,
    topology::Binding,
    transport::{Connector, Role},
};
use opentelemetry::Context;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Publisher side of the client.
pub struct Publisher {
    send: Mutex<ChannelSupervisor>,
    backoff: Backoff,
    max_attempts: Option<u32>,
}

impl Publisher {
    /// Creates a publisher on its own send-side connection.
    ///
    /// `max_attempts = None` never gives up.
    pub fn new(connector: Arc<dyn Connector>, backoff: Backoff, max_attempts: Option<u32>) -> Self {
        Publisher {
            send: Mutex::new(ChannelSupervisor::new(Role::Send, connector)),
            backoff,
            max_attempts,
        }
    }

    /// Publishes `body` to `exchange` with routing key `queue`.
    ///
    /// The exchange, the queue and their binding are declared before every
    /// attempt. The message id is fixed for the whole call.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        queue: &str,
        msg_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), AmqpError> {
        let binding = Binding::new(exchange, queue);
        let mut msg = OutboundMessage::new(exchange, queue, msg_type, body);
        otel::inject(ctx, &mut msg.headers);

        self.publish_message(&binding, &msg).await
    }

    /// Publishes an already built message, declaring `binding` beforehand.
    pub async fn publish_message(
        &self,
        binding: &Binding,
        msg: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        let mut send = self.send.lock().await;
        let mut force_reconnect = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match try_publish(&mut send, force_reconnect, binding, msg).await {
                Ok(()) => {
                    info!(
                        exchange = msg.exchange.as_str(),
                        queue = msg.routing_key.as_str(),
                        message_id = msg.message_id.as_str(),
                        attempt,
                        "message published"
                    );
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange = msg.exchange.as_str(),
                        queue = msg.routing_key.as_str(),
                        message_id = msg.message_id.as_str(),
                        attempt,
                        "failure to publish, trying republish"
                    );

                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(AmqpError::PublishAttemptsExhausted(attempt));
                    }

                    force_reconnect = true;
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
            }
        }
    }

    /// Sends `msg` once, without declaring anything.
    ///
    /// Used by the consumer to move a failed delivery back onto its queue or
    /// into its DLQ: both were declared by the consumer itself, and the caller
    /// falls back to a requeue instead of retrying.
    pub async fn republish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut send = self.send.lock().await;
        let channel = send.ensure_channel(false).await?;

        match channel.publish(msg).await {
            Ok(()) => Ok(()),
            Err(err) => {
                send.invalidate();
                Err(err)
            }
        }
    }

    /// Closes the send channel and connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.send.lock().await.close().await
    }
}

async fn try_publish(
    send: &mut ChannelSupervisor,
    force_reconnect: bool,
    binding: &Binding,
    msg: &OutboundMessage,
) -> Result<(), AmqpError> {
    let channel = send.ensure_channel(force_reconnect).await?;
    binding.install(channel.as_ref()).await?;
    channel.publish(msg).await
}
