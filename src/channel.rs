// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! lapin-backed implementation of the [`crate::transport`] seams: dialing the
//! broker, opening channels, declaring topology, publishing, consuming and
//! settling deliveries.

use crate::{
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Headers, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
    topology::{AMQP_HEADERS_QUEUE_MODE, AMQP_QUEUE_MODE_LAZY},
    transport::{Acker, BrokerChannel, BrokerConnection, BrokerEvent, Connector, DeliveryStream, Role},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const EVENTS_CAPACITY: usize = 16;
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Dials RabbitMQ with lapin.
///
/// Each role gets its own connection, named `<app>-publisher` or
/// `<app>-consumer` so the two show up separately in the management UI.
pub struct LapinConnector {
    uri: String,
    app_name: String,
}

impl LapinConnector {
    pub fn new(cfg: &Configs) -> Self {
        LapinConnector {
            uri: cfg.rabbitmq.uri(),
            app_name: cfg.app.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, role: Role) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(role = %role, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(format!("{}-{}", self.app_name, role)));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), role = %role, "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!(role = %role, "amqp connected");

        Ok(LapinConnection::watch(conn, role))
    }
}

/// A lapin connection plus a broadcast of its close/blocked notifications.
///
/// Channels of a send-side connection run in publisher confirm mode.
pub struct LapinConnection {
    conn: Arc<Connection>,
    role: Role,
    events: broadcast::Sender<BrokerEvent>,
}

impl LapinConnection {
    fn watch(conn: Connection, role: Role) -> Arc<LapinConnection> {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        let on_error = events.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            let _ = on_error.send(BrokerEvent::ConnectionClosed);
        });

        let conn = Arc::new(conn);
        tokio::spawn(watch_status(Arc::downgrade(&conn), events.clone()));

        Arc::new(LapinConnection { conn, role, events })
    }
}

// lapin exposes blocked/closed state only through the status, so it is polled
// until the connection is dropped.
async fn watch_status(conn: Weak<Connection>, events: broadcast::Sender<BrokerEvent>) {
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    let mut blocked = false;

    loop {
        ticker.tick().await;

        let Some(conn) = conn.upgrade() else {
            break;
        };

        let status = conn.status();
        if !status.connected() {
            let _ = events.send(BrokerEvent::ConnectionClosed);
            break;
        }

        let now_blocked = status.blocked();
        if now_blocked && !blocked {
            warn!("amqp connection blocked by the broker");
            let _ = events.send(BrokerEvent::ConnectionBlocked);
        }
        blocked = now_blocked;
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!(role = %self.role, "creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if self.role == Role::Send {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to enable publisher confirms");
                    AmqpError::ChannelError(err.to_string())
                })?;
        }
        debug!(role = %self.role, "channel created");

        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close connection");
            AmqpError::CloseError("connection".to_owned())
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut queue_args = BTreeMap::new();

        if def.lazy {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_QUEUE_MODE),
                AMQPValue::LongString(LongString::from(AMQP_QUEUE_MODE_LAZY)),
            );
        }

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch, "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let delivery_mode = if msg.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let confirm = match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(msg.content_type.clone()))
                    .with_type(ShortString::from(msg.msg_type.clone()))
                    .with_message_id(ShortString::from(msg.message_id.clone()))
                    .with_delivery_mode(delivery_mode)
                    .with_headers(to_field_table(&msg.headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(confirmation) => confirmed(confirmation, &msg.message_id),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close channel");
            AmqpError::CloseError("channel".to_owned())
        })
    }
}

struct LapinDeliveryAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for LapinDeliveryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

// Channels without confirm mode report `NotRequested`, which counts as sent.
fn confirmed(confirmation: Confirmation, message_id: &str) -> Result<(), AmqpError> {
    match confirmation {
        Confirmation::Nack(_) => {
            error!(message_id, "message nacked by the broker");
            Err(AmqpError::PublishingError(format!(
                "message `{message_id}` nacked by the broker"
            )))
        }
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let message_id = props
        .message_id()
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_default();
    let msg_type = props.kind().as_ref().map(|v| v.to_string()).unwrap_or_default();
    let headers = props
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery::new(
        message_id,
        msg_type,
        delivery.exchange.to_string(),
        delivery.routing_key.to_string(),
        delivery.data,
        Box::new(LapinDeliveryAcker {
            acker: delivery.acker,
        }),
    )
    .redelivered(delivery.redelivered)
    .headers(headers)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    FieldTable::from(btree)
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.to_string(), v)))
        .collect()
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        _ => None,
    }
}
