// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! The consume loop owns the receive side of the client. Each cycle it
//! (re)connects, installs the topology, sets the prefetch bound and subscribes;
//! then it hands every delivery to its own worker task until the connection or
//! the channel goes away, and starts over.
//!
//! The prefetch bound is the only limit on how many workers run at once: the
//! broker never has more than `concurrency` unacknowledged deliveries out to
//! this consumer.
//!
//! A worker runs the handler and settles the delivery exactly once:
//! - success: ack
//! - failure, no redelivery ceiling: nack with requeue
//! - failure below the ceiling: republish with `x-attempt + 1`, then ack
//! - failure at the ceiling: publish to the DLQ, then ack
//!
//! Retry and DLQ republishes go through the send-side [`Publisher`], never the
//! consume channel. If a republish fails the delivery is nacked with requeue
//! instead.

use crate::{
    backoff::Backoff,
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, ConsumerMessage},
    message::{Delivery, OutboundMessage, AMQP_HEADERS_ATTEMPT},
    otel,
    publisher::Publisher,
    stats::RuntimeStatistics,
    supervisor::ChannelSupervisor,
    topology::Binding,
    transport::{BrokerEvent, Connector, DeliveryStream, Role},
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` requeues forever; `Some(n)` dead-letters after `n` failures.
    pub max_redeliveries: Option<u32>,
}

struct Session {
    events: broadcast::Receiver<BrokerEvent>,
    deliveries: DeliveryStream,
}

enum Settlement {
    Acked,
    Requeued,
    Retried(u32),
    DeadLettered,
}

/// Consumer side of the client.
pub struct Consumer {
    receive: Mutex<ChannelSupervisor>,
    publisher: Arc<Publisher>,
    backoff: Backoff,
    retry: RetryPolicy,
    drain_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    running: AtomicBool,
}

impl Consumer {
    /// Creates a consumer on its own receive-side connection. Failed deliveries
    /// are republished through `publisher`.
    ///
    /// The loop stops once `shutdown` turns `true` (or its sender is dropped).
    pub fn new(
        connector: Arc<dyn Connector>,
        publisher: Arc<Publisher>,
        backoff: Backoff,
        retry: RetryPolicy,
        drain_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Consumer {
            receive: Mutex::new(ChannelSupervisor::new(Role::Receive, connector)),
            publisher,
            backoff,
            retry,
            drain_timeout,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Consumes `binding`'s queue until shutdown, dispatching every delivery to
    /// `handler` with at most `concurrency` deliveries in flight.
    ///
    /// Returns after shutdown once in-flight workers finished or the drain
    /// timeout elapsed. Broker failures never end the loop. A `concurrency` of
    /// 0 is rejected.
    pub async fn consume(
        &self,
        binding: &Binding,
        handler: Arc<dyn ConsumerHandler>,
        concurrency: u16,
    ) -> Result<(), AmqpError> {
        if concurrency == 0 {
            error!(queue = binding.queue_name(), "consumer concurrency must be at least 1");
            return Err(AmqpError::ZeroConcurrency);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AmqpError::AlreadyConsuming);
        }

        let binding = match self.retry.max_redeliveries {
            Some(_) => binding.clone().with_dlq(),
            None => binding.clone(),
        };

        let mut workers = JoinSet::new();
        self.run(&binding, handler, concurrency, &mut workers).await;
        self.drain(&binding, workers).await;

        self.running.store(false, Ordering::Release);
        Ok(())
    }

    async fn run(
        &self,
        binding: &Binding,
        handler: Arc<dyn ConsumerHandler>,
        concurrency: u16,
        workers: &mut JoinSet<()>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let mut force_reconnect = false;
        let mut failures = 0u32;
        let exchange = binding.exchange_name();
        let queue = binding.queue_name();

        'connecting: loop {
            if *shutdown.borrow() {
                break;
            }

            let session = match self.open_session(binding, concurrency, force_reconnect).await {
                Ok(session) => session,
                Err(err) => {
                    failures += 1;
                    force_reconnect = true;
                    let delay = self.backoff.delay(failures);
                    error!(
                        error = err.to_string(),
                        exchange,
                        queue,
                        attempt = failures,
                        "consumer setup failed, trying reconnect in {:?}",
                        delay
                    );

                    tokio::select! {
                        _ = shutdown.changed() => break 'connecting,
                        _ = tokio::time::sleep(delay) => continue 'connecting,
                    }
                }
            };

            failures = 0;
            force_reconnect = true;
            info!(exchange, queue, "consumer connected to RabbitMQ");

            let Session {
                mut events,
                mut deliveries,
            } = session;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'connecting,

                    event = events.recv() => {
                        let event = event.unwrap_or(BrokerEvent::ConnectionClosed);
                        error!(exchange, queue, event = ?event, "consumer lost its connection");
                        break;
                    }

                    Some(joined) = workers.join_next(), if !workers.is_empty() => {
                        if let Err(err) = joined {
                            error!(error = err.to_string(), exchange, queue, "worker task failed");
                        }
                    }

                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            workers.spawn(process(
                                delivery,
                                handler.clone(),
                                self.publisher.clone(),
                                binding.clone(),
                                self.retry,
                            ));
                        }
                        Some(Err(err)) => {
                            error!(error = err.to_string(), exchange, queue, event = ?BrokerEvent::ChannelClosed, "consumer channel failed");
                            break;
                        }
                        None => {
                            error!(exchange, queue, event = ?BrokerEvent::ChannelClosed, "consumer channel closed");
                            break;
                        }
                    },
                }
            }
        }

        info!(exchange, queue, "consumer stopped");
    }

    async fn open_session(
        &self,
        binding: &Binding,
        concurrency: u16,
        force_reconnect: bool,
    ) -> Result<Session, AmqpError> {
        let (channel, events) = {
            let mut receive = self.receive.lock().await;
            let channel = receive.ensure_channel(force_reconnect).await?;
            let events = receive
                .subscribe()
                .ok_or_else(|| AmqpError::ConnectionError("no connection".to_owned()))?;
            (channel, events)
        };

        binding.install(channel.as_ref()).await?;
        channel.qos(concurrency).await?;

        let consumer_tag = Uuid::now_v7().to_string();
        debug!(queue = binding.queue_name(), consumer_tag, "subscribing");
        let deliveries = channel.consume(binding.queue_name(), &consumer_tag).await?;

        Ok(Session {
            events,
            deliveries,
        })
    }

    async fn drain(&self, binding: &Binding, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }

        info!(
            queue = binding.queue_name(),
            in_flight = workers.len(),
            "waiting for in-flight messages"
        );

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                queue = binding.queue_name(),
                in_flight = workers.len(),
                "drain timeout elapsed, aborting workers; their messages will be redelivered"
            );
            workers.shutdown().await;
        }
    }

    /// Closes the receive channel and connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.receive.lock().await.close().await
    }
}

async fn process(
    delivery: Delivery,
    handler: Arc<dyn ConsumerHandler>,
    publisher: Arc<Publisher>,
    binding: Binding,
    retry: RetryPolicy,
) {
    let started = Instant::now();
    let exchange = binding.exchange_name();
    let queue = binding.queue_name();
    let message_id = delivery.message_id.clone();
    let msg_type = delivery.msg_type.clone();

    info!(
        exchange,
        queue,
        message_id = message_id.as_str(),
        msg_type = msg_type.as_str(),
        redelivered = delivery.redelivered,
        "start processing message"
    );

    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &msg_type);
    let msg = ConsumerMessage::from_delivery(queue, &delivery);

    let outcome = match handler.exec(&ctx, &msg).await {
        Ok(()) => delivery.ack().await.map(|_| Settlement::Acked),
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue,
                message_id = message_id.as_str(),
                "error whiling handling msg"
            );
            span.record_error(&err);
            settle_failure(delivery, &publisher, &binding, retry, &err).await
        }
    };

    match &outcome {
        Ok(Settlement::Acked) => span.set_status(Status::Ok),
        Ok(_) => span.set_status(Status::Error {
            description: Cow::from("handler failure"),
        }),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("failure to settle msg"),
            });
        }
    }

    let stats = RuntimeStatistics::since(started);
    match outcome {
        Ok(Settlement::Acked) => info!(
            queue,
            message_id = message_id.as_str(),
            stats = %stats,
            "finish processing message: acked"
        ),
        Ok(Settlement::Requeued) => info!(
            queue,
            message_id = message_id.as_str(),
            stats = %stats,
            "finish processing message: requeued"
        ),
        Ok(Settlement::Retried(attempt)) => info!(
            queue,
            message_id = message_id.as_str(),
            attempt,
            stats = %stats,
            "finish processing message: scheduled for retry"
        ),
        Ok(Settlement::DeadLettered) => error!(
            queue,
            message_id = message_id.as_str(),
            dlq = binding.dlq_name().unwrap_or_default(),
            stats = %stats,
            "too many attempts, message sent to dlq"
        ),
        Err(err) => error!(
            error = err.to_string(),
            queue,
            message_id = message_id.as_str(),
            stats = %stats,
            "finish processing message: settlement failed"
        ),
    }
}

async fn settle_failure(
    delivery: Delivery,
    publisher: &Publisher,
    binding: &Binding,
    retry: RetryPolicy,
    cause: &HandlerError,
) -> Result<Settlement, AmqpError> {
    let (Some(max), Some(dlq)) = (retry.max_redeliveries, binding.dlq_name()) else {
        return delivery.nack(true).await.map(|_| Settlement::Requeued);
    };

    let attempt = delivery.attempts() + 1;
    let exhausted = attempt >= max;
    let destination = if exhausted { dlq } else { binding.queue_name() };

    // Straight to the queue through the default exchange, so other queues bound
    // to the same exchange do not see the retry.
    let mut republished =
        OutboundMessage::new("", destination, &delivery.msg_type, delivery.data.clone())
            .header(AMQP_HEADERS_ATTEMPT, attempt.to_string());
    republished.message_id = delivery.message_id.clone();
    for (key, value) in &delivery.headers {
        republished.headers.entry(key.clone()).or_insert_with(|| value.clone());
    }
    if exhausted {
        republished = republished.header("x-exception", cause.to_string());
    }

    if let Err(err) = publisher.republish(&republished).await {
        error!(
            error = err.to_string(),
            destination,
            message_id = delivery.message_id.as_str(),
            "failure to republish, requeuing"
        );
        delivery.nack(true).await?;
        if exhausted {
            return Err(AmqpError::PublishingToDLQError(destination.to_owned()));
        }
        return Ok(Settlement::Requeued);
    }

    delivery.ack().await?;
    if exhausted {
        Ok(Settlement::DeadLettered)
    } else {
        Ok(Settlement::Retried(attempt))
    }
}
