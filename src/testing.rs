// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! It implements the transport seams with RabbitMQ-like semantics: direct
//! routing, per-consumer prefetch, manual acks, requeue on nack and on channel
//! death (with `redelivered = true`), plus failure injection.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Headers, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
    transport::{Acker, BrokerChannel, BrokerConnection, BrokerEvent, Connector, DeliveryStream, Role},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
pub(crate) struct Stored {
    pub message_id: String,
    pub msg_type: String,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

struct ConnState {
    alive: bool,
    events: broadcast::Sender<BrokerEvent>,
}

struct ChanState {
    conn: u64,
    open: bool,
    prefetch: u16,
}

struct ConsumerSlot {
    id: u64,
    channel: u64,
    queue: String,
    prefetch: u16,
    unacked: usize,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct Unacked {
    channel: u64,
    consumer: u64,
    queue: String,
    msg: Stored,
}

#[derive(Default)]
struct State {
    next_id: u64,
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<Stored>>,
    bindings: BTreeSet<(String, String, String)>,
    connections: HashMap<u64, ConnState>,
    channels: HashMap<u64, ChanState>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    fail_connects: usize,
    fail_publishes: usize,
    fail_declares: usize,
    connects: usize,
    delivered: Vec<String>,
    acked: Vec<String>,
    nacked: Vec<String>,
    published: Vec<(String, Role)>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.open)
    }

    fn take_declare_failure(&mut self) -> bool {
        if self.fail_declares > 0 {
            self.fail_declares -= 1;
            return true;
        }
        false
    }

    fn route(&mut self, msg: Stored) {
        let targets: Vec<String> = if msg.exchange.is_empty() {
            vec![msg.routing_key.clone()]
        } else {
            self.bindings
                .iter()
                .filter(|(exchange, _, key)| *exchange == msg.exchange && *key == msg.routing_key)
                .map(|(_, queue, _)| queue.clone())
                .collect()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.push_back(msg.clone());
            }
        }
    }

    fn pump(&mut self, state: &Arc<Mutex<State>>) {
        for idx in 0..self.consumers.len() {
            loop {
                let slot = &self.consumers[idx];
                if slot.prefetch > 0 && slot.unacked >= slot.prefetch as usize {
                    break;
                }
                let Some(msg) = self.queues.get_mut(&slot.queue).and_then(|q| q.pop_front()) else {
                    break;
                };

                let tag = self.next_id();
                let slot = &mut self.consumers[idx];
                let delivery = Delivery::new(
                    msg.message_id.clone(),
                    msg.msg_type.clone(),
                    msg.exchange.clone(),
                    msg.routing_key.clone(),
                    msg.body.clone(),
                    Box::new(FakeAcker {
                        state: state.clone(),
                        channel: slot.channel,
                        tag,
                    }),
                )
                .redelivered(msg.redelivered)
                .headers(msg.headers.clone());

                if slot.tx.send(Ok(delivery)).is_err() {
                    let queue = slot.queue.clone();
                    if let Some(q) = self.queues.get_mut(&queue) {
                        q.push_front(msg);
                    }
                    break;
                }

                slot.unacked += 1;
                self.delivered.push(msg.message_id.clone());
                let unacked = Unacked {
                    channel: slot.channel,
                    consumer: slot.id,
                    queue: slot.queue.clone(),
                    msg,
                };
                self.unacked.insert(tag, unacked);
            }
        }
    }

    fn close_channel(&mut self, channel: u64) {
        if let Some(chan) = self.channels.get_mut(&channel) {
            chan.open = false;
        }
        self.consumers.retain(|slot| slot.channel != channel);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.msg.redelivered = true;
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    q.push_front(unacked.msg);
                }
            }
        }
    }

    fn close_connection(&mut self, conn: u64, notify: bool) {
        if let Some(state) = self.connections.get_mut(&conn) {
            if !state.alive {
                return;
            }
            state.alive = false;
            if notify {
                let _ = state.events.send(BrokerEvent::ConnectionClosed);
            }
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.conn == conn)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }

    fn settle(&mut self, channel: u64, tag: u64, requeue: Option<bool>) -> bool {
        if !self.channel_open(channel) {
            return false;
        }
        let Some(unacked) = self.unacked.remove(&tag) else {
            return false;
        };
        if let Some(slot) = self.consumers.iter_mut().find(|s| s.id == unacked.consumer) {
            slot.unacked -= 1;
        }

        match requeue {
            None => self.acked.push(unacked.msg.message_id),
            Some(requeue) => {
                self.nacked.push(unacked.msg.message_id.clone());
                if requeue {
                    let mut msg = unacked.msg;
                    msg.redelivered = true;
                    if let Some(q) = self.queues.get_mut(&unacked.queue) {
                        q.push_front(msg);
                    }
                }
            }
        }
        true
    }
}

/// Handle on the in-memory broker; clones share the same state.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
        })
    }

    pub async fn open_channel(&self) -> Arc<dyn BrokerChannel> {
        let conn = self.connector().connect(Role::Send).await.unwrap();
        conn.create_channel().await.unwrap()
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().fail_publishes = n;
    }

    pub fn fail_next_declares(&self, n: usize) {
        self.lock().fail_declares = n;
    }

    /// Forgets every exchange, queue and binding while connections stay up,
    /// as a broker restarted without persistence would.
    pub fn drop_topology(&self) {
        let mut state = self.lock();
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
    }

    /// Raises `connection.blocked` on every live connection.
    pub fn block_connections(&self) {
        let state = self.lock();
        for conn in state.connections.values().filter(|c| c.alive) {
            let _ = conn.events.send(BrokerEvent::ConnectionBlocked);
        }
    }

    /// Closes the channels that carry a consumer; their connections stay up.
    pub fn close_consumer_channels(&self) {
        let mut state = self.lock();
        let mut channels: Vec<u64> = state.consumers.iter().map(|slot| slot.channel).collect();
        channels.dedup();
        for channel in channels {
            state.close_channel(channel);
        }
        state.pump(&self.state);
    }

    /// Drops every live connection as if the broker went away.
    pub fn kill_connections(&self) {
        let mut state = self.lock();
        let conns: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.alive)
            .map(|(id, _)| *id)
            .collect();
        for conn in conns {
            state.close_connection(conn, true);
        }
        state.pump(&self.state);
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.alive).count()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.iter().cloned().collect()
    }

    pub fn queue_messages(&self, name: &str) -> Vec<Stored> {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn deliveries_of(&self, message_id: &str) -> usize {
        self.lock().delivered.iter().filter(|id| *id == message_id).count()
    }

    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        self.lock().nacked.clone()
    }

    /// Role of the connection each successful publish of `message_id` went
    /// through.
    pub fn publishers_of(&self, message_id: &str) -> Vec<Role> {
        self.lock()
            .published
            .iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, role)| *role)
            .collect()
    }

    pub fn consumers(&self) -> usize {
        self.lock().consumers.len()
    }
}

/// Polls `cond` until it holds, panicking after a few seconds.
pub(crate) async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct FakeConnector {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, role: Role) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.connects += 1;
        let id = state.next_id();
        let (events, _) = broadcast::channel(16);
        state.connections.insert(
            id,
            ConnState {
                alive: true,
                events: events.clone(),
            },
        );

        Ok(Arc::new(FakeConnection {
            id,
            role,
            state: self.state.clone(),
            events,
        }))
    }
}

struct FakeConnection {
    id: u64,
    role: Role,
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<BrokerEvent>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.connections.get(&self.id).is_some_and(|c| c.alive)
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.connections.get(&self.id).is_some_and(|c| c.alive) {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChanState {
                conn: self.id,
                open: true,
                prefetch: 0,
            },
        );

        Ok(Arc::new(FakeChannel {
            id,
            role: self.role,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.close_connection(self.id, false);
        state.pump(&self.state);
        Ok(())
    }
}

struct FakeChannel {
    id: u64,
    role: Role,
    state: Arc<Mutex<State>>,
}

impl FakeChannel {
    fn lock_open(&self) -> Option<MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap();
        state.channel_open(self.id).then_some(state)
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.state.lock().unwrap().channel_open(self.id)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self
            .lock_open()
            .ok_or_else(|| AmqpError::DeclareExchangeError(def.name.clone()))?;
        if state.take_declare_failure() {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }
        state.exchanges.insert(def.name.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self
            .lock_open()
            .ok_or_else(|| AmqpError::DeclareQueueError(def.name.clone()))?;
        if state.take_declare_failure() {
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }
        state.queues.entry(def.name.clone()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let failed = || {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        };
        let mut state = self.lock_open().ok_or_else(failed)?;
        if state.take_declare_failure()
            || !state.exchanges.contains(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(failed());
        }
        state.bindings.insert((
            binding.exchange_name.clone(),
            binding.queue_name.clone(),
            binding.routing_key.clone(),
        ));
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self
            .lock_open()
            .ok_or_else(|| AmqpError::QoSDeclarationError("channel closed".to_owned()))?;
        if let Some(chan) = state.channels.get_mut(&self.id) {
            chan.prefetch = prefetch;
        }
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut state = self
            .lock_open()
            .ok_or_else(|| AmqpError::PublishingError("channel closed".to_owned()))?;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(AmqpError::PublishingError("injected failure".to_owned()));
        }

        state.route(Stored {
            message_id: msg.message_id.clone(),
            msg_type: msg.msg_type.clone(),
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            headers: msg.headers.clone(),
            body: msg.body.clone(),
            redelivered: false,
        });
        state.published.push((msg.message_id.clone(), self.role));
        state.pump(&self.state);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self
            .lock_open()
            .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id();
        let prefetch = state.channels.get(&self.id).map(|c| c.prefetch).unwrap_or_default();
        state.consumers.push(ConsumerSlot {
            id,
            channel: self.id,
            queue: queue.to_owned(),
            prefetch,
            unacked: 0,
            tx,
        });
        state.pump(&self.state);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.close_channel(self.id);
        state.pump(&self.state);
        Ok(())
    }
}

struct FakeAcker {
    state: Arc<Mutex<State>>,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.settle(self.channel, self.tag, None) {
            return Err(AmqpError::AckMessageError);
        }
        state.pump(&self.state);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.settle(self.channel, self.tag, Some(requeue)) {
            return Err(AmqpError::NackMessageError);
        }
        state.pump(&self.state);
        Ok(())
    }
}
