// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Channel Supervision
//!
//! One [`ChannelSupervisor`] exists per role. It owns a [`ConnectionSupervisor`]
//! and at most one channel opened on that supervisor's connection. Neither
//! supervisor retries on its own: callers loop, force a reconnect and back off.
//!
//! A channel is tagged with the generation of the connection that created it,
//! so a channel never outlives its connection: once the connection is replaced
//! the next `ensure_channel` opens a new channel on the new connection.

use crate::{
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection, BrokerEvent, Connector, Role},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Owns the connection of one role.
pub struct ConnectionSupervisor {
    role: Role,
    connector: Arc<dyn Connector>,
    current: Option<Arc<dyn BrokerConnection>>,
    generation: u64,
}

impl ConnectionSupervisor {
    pub fn new(role: Role, connector: Arc<dyn Connector>) -> Self {
        ConnectionSupervisor {
            role,
            connector,
            current: None,
            generation: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of connections opened so far by this supervisor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the live connection, dialing a new one when there is none.
    ///
    /// `force_reconnect` discards the current connection unconditionally.
    pub async fn ensure_connection(
        &mut self,
        force_reconnect: bool,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if force_reconnect {
            self.invalidate();
        }

        if let Some(conn) = &self.current {
            if conn.is_connected() {
                return Ok(conn.clone());
            }

            debug!(role = %self.role, "connection is no longer alive");
            self.current = None;
        }

        let conn = self.connector.connect(self.role).await?;
        self.generation += 1;
        self.current = Some(conn.clone());

        Ok(conn)
    }

    /// Notifications of the current connection, if any.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BrokerEvent>> {
        self.current.as_ref().map(|conn| conn.subscribe())
    }

    /// Drops the current connection, closing it in the background.
    pub fn invalidate(&mut self) {
        if let Some(conn) = self.current.take() {
            let role = self.role;
            tokio::spawn(async move {
                if let Err(err) = conn.close().await {
                    debug!(role = %role, error = err.to_string(), "discarded connection did not close cleanly");
                }
            });
        }
    }

    /// Closes the current connection and waits for the broker to confirm.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        match self.current.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

/// Owns the channel of one role, on top of that role's connection.
pub struct ChannelSupervisor {
    connections: ConnectionSupervisor,
    current: Option<(u64, Arc<dyn BrokerChannel>)>,
    opened: u64,
}

impl ChannelSupervisor {
    pub fn new(role: Role, connector: Arc<dyn Connector>) -> Self {
        ChannelSupervisor {
            connections: ConnectionSupervisor::new(role, connector),
            current: None,
            opened: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.connections.role()
    }

    /// Number of channels opened so far. Changes every time a new channel is
    /// handed out.
    pub fn channel_generation(&self) -> u64 {
        self.opened
    }

    /// Returns the live channel, recreating it (and, when needed, its
    /// connection) otherwise.
    ///
    /// `force_reconnect` discards both the channel and the connection.
    pub async fn ensure_channel(
        &mut self,
        force_reconnect: bool,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if force_reconnect {
            self.invalidate_channel();
        }

        let conn = self.connections.ensure_connection(force_reconnect).await?;
        let generation = self.connections.generation();

        if let Some((owner, channel)) = &self.current {
            if *owner == generation && channel.is_open() {
                return Ok(channel.clone());
            }
        }
        self.invalidate_channel();

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(role = %self.role(), error = err.to_string(), "failure to create channel");
                return Err(err);
            }
        };
        self.opened += 1;
        self.current = Some((generation, channel.clone()));

        Ok(channel)
    }

    /// Notifications of the connection backing the current channel.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BrokerEvent>> {
        self.connections.subscribe()
    }

    /// Discards the channel and its connection; the next `ensure_channel`
    /// dials again.
    pub fn invalidate(&mut self) {
        self.invalidate_channel();
        self.connections.invalidate();
    }

    fn invalidate_channel(&mut self) {
        if let Some((_, channel)) = self.current.take() {
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
        }
    }

    /// Closes the channel first, then its connection.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        if let Some((_, channel)) = self.current.take() {
            channel.close().await?;
        }

        self.connections.close().await
    }
}
