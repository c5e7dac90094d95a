// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Dispatcher
//!
//! Maps a message type tag to the job handler responsible for it. The registry
//! is filled by the subsystem that owns the jobs (for instance the mail
//! pipeline) before consuming starts; the consumer itself never looks at type
//! tags and only forwards them to [`JobResolver::resolve`].

use crate::{
    errors::HandlerError,
    handler::{ConsumerHandler, ConsumerMessage},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// A job triggered by a message body.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, body: &[u8]) -> Result<(), HandlerError>;
}

/// Registry of job handlers keyed by message type.
#[derive(Clone, Default)]
pub struct JobResolver {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobResolver {
    pub fn new() -> Self {
        JobResolver::default()
    }

    /// Registers `handler` for `msg_type`, replacing any previous one.
    pub fn register(mut self, msg_type: &str, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(msg_type.to_owned(), handler);
        self
    }

    pub fn resolve(&self, msg_type: &str) -> Result<Arc<dyn JobHandler>, HandlerError> {
        self.handlers
            .get(msg_type)
            .cloned()
            .ok_or_else(|| HandlerError::UnsupportedType(msg_type.to_owned()))
    }
}

#[async_trait]
impl ConsumerHandler for JobResolver {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let handler = self.resolve(&msg.msg_type)?;
        debug!(msg_type = msg.msg_type.as_str(), "dispatching message");
        handler.handle(ctx, &msg.data).await
    }
}
