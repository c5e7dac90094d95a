// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ client: supervised role-scoped connections and channels,
//! at-least-once publishing, prefetch-bounded consumers with ack/nack, a job
//! dispatch registry and an ordered shutdown sequence.

mod otel;

pub mod backoff;
pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod mail;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod stats;
pub mod supervisor;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;
