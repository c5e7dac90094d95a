// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchanges
//!
//! Declaration arguments for exchanges. The client routes every message by
//! queue name, so it only ever declares direct exchanges.

/// Arguments of an `exchange.declare` for a direct exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// A transient direct exchange called `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}
