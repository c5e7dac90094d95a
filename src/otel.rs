// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context over Message Headers
//!
//! Propagates trace context through message headers: the publisher injects the
//! caller's context, the consumer extracts it and opens a span per delivery.

use crate::message::Headers;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Creates a new consumer span for processing a message.
///
/// Returns the extracted parent context together with the new span.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
