// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Mail consumer: drains `mail-queue` and sends the queued emails until it
//! receives a termination signal.

use amqp_supervisor::{
    client::RabbitClient,
    configs::Configs,
    errors::HandlerError,
    mail::{self, ConfirmationMailer},
    shutdown::{self, ShutdownCoordinator, StepError},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Stands in for the SMTP mailer: records the mail in the logs.
struct LogMailer;

#[async_trait]
impl ConfirmationMailer for LogMailer {
    async fn send_confirmation(
        &self,
        _ctx: &Context,
        user_id: i64,
        token: &str,
    ) -> Result<(), HandlerError> {
        info!(user_id, token_len = token.len(), "confirmation mail sent");
        Ok(())
    }
}

fn init_logging(cfgs: &Configs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if cfgs.app.env == "dev" {
        builder.init();
    } else {
        builder.json().init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfgs = Configs::load()?;
    init_logging(&cfgs);

    let client = Arc::new(RabbitClient::from_configs(&cfgs));
    let resolver = Arc::new(mail::mail_resolver(Arc::new(LogMailer)));

    let consuming = {
        let client = client.clone();
        let concurrency = cfgs.amqp.concurrency;
        tokio::spawn(async move {
            client
                .consume(mail::MAIL_EXCHANGE, mail::MAIL_QUEUE, resolver, concurrency)
                .await
        })
    };
    info!(
        app = cfgs.app.name.as_str(),
        concurrency = cfgs.amqp.concurrency,
        "mail consumer started"
    );

    shutdown::wait_for_signal().await?;

    let stopping = client.clone();
    let closing = client;
    ShutdownCoordinator::new()
        .step("consumer", move || async move {
            stopping.stop_consuming();
            match consuming.await {
                Ok(result) => result.map_err(StepError::from),
                Err(err) => Err(StepError::from(err)),
            }
        })
        .step("broker", move || async move { closing.close().await })
        .run()
        .await?;

    Ok(())
}
