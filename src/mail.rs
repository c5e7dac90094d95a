// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Mail Jobs
//!
//! The mail pipeline on top of the client: producers enqueue a `confirm` job on
//! `mail-exchange`/`mail-queue`, the mail consumer resolves it to
//! [`UserConfirmationMail`], which decodes the job and hands it to a
//! [`ConfirmationMailer`]. Rendering and sending the email is the mailer's
//! business.

use crate::{
    client::RabbitClient,
    dispatcher::{JobHandler, JobResolver},
    errors::{AmqpError, HandlerError},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

pub const MAIL_EXCHANGE: &str = "mail-exchange";
pub const MAIL_QUEUE: &str = "mail-queue";
/// Message type of the user confirmation job
pub const CONFIRM_SUBJECT: &str = "confirm";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MailJobMessage {
    pub user_id: i64,
    pub subject: String,
    pub token: String,
}

/// Delivers the confirmation email to a user.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfirmationMailer: Send + Sync {
    async fn send_confirmation(
        &self,
        ctx: &Context,
        user_id: i64,
        token: &str,
    ) -> Result<(), HandlerError>;
}

pub struct UserConfirmationMail {
    mailer: Arc<dyn ConfirmationMailer>,
}

impl UserConfirmationMail {
    pub fn new(mailer: Arc<dyn ConfirmationMailer>) -> Self {
        UserConfirmationMail { mailer }
    }
}

#[async_trait]
impl JobHandler for UserConfirmationMail {
    async fn handle(&self, ctx: &Context, body: &[u8]) -> Result<(), HandlerError> {
        let job: MailJobMessage = serde_json::from_slice(body).map_err(|err| {
            error!(error = err.to_string(), "failed to unmarshal mail job");
            HandlerError::ParsePayloadError(err.to_string())
        })?;

        debug!(user_id = job.user_id, "sending confirmation mail");
        self.mailer
            .send_confirmation(ctx, job.user_id, &job.token)
            .await
    }
}

/// Registry of every mail job the mail consumer knows about.
pub fn mail_resolver(mailer: Arc<dyn ConfirmationMailer>) -> JobResolver {
    JobResolver::new().register(CONFIRM_SUBJECT, Arc::new(UserConfirmationMail::new(mailer)))
}

/// Enqueues a confirmation mail for `user_id`.
pub async fn send_confirmation(
    client: &RabbitClient,
    ctx: &Context,
    user_id: i64,
    token: &str,
) -> Result<(), AmqpError> {
    let job = MailJobMessage {
        user_id,
        subject: CONFIRM_SUBJECT.to_owned(),
        token: token.to_owned(),
    };
    let body = serde_json::to_vec(&job).map_err(|err| {
        error!(error = err.to_string(), "failed to marshal mail job");
        AmqpError::InternalError
    })?;

    client
        .publish(ctx, MAIL_EXCHANGE, MAIL_QUEUE, CONFIRM_SUBJECT, body)
        .await
}
