// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Graceful Shutdown
//!
//! Teardown steps run one after the other, in the order they were added. The
//! first failing step aborts the sequence and is reported to the caller, which
//! is expected to exit with a failure status.

use futures_util::{future::BoxFuture, FutureExt};
use std::future::Future;
use thiserror::Error;
use tracing::{error, info};

pub type StepError = Box<dyn std::error::Error + Send + Sync>;

type Step = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StepError>> + Send>;

#[derive(Error, Debug)]
#[error("shutdown step `{step}` failed: {source}")]
pub struct ShutdownError {
    pub step: String,
    #[source]
    pub source: StepError,
}

#[derive(Default)]
pub struct ShutdownCoordinator {
    steps: Vec<(String, Step)>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        ShutdownCoordinator::default()
    }

    /// Appends a teardown step. `op` is only invoked when the step runs.
    pub fn step<F, Fut, E>(mut self, name: &str, op: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<StepError>,
    {
        let step: Step = Box::new(move || {
            async move {
                let result: Result<(), StepError> = op().await.map_err(Into::into);
                result
            }
            .boxed()
        });

        self.steps.push((name.to_owned(), step));
        self
    }

    /// Runs every step in order, stopping at the first failure.
    pub async fn run(self) -> Result<(), ShutdownError> {
        for (name, op) in self.steps {
            info!(step = name.as_str(), "shutting down");

            if let Err(source) = op().await {
                error!(step = name.as_str(), error = source.to_string(), "shutdown step failed");
                return Err(ShutdownError { step: name, source });
            }
        }

        info!("graceful shutdown complete");
        Ok(())
    }

}

/// Resolves on SIGINT, SIGTERM, SIGQUIT or SIGHUP.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let received = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
        _ = hangup.recv() => "SIGHUP",
    };

    info!(signal = received, "shutdown signal received");
    Ok(())
}

/// Resolves on Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "shutdown signal received");
    Ok(())
}
