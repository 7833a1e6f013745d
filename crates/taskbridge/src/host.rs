//! Reference execution host.
//!
//! Polls the HTTP bridge for pending commands, runs each one through a
//! `WorkHandler` and posts the outcome back. Real hosts implement the same
//! loop in whatever environment they live in.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::broker::{CommandResult, PendingCommand};
use crate::handler::{WorkHandler, invoke_blocking};

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Extra attempts when posting a result fails.
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bridge responded with status {0}")]
    Status(u16),
}

pub struct HostAgent {
    base_url: String,
    config: HostConfig,
    client: reqwest::Client,
    handler: Arc<dyn WorkHandler>,
}

impl HostAgent {
    pub fn new(
        base_url: impl Into<String>,
        handler: Arc<dyn WorkHandler>,
        config: HostConfig,
    ) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let base_url: String = base_url.into();

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            client,
            handler,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch and execute every pending command once.
    ///
    /// Polled commands belong to this host, so every one is executed and
    /// reported even when posting an earlier result fails. The first post
    /// failure is returned after the batch. Otherwise returns how many
    /// commands were executed.
    pub async fn poll_once(&self) -> Result<usize, HostError> {
        let response = self
            .client
            .get(format!("{}/pending_commands", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HostError::Status(response.status().as_u16()));
        }
        let commands: Vec<PendingCommand> = response.json().await?;

        let count = commands.len();
        let mut first_error = None;
        for command in commands {
            let result = self.execute(command).await;
            if let Err(e) = self.post_result(&result).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    async fn execute(&self, command: PendingCommand) -> CommandResult {
        let PendingCommand {
            id,
            operation,
            parameters,
            ..
        } = command;
        tracing::info!(command_id = %id, %operation, "Executing command");

        let request = json!({ "operation": operation, "parameters": parameters }).to_string();
        match invoke_blocking(Arc::clone(&self.handler), request).await {
            Ok(output) => CommandResult::new(id, true, Value::String(output)),
            Err(e) => {
                tracing::warn!(command_id = %id, error = %e, "Command failed");
                CommandResult::new(id, false, Value::String(e.to_string()))
            }
        }
    }

    async fn post_result(&self, result: &CommandResult) -> Result<(), HostError> {
        let url = format!("{}/command_result", self.base_url);
        let mut attempt = 0;
        loop {
            let error = match self.client.post(&url).json(result).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                // Client errors will not improve on retry.
                Ok(response) if response.status().is_client_error() => {
                    return Err(HostError::Status(response.status().as_u16()));
                }
                Ok(response) => HostError::Status(response.status().as_u16()),
                Err(e) => HostError::Http(e),
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                tracing::error!(
                    command_id = %result.command_id,
                    attempts = attempt,
                    error = %error,
                    "Giving up posting command result"
                );
                return Err(error);
            }

            let backoff = self.config.backoff_base * (1 << attempt.min(10));
            tracing::warn!(
                command_id = %result.command_id,
                attempt,
                backoff_ms = backoff.as_millis(),
                error = %error,
                "Posting command result failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Poll until `shutdown` is cancelled. Errors are logged and retried on
    /// the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(bridge = %self.base_url, "Execution host polling");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(executed = n, "Poll complete"),
                Err(e) => tracing::warn!(error = %e, "Poll failed"),
            }
        }
        tracing::info!("Execution host stopped");
    }
}
