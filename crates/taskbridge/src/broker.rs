//! Pull-based command queue between callers and a poll-only execution host.
//!
//! Callers `enqueue` a command and `await_result` on its ID. The host drains
//! the queue with `poll_pending` and reports back with `submit_result`,
//! which wakes the waiter directly through a oneshot channel. A result that
//! arrives before anyone waits for it is buffered, so ordering between the
//! host and the caller does not matter.
//!
//! All state sits behind one std mutex. No method holds it across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::now_iso8601;
use crate::config::BrokerConfig;

/// A command waiting for the execution host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
    pub timestamp: String,
}

/// Result reported by the execution host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default = "now_iso8601")]
    pub timestamp: String,
}

impl CommandResult {
    pub fn new(command_id: impl Into<String>, success: bool, result: Value) -> Self {
        Self {
            command_id: command_id.into(),
            success,
            result,
            timestamp: now_iso8601(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("no result for command {command_id} after {waited:?}")]
    Timeout { command_id: String, waited: Duration },

    #[error("command broker closed")]
    Closed,

    #[error("command {0} already has a waiter")]
    AlreadyAwaited(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub pending_commands: usize,
    pub completed_commands: u64,
    pub command_history: Vec<CommandResult>,
    pub server_time: String,
}

#[derive(Default)]
struct State {
    pending: VecDeque<PendingCommand>,
    results: HashMap<String, CommandResult>,
    // Arrival order of buffered results, oldest first. May hold IDs that
    // were already claimed; those are skipped when trimming.
    result_order: VecDeque<String>,
    waiters: HashMap<String, Waiter>,
    next_waiter: u64,
    history: VecDeque<CommandResult>,
    completed: u64,
    closed: bool,
}

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<CommandResult>,
}

/// Deregisters a waiter when its `await_result` future finishes or is
/// dropped. Only removes the entry it registered.
struct Registration<'a> {
    broker: &'a CommandBroker,
    command_id: &'a str,
    seq: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        if state
            .waiters
            .get(self.command_id)
            .is_some_and(|waiter| waiter.seq == self.seq)
        {
            state.waiters.remove(self.command_id);
        }
    }
}

pub struct CommandBroker {
    config: BrokerConfig,
    state: Mutex<State>,
}

impl Default for CommandBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl CommandBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::error!(target: "taskbridge::broker", "Broker state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Queue a command for the execution host and return its ID.
    pub fn enqueue(&self, operation: impl Into<String>, parameters: Value) -> String {
        let command = PendingCommand {
            id: format!("cmd_{}", uuid::Uuid::new_v4().simple()),
            operation: operation.into(),
            parameters,
            timestamp: now_iso8601(),
        };
        let id = command.id.clone();

        let depth = {
            let mut state = self.lock();
            state.pending.push_back(command);
            state.pending.len()
        };
        tracing::debug!(target: "taskbridge::broker", command_id = %id, depth, "Enqueued command");
        id
    }

    /// Take every pending command. Each command is handed out exactly once.
    pub fn poll_pending(&self) -> Vec<PendingCommand> {
        let drained: Vec<PendingCommand> = self.lock().pending.drain(..).collect();
        if !drained.is_empty() {
            tracing::debug!(target: "taskbridge::broker", count = drained.len(), "Host polled commands");
        }
        drained
    }

    /// Record a result from the execution host.
    ///
    /// Wakes the matching waiter if there is one, otherwise buffers the
    /// result for a later `await_result`.
    pub fn submit_result(&self, result: CommandResult) {
        let command_id = result.command_id.clone();
        let mut state = self.lock();

        state.completed += 1;
        state.history.push_back(result.clone());
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }

        let result = match state.waiters.remove(&command_id) {
            Some(waiter) => match waiter.tx.send(result) {
                Ok(()) => {
                    drop(state);
                    tracing::debug!(target: "taskbridge::broker", %command_id, "Delivered result to waiter");
                    return;
                }
                // Waiter gave up between timing out and deregistering.
                Err(result) => result,
            },
            None => result,
        };

        if state.results.insert(command_id.clone(), result).is_none() {
            state.result_order.push_back(command_id.clone());
        }
        self.trim_results(&mut state);
        drop(state);
        tracing::debug!(target: "taskbridge::broker", %command_id, "Buffered result");
    }

    fn trim_results(&self, state: &mut State) {
        let limit = self.config.history_limit;
        while state.results.len() > limit {
            match state.result_order.pop_front() {
                Some(oldest) => {
                    if state.results.remove(&oldest).is_some() {
                        tracing::debug!(
                            target: "taskbridge::broker",
                            command_id = %oldest,
                            "Dropped unclaimed result"
                        );
                    }
                }
                None => break,
            }
        }
        if state.result_order.len() > limit.saturating_mul(2) {
            let State {
                results,
                result_order,
                ..
            } = state;
            result_order.retain(|id| results.contains_key(id));
        }
    }

    /// Wait up to `timeout` for the result of `command_id`.
    ///
    /// A buffered result is returned (and consumed) immediately. Dropping
    /// the returned future releases the wait, so another caller can await
    /// the same ID and a late result is buffered.
    pub async fn await_result(
        &self,
        command_id: &str,
        timeout: Duration,
    ) -> Result<CommandResult, BrokerError> {
        let (registration, mut rx) = {
            let mut state = self.lock();
            if let Some(result) = state.results.remove(command_id) {
                return Ok(result);
            }
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(existing) = state.waiters.get(command_id)
                && !existing.tx.is_closed()
            {
                return Err(BrokerError::AlreadyAwaited(command_id.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_waiter;
            state.next_waiter += 1;
            state
                .waiters
                .insert(command_id.to_string(), Waiter { seq, tx });
            let registration = Registration {
                broker: self,
                command_id,
                seq,
            };
            (registration, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                drop(registration);
                // submit_result may have won the race before we deregistered.
                if let Ok(result) = rx.try_recv() {
                    return Ok(result);
                }
                tracing::warn!(
                    target: "taskbridge::broker",
                    %command_id,
                    waited = ?timeout,
                    "Timed out waiting for command result"
                );
                Err(BrokerError::Timeout {
                    command_id: command_id.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Enqueue a command and wait for its result.
    pub async fn call(
        &self,
        operation: impl Into<String>,
        parameters: Value,
        timeout: Duration,
    ) -> Result<CommandResult, BrokerError> {
        let command_id = self.enqueue(operation, parameters);
        self.await_result(&command_id, timeout).await
    }

    pub fn status(&self) -> BrokerStatus {
        let state = self.lock();
        let skip = state
            .history
            .len()
            .saturating_sub(self.config.status_history);
        BrokerStatus {
            pending_commands: state.pending.len(),
            completed_commands: state.completed,
            command_history: state.history.iter().skip(skip).cloned().collect(),
            server_time: now_iso8601(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Fail every outstanding and future wait with `BrokerError::Closed`.
    pub fn close(&self) {
        let mut state = self.lock();
        if std::mem::replace(&mut state.closed, true) {
            return;
        }
        let waiters = state.waiters.len();
        state.waiters.clear();
        drop(state);
        tracing::info!(target: "taskbridge::broker", waiters, "Command broker closed");
    }
}
