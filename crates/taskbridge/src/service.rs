//! Shared state behind the HTTP bridge.
//!
//! Owns the command broker and the method dispatcher, and carries the
//! shutdown signal the HTTP server waits on.

use std::sync::Arc;

use tokio::sync::watch;

use crate::broker::CommandBroker;
use crate::config::BrokerConfig;
use crate::dispatch::{BridgeExecutor, MethodDispatcher, Operation};
use crate::version::VersionInfo;

pub struct BridgeService {
    broker: Arc<CommandBroker>,
    dispatcher: Arc<MethodDispatcher>,
    version: VersionInfo,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeService {
    pub fn new(broker: Arc<CommandBroker>, dispatcher: Arc<MethodDispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            broker,
            dispatcher,
            version: VersionInfo::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Broker plus a dispatcher whose `tools/call` goes through that broker.
    pub fn bridged(config: BrokerConfig, operations: Vec<Operation>) -> Self {
        let broker = Arc::new(CommandBroker::new(config));
        let executor = BridgeExecutor::new(Arc::clone(&broker));
        let dispatcher = operations
            .into_iter()
            .fold(MethodDispatcher::new(Arc::new(executor)), |d, op| {
                d.with_operation(op)
            });
        Self::new(broker, Arc::new(dispatcher))
    }

    pub fn broker(&self) -> &Arc<CommandBroker> {
        &self.broker
    }

    pub fn dispatcher(&self) -> &Arc<MethodDispatcher> {
        &self.dispatcher
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    /// Close the broker so in-flight waits fail fast instead of timing out.
    pub fn shutdown(&self) {
        self.broker.close();
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}
