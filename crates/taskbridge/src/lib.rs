//! taskbridge: request/response correlation between a front-end, a
//! coordinator that owns the work handler, and a poll-only execution host.

mod registry;
mod version;

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod host;
pub mod logging;
pub mod server;
pub mod service;
pub mod transport;

pub use broker::{BrokerError, BrokerStatus, CommandBroker, CommandResult, PendingCommand};
pub use client::{CommandClient, CommandReply, FailureKind};
pub use config::{BrokerConfig, ClientConfig, ConfigError, HttpConfig, ServerConfig};
pub use dispatch::{MethodDispatcher, Operation, Resource};
pub use error::{HandlerError, ProtocolError};
pub use handler::{EchoHandler, HandlerResult, WorkHandler};
pub use host::{HostAgent, HostConfig, HostError};
pub use registry::{ConnectionId, ConnectionInfo};
pub use server::{CommandServer, ServerHandle};
pub use service::BridgeService;
pub use version::{RPC_PROTOCOL_VERSION, TASKBRIDGE_VERSION, VersionInfo};
