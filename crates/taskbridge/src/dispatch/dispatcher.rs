//! Session-gated method dispatch.
//!
//! A session must complete `initialize` before any other method is served.
//! `tools/call` is handed to an [`Executor`]: either the local work handler
//! or the command broker, which forwards to a poll-only execution host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::broker::{BrokerError, CommandBroker};
use crate::handler::{WorkHandler, invoke_blocking};
use crate::version::VersionInfo;

use super::rpc::{Payload, RpcError, RpcRequest, RpcResponse, parse_request};
use super::session::{SessionError, SessionId, SessionState, SessionStore};

/// A callable operation advertised by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl Operation {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: json!({ "type": "object" }),
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// A readable resource advertised by `resources/list`.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The execution host reported failure.
    Application,
    /// No result arrived from the execution host in time.
    BridgeTimeout,
    /// The broker is shutting down.
    BridgeUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type ToolOutcome = Result<Value, ToolFailure>;

/// Runs a `tools/call` request.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, operation: &str, arguments: Value) -> ToolOutcome;
}

/// Runs operations in-process through the work handler.
///
/// The handler receives `{"operation": .., "parameters": ..}` as its request
/// string.
pub struct DirectExecutor {
    handler: Arc<dyn WorkHandler>,
}

impl DirectExecutor {
    pub fn new(handler: Arc<dyn WorkHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Executor for DirectExecutor {
    async fn execute(&self, operation: &str, arguments: Value) -> ToolOutcome {
        let request = json!({ "operation": operation, "parameters": arguments }).to_string();
        invoke_blocking(Arc::clone(&self.handler), request)
            .await
            .map(Value::String)
            .map_err(|e| ToolFailure::new(FailureKind::Application, e.to_string()))
    }
}

/// Forwards operations to the execution host through the command broker.
pub struct BridgeExecutor {
    broker: Arc<CommandBroker>,
    timeout: Duration,
}

impl BridgeExecutor {
    pub fn new(broker: Arc<CommandBroker>) -> Self {
        let timeout = broker.config().result_timeout;
        Self { broker, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Executor for BridgeExecutor {
    async fn execute(&self, operation: &str, arguments: Value) -> ToolOutcome {
        match self.broker.call(operation, arguments, self.timeout).await {
            Ok(result) if result.success => Ok(result.result),
            Ok(result) => {
                let message = match result.result {
                    Value::String(s) => s,
                    Value::Null => "execution host reported failure".to_string(),
                    other => other.to_string(),
                };
                Err(ToolFailure::new(FailureKind::Application, message))
            }
            Err(e @ BrokerError::Timeout { .. }) => {
                Err(ToolFailure::new(FailureKind::BridgeTimeout, e.to_string()))
            }
            Err(e) => Err(ToolFailure::new(FailureKind::BridgeUnavailable, e.to_string())),
        }
    }
}

/// Reasons a single method call is refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("session not initialized")]
    NotInitialized,

    #[error("session already initialized")]
    AlreadyInitialized,

    #[error("unknown session")]
    UnknownSession,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),
}

impl From<DispatchError> for RpcError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotInitialized => RpcError::session_not_initialized(),
            DispatchError::AlreadyInitialized => {
                RpcError::invalid_request("session already initialized")
            }
            DispatchError::UnknownSession => RpcError::invalid_request("unknown or closed session"),
            DispatchError::MethodNotFound(method) => RpcError::method_not_found(&method),
            DispatchError::InvalidParams(details) => RpcError::invalid_params(details),
        }
    }
}

impl From<SessionError> for DispatchError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unknown(_) => DispatchError::UnknownSession,
            SessionError::AlreadyInitialized => DispatchError::AlreadyInitialized,
        }
    }
}

const METHODS: &[&str] = &[
    "initialize",
    "ping",
    "tools/list",
    "tools/call",
    "resources/list",
];

pub struct MethodDispatcher {
    info: VersionInfo,
    operations: Vec<Operation>,
    resources: Vec<Resource>,
    executor: Arc<dyn Executor>,
    sessions: SessionStore,
}

impl MethodDispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            info: VersionInfo::new(),
            operations: Vec::new(),
            resources: Vec::new(),
            executor,
            sessions: SessionStore::new(),
        }
    }

    pub fn with_info(mut self, info: VersionInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn open_session(&self) -> SessionId {
        let id = self.sessions.create();
        tracing::debug!(target: "taskbridge::dispatch", session_id = %id, "Opened session");
        id
    }

    /// Returns false if the session was unknown.
    pub fn close_session(&self, id: &SessionId) -> bool {
        let closed = self.sessions.close(id).is_some();
        if closed {
            tracing::debug!(target: "taskbridge::dispatch", session_id = %id, "Closed session");
        }
        closed
    }

    /// Dispatch a decoded body within `session`.
    ///
    /// Returns `None` when nothing should be sent back: a lone notification
    /// or a batch made only of notifications.
    pub async fn dispatch(&self, session: &SessionId, payload: Payload) -> Option<Value> {
        match payload {
            Payload::Single(message) => self
                .dispatch_message(session, message)
                .await
                .map(RpcResponse::into_value),
            Payload::Batch(messages) if messages.is_empty() => Some(
                RpcResponse::failure(Value::Null, RpcError::invalid_request("empty batch"))
                    .into_value(),
            ),
            Payload::Batch(messages) => {
                let mut responses = Vec::with_capacity(messages.len());
                // Sequential so an `initialize` earlier in the batch gates later members.
                for message in messages {
                    if let Some(response) = self.dispatch_message(session, message).await {
                        responses.push(response.into_value());
                    }
                }
                (!responses.is_empty()).then_some(Value::Array(responses))
            }
        }
    }

    async fn dispatch_message(&self, session: &SessionId, message: Value) -> Option<RpcResponse> {
        let request = match parse_request(message) {
            Ok(request) => request,
            Err((id, error)) => {
                tracing::debug!(target: "taskbridge::dispatch", %session, error = %error, "Invalid request");
                return Some(RpcResponse::failure(id, error));
            }
        };

        let RpcRequest { id, method, params } = request;
        let outcome = self.call(session, &method, params).await;

        let id = match id {
            Some(id) => id,
            None => {
                if let Err(e) = outcome {
                    tracing::debug!(
                        target: "taskbridge::dispatch",
                        %session,
                        %method,
                        error = %e,
                        "Notification failed"
                    );
                }
                return None;
            }
        };

        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(e) => RpcResponse::failure(id, e.into()),
        })
    }

    async fn call(
        &self,
        session: &SessionId,
        method: &str,
        params: Value,
    ) -> Result<Value, DispatchError> {
        if method == "initialize" {
            return self.initialize(session, params);
        }
        if method.starts_with("notifications/") {
            return Ok(json!({}));
        }

        match self.sessions.state(session) {
            Some(SessionState::Initialized) => {}
            Some(_) => {
                tracing::debug!(target: "taskbridge::dispatch", %session, method, "Rejected before initialize");
                return Err(DispatchError::NotInitialized);
            }
            None => return Err(DispatchError::UnknownSession),
        }

        match method {
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.operations })),
            "resources/list" => Ok(json!({ "resources": self.resources })),
            "tools/call" => self.call_tool(session, params).await,
            other => Err(DispatchError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self, session: &SessionId, params: Value) -> Result<Value, DispatchError> {
        let client_info = params.get("clientInfo").cloned();
        self.sessions.initialize(session, client_info)?;
        tracing::info!(target: "taskbridge::dispatch", %session, "Session initialized");

        Ok(json!({
            "protocolVersion": self.info.protocol_version,
            "serverInfo": {
                "name": self.info.name,
                "version": self.info.version,
            },
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
            },
            "methods": METHODS,
        }))
    }

    async fn call_tool(&self, session: &SessionId, params: Value) -> Result<Value, DispatchError> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(DispatchError::InvalidParams(
                "tools/call requires a string 'name'".to_string(),
            ));
        };
        if !self.operations.iter().any(|op| op.name == name) {
            return Err(DispatchError::InvalidParams(format!("unknown tool '{}'", name)));
        }
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        tracing::info!(target: "taskbridge::dispatch", %session, tool = name, "Calling tool");
        let outcome = self.executor.execute(name, arguments).await;
        Ok(tool_result(outcome))
    }
}

fn tool_result(outcome: ToolOutcome) -> Value {
    match outcome {
        Ok(value) => {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false,
            })
        }
        Err(failure) => json!({
            "content": [{ "type": "text", "text": failure.message }],
            "isError": true,
            "errorKind": failure.kind,
        }),
    }
}
