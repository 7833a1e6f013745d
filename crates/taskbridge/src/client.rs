//! Front-end side of the coordinator channel.
//!
//! Holds at most one persistent connection, opened lazily on first use. A
//! call never fails with an `Err`: every transport fault is folded into a
//! `CommandReply` with `success: false`, and the broken connection is
//! dropped so the next call reconnects.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{CommandRequest, CommandResponse, ResponseKind};
use crate::config::ClientConfig;

/// Why a call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Could not connect, or the connection broke mid-call.
    Transport,
    /// No response within the configured budget.
    Timeout,
    /// The server sent something that does not answer this request.
    Protocol,
    /// The server answered with `success: false`.
    Application,
}

/// Outcome of one `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    pub task_id: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl CommandReply {
    fn from_response(response: CommandResponse) -> Self {
        let failure = match (response.success, response.kind) {
            (true, ResponseKind::CommandResponse) => None,
            _ => Some(FailureKind::Application),
        };
        Self {
            task_id: response.task_id,
            success: failure.is_none(),
            message: response.message,
            failure,
        }
    }

    fn from_transport(task_id: String, error: &TransportError) -> Self {
        Self {
            task_id,
            success: false,
            message: error.to_string(),
            failure: Some(error.kind()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.failure == Some(FailureKind::Timeout)
    }
}

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("timed out after {0:?} connecting to {1}")]
    ConnectTimeout(Duration, String),

    #[error("failed to send request: {0}")]
    Send(io::Error),

    #[error("failed to read response: {0}")]
    Receive(io::Error),

    #[error("connection closed by coordinator")]
    Closed,

    #[error("request timed out after {0:?} waiting for response")]
    ResponseTimeout(Duration),

    #[error("response correlation mismatch: expected task '{expected}', got '{actual}'")]
    Mismatch { expected: String, actual: String },
}

impl TransportError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::ConnectTimeout(..) | Self::ResponseTimeout(_) => FailureKind::Timeout,
            Self::Mismatch { .. } => FailureKind::Protocol,
            Self::Receive(e) if e.kind() == io::ErrorKind::InvalidData => FailureKind::Protocol,
            _ => FailureKind::Transport,
        }
    }
}

struct Connection {
    reader: FramedRead<OwnedReadHalf, JsonCodec<CommandResponse>>,
    writer: FramedWrite<OwnedWriteHalf, JsonCodec<CommandRequest>>,
}

impl Connection {
    async fn roundtrip(&mut self, request: CommandRequest) -> Result<CommandResponse, TransportError> {
        let expected = request.task_id.clone();
        self.writer.send(request).await.map_err(TransportError::Send)?;

        let response = match self.reader.next().await {
            Some(Ok(response)) => response,
            Some(Err(e)) => return Err(TransportError::Receive(e)),
            None => return Err(TransportError::Closed),
        };

        if response.task_id != expected {
            return Err(TransportError::Mismatch {
                expected,
                actual: response.task_id,
            });
        }
        Ok(response)
    }
}

/// Client for the framed TCP coordinator channel.
///
/// Calls on one client are serialised over its single connection, so
/// replies always arrive in request order. Time spent queued behind other
/// calls counts against each call's response budget.
pub struct CommandClient {
    config: ClientConfig,
    conn: Mutex<Option<Connection>>,
}

impl CommandClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a request under a freshly generated task ID.
    pub async fn send(&self, user_request: impl Into<String>) -> CommandReply {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.send_with_id(task_id, user_request).await
    }

    /// Send a request under a caller-chosen task ID.
    pub async fn send_with_id(
        &self,
        task_id: impl Into<String>,
        user_request: impl Into<String>,
    ) -> CommandReply {
        let task_id = task_id.into();
        let request = CommandRequest::new(task_id.clone(), user_request);
        let budget = self.config.response_timeout;
        let deadline = tokio::time::Instant::now() + budget;

        let mut slot = match tokio::time::timeout_at(deadline, self.conn.lock()).await {
            Ok(slot) => slot,
            Err(_) => {
                let e = TransportError::ResponseTimeout(budget);
                tracing::warn!(
                    target: "taskbridge::client",
                    %task_id,
                    "Timed out waiting behind earlier requests"
                );
                return CommandReply::from_transport(task_id, &e);
            }
        };
        match self.exchange(&mut slot, request, deadline).await {
            Ok(response) => {
                tracing::debug!(
                    target: "taskbridge::client",
                    %task_id,
                    success = response.success,
                    "Received response"
                );
                CommandReply::from_response(response)
            }
            Err(e) => {
                // Never reuse a socket that faulted; a late reply would desync it.
                *slot = None;
                tracing::warn!(target: "taskbridge::client", %task_id, error = %e, "Request failed");
                CommandReply::from_transport(task_id, &e)
            }
        }
    }

    async fn exchange(
        &self,
        slot: &mut Option<Connection>,
        request: CommandRequest,
        deadline: tokio::time::Instant,
    ) -> Result<CommandResponse, TransportError> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(TransportError::Closed);
        };

        match tokio::time::timeout_at(deadline, conn.roundtrip(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ResponseTimeout(self.config.response_timeout)),
        }
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let addr = self.config.addr.clone();
        tracing::debug!(target: "taskbridge::client", %addr, "Connecting to coordinator");

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => {
                return Err(TransportError::ConnectTimeout(
                    self.config.connect_timeout,
                    addr,
                ));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(target: "taskbridge::client", error = %e, "Failed to set TCP_NODELAY");
        }

        let max = self.config.max_frame_length;
        let (read_half, write_half) = stream.into_split();
        tracing::info!(target: "taskbridge::client", %addr, "Connected to coordinator");
        Ok(Connection {
            reader: FramedRead::new(read_half, JsonCodec::with_max_frame_length(max)),
            writer: FramedWrite::new(write_half, JsonCodec::with_max_frame_length(max)),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Drop the current connection, if any. The next call reconnects.
    pub async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            tracing::debug!(target: "taskbridge::client", "Closed coordinator connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    /// Fake coordinator answering each request with the given task ID override.
    async fn spawn_fake_server(reply_task_id: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (r, w) = stream.into_split();
                    let mut reader = FramedRead::new(r, JsonCodec::<CommandRequest>::new());
                    let mut writer = FramedWrite::new(w, JsonCodec::<CommandResponse>::new());
                    while let Some(Ok(req)) = reader.next().await {
                        let task_id = reply_task_id.map(str::to_string).unwrap_or(req.task_id);
                        let resp = CommandResponse::success(task_id, req.user_request);
                        if writer.send(resp).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn connect_refused_returns_failure_reply() {
        let client = CommandClient::new(ClientConfig::new(unused_addr().await));

        let reply = client.send_with_id("t-1", "ping").await;

        assert!(!reply.success);
        assert_eq!(reply.task_id, "t-1");
        assert_eq!(reply.failure, Some(FailureKind::Transport));
        assert!(reply.message.contains("failed to connect"));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn reply_carries_request_task_id() {
        let client = CommandClient::new(ClientConfig::new(spawn_fake_server(None).await));

        let reply = client.send_with_id("abc123", "ping").await;

        assert!(reply.success);
        assert_eq!(reply.task_id, "abc123");
        assert_eq!(reply.message, "ping");
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn generated_task_ids_are_unique() {
        let client = CommandClient::new(ClientConfig::new(spawn_fake_server(None).await));

        let a = client.send("one").await;
        let b = client.send("two").await;

        assert!(a.success && b.success);
        assert_ne!(a.task_id, b.task_id);
    }

    #[tokio::test]
    async fn mismatched_task_id_is_a_protocol_failure() {
        let client =
            CommandClient::new(ClientConfig::new(spawn_fake_server(Some("someone-else")).await));

        let reply = client.send_with_id("mine", "ping").await;

        assert!(!reply.success);
        assert_eq!(reply.task_id, "mine");
        assert_eq!(reply.failure, Some(FailureKind::Protocol));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accept and hold the socket without ever replying.
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = CommandClient::new(
            ClientConfig::new(addr).with_response_timeout(Duration::from_millis(200)),
        );
        let started = std::time::Instant::now();
        let reply = client.send_with_id("slow", "ping").await;

        assert!(!reply.success);
        assert!(reply.is_timeout());
        assert!(reply.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!client.is_connected().await);
        holder.abort();
    }

    #[tokio::test]
    async fn queued_call_is_bounded_by_its_own_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = std::sync::Arc::new(CommandClient::new(
            ClientConfig::new(addr).with_response_timeout(Duration::from_millis(500)),
        ));
        let started = std::time::Instant::now();
        let calls: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|id| {
                let client = std::sync::Arc::clone(&client);
                tokio::spawn(async move { client.send_with_id(id, "ping").await })
            })
            .collect();

        for call in calls {
            let reply = call.await.unwrap();
            assert!(reply.is_timeout(), "{}: {}", reply.task_id, reply.message);
        }
        // Serial budgets would take about twice the response timeout.
        assert!(
            started.elapsed() < Duration::from_millis(800),
            "took {:?}",
            started.elapsed()
        );
        holder.abort();
    }

    #[tokio::test]
    async fn reconnects_after_failure() {
        let addr = unused_addr().await;
        let client = CommandClient::new(ClientConfig::new(addr.clone()));
        assert!(!client.send("first").await.success);

        // Bring a server up on the same address; the next call reconnects.
        let listener = TcpListener::bind(addr.as_str()).await.unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = FramedRead::new(r, JsonCodec::<CommandRequest>::new());
            let mut writer = FramedWrite::new(w, JsonCodec::<CommandResponse>::new());
            while let Some(Ok(req)) = reader.next().await {
                let _ = writer
                    .send(CommandResponse::success(req.task_id, "back"))
                    .await;
            }
        });

        let reply = client.send("second").await;
        assert!(reply.success);
        assert_eq!(reply.message, "back");
    }

    #[tokio::test]
    async fn close_drops_connection() {
        let client = CommandClient::new(ClientConfig::new(spawn_fake_server(None).await));
        assert!(client.send("ping").await.success);
        assert!(client.is_connected().await);

        client.close().await;
        assert!(!client.is_connected().await);
        assert!(client.send("again").await.success);
    }

    #[test]
    fn application_failure_is_typed() {
        let reply = CommandReply::from_response(CommandResponse::failure("t", "boom"));
        assert!(!reply.success);
        assert_eq!(reply.failure, Some(FailureKind::Application));
        assert_eq!(reply.message, "boom");
    }
}
