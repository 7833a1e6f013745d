//! Coordinator side of the framed TCP channel.
//!
//! One sequential request/response loop per connection. The handler runs on
//! the blocking pool so a slow handler only stalls its own connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::codec::{JsonCodec, frame_codec};
use crate::bridge::protocol::{CommandResponse, parse_request};
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::handler::{WorkHandler, invoke_blocking};
use crate::registry::{ConnectionGuard, ConnectionInfo, ConnectionRegistry};

type ResponseWriter = FramedWrite<OwnedWriteHalf, JsonCodec<CommandResponse>>;

struct Shared {
    config: ServerConfig,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
    // Closed once the listening socket has been dropped.
    listener_alive: watch::Sender<()>,
}

/// Bound, not yet running, command server.
pub struct CommandServer {
    listener: TcpListener,
    listener_alive: watch::Receiver<()>,
    handler: Arc<dyn WorkHandler>,
    shared: Arc<Shared>,
}

impl CommandServer {
    pub async fn bind(config: ServerConfig, handler: Arc<dyn WorkHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(target: "taskbridge::server", %local_addr, "Command server listening");

        let (listener_alive_tx, listener_alive) = watch::channel(());

        Ok(Self {
            listener,
            listener_alive,
            handler,
            shared: Arc::new(Shared {
                config,
                local_addr,
                registry: ConnectionRegistry::new(),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                listener_alive: listener_alive_tx,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept connections until `ServerHandle::shutdown` is called.
    pub async fn run(self) {
        let CommandServer {
            listener,
            listener_alive,
            handler,
            shared,
        } = self;

        loop {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let guard = shared.registry.register(peer, shared.shutdown.child_token());
                        tracing::debug!(
                            target: "taskbridge::server",
                            connection_id = %guard.id(),
                            %peer,
                            "Accepted connection"
                        );
                        shared.tracker.spawn(serve_connection(
                            stream,
                            guard,
                            Arc::clone(&handler),
                            shared.config.max_frame_length,
                        ));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        tracing::warn!(target: "taskbridge::server", error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        drop(listener);
        drop(listener_alive);
        ServerHandle { shared }.shutdown().await;
    }
}

/// Cloneable control handle for a running `CommandServer`.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.registry.snapshot()
    }

    /// Ask every open connection to close without stopping the accept loop.
    pub fn close_all_connections(&self) -> usize {
        self.shared.registry.close_all()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting, close every connection and wait for them to drain.
    ///
    /// The listening port is released before this returns. Safe to call more
    /// than once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            target: "taskbridge::server",
            connections = self.shared.registry.len(),
            "Shutting down command server"
        );
        self.shared.shutdown.cancel();
        self.shared.registry.close_all();
        self.shared.tracker.close();

        let drain = self.shared.config.drain_timeout;
        let stopped = async {
            self.shared.listener_alive.closed().await;
            self.shared.tracker.wait().await;
        };
        if tokio::time::timeout(drain, stopped).await.is_err() {
            tracing::warn!(
                target: "taskbridge::server",
                remaining = self.shared.registry.len(),
                "Connections still open after drain timeout"
            );
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    guard: ConnectionGuard,
    handler: Arc<dyn WorkHandler>,
    max_frame_length: usize,
) {
    let connection_id = guard.id();
    let close = guard.close_token();

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(target: "taskbridge::server", %connection_id, error = %e, "set_nodelay failed");
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, frame_codec(max_frame_length));
    let mut writer: ResponseWriter =
        FramedWrite::new(write_half, JsonCodec::with_max_frame_length(max_frame_length));

    loop {
        let frame = tokio::select! {
            biased;
            _ = close.cancelled() => {
                tracing::debug!(target: "taskbridge::server", %connection_id, "Closing on request");
                break;
            }
            frame = reader.next() => frame,
        };

        let response = match frame {
            Some(Ok(body)) => handle_frame(&handler, &body).await,
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                // The rest of the oversized body is still on the wire, so the
                // stream cannot be resynchronised.
                tracing::warn!(
                    target: "taskbridge::server",
                    %connection_id,
                    error = %e,
                    "Rejecting oversized frame"
                );
                let error = ProtocolError::FrameTooLarge(max_frame_length);
                let response = CommandResponse::failure("", format!("Invalid request: {}", error));
                if let Err(e) = write_response(&mut writer, response, max_frame_length).await {
                    tracing::debug!(target: "taskbridge::server", %connection_id, error = %e, "Write failed");
                }
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(target: "taskbridge::server", %connection_id, error = %e, "Read failed");
                break;
            }
            None => {
                tracing::debug!(target: "taskbridge::server", %connection_id, "Peer closed connection");
                break;
            }
        };

        guard.record_request();
        if let Err(e) = write_response(&mut writer, response, max_frame_length).await {
            tracing::debug!(target: "taskbridge::server", %connection_id, error = %e, "Write failed");
            break;
        }
    }

    if let Err(e) = writer.close().await {
        tracing::trace!(target: "taskbridge::server", %connection_id, error = %e, "Close failed");
    }
    tracing::debug!(target: "taskbridge::server", %connection_id, "Connection finished");
}

async fn handle_frame(handler: &Arc<dyn WorkHandler>, body: &[u8]) -> CommandResponse {
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(rejection) => {
            tracing::warn!(
                target: "taskbridge::server",
                task_id = %rejection.task_id,
                error = %rejection.error,
                "Rejected request"
            );
            return rejection.into_response();
        }
    };

    let task_id = request.task_id;
    tracing::info!(target: "taskbridge::server", %task_id, "Handling request");

    match invoke_blocking(Arc::clone(handler), request.user_request).await {
        Ok(message) => CommandResponse::success(task_id, message),
        Err(e) => {
            tracing::info!(target: "taskbridge::server", %task_id, error = %e, "Handler failed");
            CommandResponse::failure(task_id, e.to_string())
        }
    }
}

/// Write one response, substituting a short error if it does not fit a frame.
async fn write_response(
    writer: &mut ResponseWriter,
    response: CommandResponse,
    max_frame_length: usize,
) -> io::Result<()> {
    let task_id = response.task_id.clone();
    match writer.send(response).await {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
            tracing::warn!(target: "taskbridge::server", %task_id, "Response exceeds frame limit");
            let message = format!("Response exceeds frame limit of {} bytes", max_frame_length);
            writer.send(CommandResponse::failure(task_id, message)).await
        }
        other => other,
    }
}
