//! Method dispatch over the length-prefixed TCP channel.
//!
//! Each connection gets its own session, closed when the connection ends.
//! Every frame carries one JSON-RPC message or batch.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::codec::{JsonCodec, frame_codec};

use super::dispatcher::MethodDispatcher;
use super::rpc::{Payload, RpcError, RpcResponse};

/// Serve `dispatcher` on `listener` until `shutdown` is cancelled.
///
/// Open connections are cancelled with the same token and awaited before
/// returning.
pub async fn serve_framed(
    listener: TcpListener,
    dispatcher: Arc<MethodDispatcher>,
    shutdown: CancellationToken,
    max_frame_length: usize,
) -> io::Result<()> {
    let tracker = TaskTracker::new();
    tracing::info!(
        target: "taskbridge::dispatch",
        addr = %listener.local_addr()?,
        "Framed RPC listening"
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(target: "taskbridge::dispatch", %peer, "Accepted RPC connection");
                    tracker.spawn(serve_connection(
                        stream,
                        Arc::clone(&dispatcher),
                        shutdown.child_token(),
                        max_frame_length,
                    ));
                }
                Err(e) => {
                    tracing::warn!(target: "taskbridge::dispatch", error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<MethodDispatcher>,
    close: CancellationToken,
    max_frame_length: usize,
) {
    let session = dispatcher.open_session();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, frame_codec(max_frame_length));
    let mut writer = FramedWrite::new(
        write_half,
        JsonCodec::<Value>::with_max_frame_length(max_frame_length),
    );

    loop {
        let frame = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            frame = reader.next() => frame,
        };

        let body = match frame {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                // Oversized or truncated: the stream is out of sync.
                tracing::debug!(target: "taskbridge::dispatch", %session, error = %e, "Read failed");
                let error = RpcError::invalid_request(e.to_string());
                if let Err(e) = writer
                    .send(RpcResponse::failure(Value::Null, error).into_value())
                    .await
                {
                    tracing::debug!(target: "taskbridge::dispatch", %session, error = %e, "Write failed");
                }
                break;
            }
            None => break,
        };

        let reply = match Payload::from_slice(&body) {
            Ok(payload) => dispatcher.dispatch(&session, payload).await,
            Err(error) => Some(RpcResponse::failure(Value::Null, error).into_value()),
        };

        if let Some(reply) = reply
            && let Err(e) = writer.send(reply).await
        {
            tracing::debug!(target: "taskbridge::dispatch", %session, error = %e, "Write failed");
            if e.kind() != io::ErrorKind::InvalidInput {
                break;
            }
            let error = RpcError::internal("response exceeds frame limit");
            if let Err(e) = writer
                .send(RpcResponse::failure(Value::Null, error).into_value())
                .await
            {
                tracing::debug!(target: "taskbridge::dispatch", %session, error = %e, "Write failed");
                break;
            }
        }
    }

    if let Err(e) = writer.close().await {
        tracing::trace!(target: "taskbridge::dispatch", %session, error = %e, "Close failed");
    }
    dispatcher.close_session(&session);
}
