//! Front-end client against a live coordinator on an ephemeral port.

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskbridge::{
    ClientConfig, CommandClient, CommandServer, EchoHandler, FailureKind, HandlerResult,
    ServerConfig, ServerHandle, WorkHandler,
};

async fn start(handler: Arc<dyn WorkHandler>) -> ServerHandle {
    let server = CommandServer::bind(ServerConfig::default().with_port(0), handler)
        .await
        .unwrap();
    let handle = server.handle();
    tokio::spawn(server.run());
    handle
}

fn client_for(handle: &ServerHandle) -> CommandClient {
    CommandClient::new(ClientConfig::new(handle.local_addr().to_string()))
}

/// Sleeps for the number of milliseconds in the request, then echoes it.
fn sleepy_handler(request: &str) -> HandlerResult {
    let millis: u64 = request.parse().unwrap_or(0);
    std::thread::sleep(Duration::from_millis(millis));
    Ok(request.to_string())
}

#[tokio::test]
async fn round_trip_preserves_task_id() {
    let handle = start(Arc::new(EchoHandler)).await;
    let client = client_for(&handle);

    let reply = client.send_with_id("abc123", "ping").await;
    assert_eq!(reply.task_id, "abc123");
    assert!(reply.success);
    assert_eq!(reply.message, "ping");

    handle.shutdown().await;
}

#[tokio::test]
async fn timeout_does_not_poison_server() {
    let handle = start(Arc::new(sleepy_handler)).await;

    let impatient = CommandClient::new(
        ClientConfig::new(handle.local_addr().to_string())
            .with_response_timeout(Duration::from_secs(1)),
    );
    let started = Instant::now();
    let reply = impatient.send("3000").await;
    let elapsed = started.elapsed();

    assert!(!reply.success);
    assert_eq!(reply.failure, Some(FailureKind::Timeout));
    assert!(reply.message.contains("timed out"));
    assert!(elapsed < Duration::from_millis(2500), "took {:?}", elapsed);
    assert!(!impatient.is_connected().await);

    // A fresh client is served while the slow handler is still running.
    let other = client_for(&handle);
    let reply = other.send("0").await;
    assert!(reply.success);

    handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_clients_get_their_own_responses() {
    let handle = start(Arc::new(sleepy_handler)).await;

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let client = client_for(&handle);
        tasks.push(tokio::spawn(async move {
            // Stagger delays so responses finish out of order.
            let payload = ((8 - i) * 20).to_string();
            let reply = client.send(payload.clone()).await;
            (payload, reply)
        }));
    }

    for task in tasks {
        let (payload, reply) = task.await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.message, payload);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn sequential_requests_reuse_connection() {
    let handle = start(Arc::new(EchoHandler)).await;
    let client = client_for(&handle);

    for i in 0..5 {
        let reply = client.send(format!("msg-{i}")).await;
        assert!(reply.success);
    }
    assert!(client.is_connected().await);

    let connections = handle.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].requests_served, 5);

    handle.shutdown().await;
}

#[tokio::test]
async fn double_shutdown_leaves_no_connections() {
    let handle = start(Arc::new(EchoHandler)).await;
    let client = client_for(&handle);
    assert!(client.send("hello").await.success);

    handle.shutdown().await;
    handle.shutdown().await;
    assert_eq!(handle.active_connections(), 0);

    // The listener is gone, so a fresh call fails cleanly.
    client.close().await;
    let reply = client.send("after").await;
    assert!(!reply.success);
    assert_eq!(reply.failure, Some(FailureKind::Transport));
}

#[tokio::test]
async fn client_recovers_after_server_restart() {
    let first = start(Arc::new(EchoHandler)).await;
    let addr = first.local_addr();
    let client = CommandClient::new(ClientConfig::new(addr.to_string()));
    assert!(client.send("one").await.success);

    first.shutdown().await;
    let reply = client.send("two").await;
    assert!(!reply.success);

    let server = CommandServer::bind(
        ServerConfig::default().with_port(addr.port()),
        Arc::new(EchoHandler),
    )
    .await
    .unwrap();
    let second = server.handle();
    tokio::spawn(server.run());

    let reply = client.send("three").await;
    assert!(reply.success, "{}", reply.message);

    second.shutdown().await;
}
