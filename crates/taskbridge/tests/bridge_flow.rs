//! Caller -> HTTP bridge -> polling host -> result, over real sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use taskbridge::dispatch::Operation;
use taskbridge::transport::http::SESSION_HEADER;
use taskbridge::{
    BridgeService, BrokerConfig, EchoHandler, HostAgent, HostConfig, transport::serve_on,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Bridge {
    base_url: String,
    service: Arc<BridgeService>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Bridge {
    async fn start(result_timeout: Duration) -> Self {
        let service = Arc::new(BridgeService::bridged(
            BrokerConfig::default().with_result_timeout(result_timeout),
            vec![Operation::new("create_item", "Create an item in the scene")],
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_on(listener, Arc::clone(&service), true));
        Self {
            base_url,
            service,
            server,
        }
    }

    async fn stop(self) {
        self.service.trigger_shutdown();
        self.server.await.unwrap().unwrap();
    }
}

async fn rpc(
    http: &reqwest::Client,
    base_url: &str,
    session: Option<&str>,
    body: Value,
) -> (Option<String>, Value) {
    let mut request = http.post(format!("{}/rpc", base_url)).json(&body);
    if let Some(session) = session {
        request = request.header(SESSION_HEADER, session);
    }
    let response = request.send().await.unwrap();
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (session, response.json().await.unwrap())
}

#[tokio::test]
async fn tool_call_round_trips_through_polling_host() {
    let bridge = Bridge::start(Duration::from_secs(5)).await;
    let http = reqwest::Client::new();

    let host = HostAgent::new(
        bridge.base_url.clone(),
        Arc::new(EchoHandler),
        HostConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    )
    .unwrap();
    let stop_host = CancellationToken::new();
    let host_task = {
        let token = stop_host.clone();
        tokio::spawn(async move { host.run(token).await })
    };

    let (session, init) = rpc(
        &http,
        &bridge.base_url,
        None,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
    )
    .await;
    assert!(init["result"]["serverInfo"]["version"].is_string());
    let session = session.unwrap();

    let (_, called) = rpc(
        &http,
        &bridge.base_url,
        Some(&session),
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "name": "create_item", "arguments": { "name": "cube" } }
        }),
    )
    .await;
    let result = &called["result"];
    assert_eq!(result["isError"], false);

    // The echo host returns the request it was given.
    let echoed: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(
        echoed,
        json!({ "operation": "create_item", "parameters": { "name": "cube" } })
    );

    let status: Value = http
        .get(format!("{}/status", bridge.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["completed_commands"], 1);
    assert_eq!(status["pending_commands"], 0);

    stop_host.cancel();
    host_task.await.unwrap();
    bridge.stop().await;
}

#[tokio::test]
async fn missing_host_yields_bridge_timeout() {
    let bridge = Bridge::start(Duration::from_millis(200)).await;
    let http = reqwest::Client::new();

    let (session, _) = rpc(
        &http,
        &bridge.base_url,
        None,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }),
    )
    .await;
    let (_, called) = rpc(
        &http,
        &bridge.base_url,
        session.as_deref(),
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "name": "create_item" }
        }),
    )
    .await;

    assert_eq!(called["result"]["isError"], true);
    assert_eq!(called["result"]["errorKind"], "bridge_timeout");

    // The abandoned command is still handed out once.
    let pending: Vec<Value> = http
        .get(format!("{}/pending_commands", bridge.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["type"], "create_item");

    bridge.stop().await;
}

#[tokio::test]
async fn late_result_is_buffered_for_a_later_waiter() {
    let bridge = Bridge::start(Duration::from_secs(1)).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/command_result", bridge.base_url))
        .json(&json!({ "command_id": "xyz", "success": true, "result": {"ok": 1} }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let result = bridge
        .service
        .broker()
        .await_result("xyz", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(result.result, json!({ "ok": 1 }));

    bridge.stop().await;
}
