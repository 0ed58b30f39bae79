//! Integration tests for the gateway transport against a mock WebSocket
//! gateway.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use agentdeck_core::events::EngineEvent;
use agentdeck_gateway::transport::{ConnectOptions, GatewayClient};
use agentdeck_gateway::{EngineSupervisor, IdentityStore, SupervisorSettings};

type Ws = WebSocketStream<TcpStream>;

/// Start a mock gateway on an ephemeral port. The handler runs once per
/// accepted connection, with the 0-based connection index.
async fn start_gateway<H, Fut>(handler: H) -> u16
where
    H: Fn(usize, Ws) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let handler = Arc::new(handler);
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            let handler = Arc::clone(&handler);
            let i = index;
            index += 1;
            tokio::spawn(async move { handler(i, ws).await });
        }
    });

    port
}

/// Read frames until the `connect` request arrives, then accept it.
/// Returns the connect request for inspection.
async fn accept_handshake(ws: &mut Ws) -> Value {
    loop {
        let msg = ws.next().await.expect("socket open").expect("read ok");
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == "req" && frame["method"] == "connect" {
                let reply = json!({
                    "type": "res",
                    "id": frame["id"],
                    "ok": true,
                    "payload": { "protocol": 1 },
                });
                ws.send(Message::Text(reply.to_string().into()))
                    .await
                    .unwrap();
                return frame;
            }
        }
    }
}

/// Reject the handshake with the given error message.
async fn reject_handshake(ws: &mut Ws, message: &str) -> Value {
    loop {
        let msg = ws.next().await.expect("socket open").expect("read ok");
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == "req" && frame["method"] == "connect" {
                let reply = json!({
                    "type": "res",
                    "id": frame["id"],
                    "ok": false,
                    "error": { "message": message },
                });
                ws.send(Message::Text(reply.to_string().into()))
                    .await
                    .unwrap();
                return frame;
            }
        }
    }
}

/// Serve requests with a canned payload, echoing back the request id.
async fn serve_requests(mut ws: Ws) {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] != "req" {
                continue;
            }
            let reply = json!({
                "type": "res",
                "id": frame["id"],
                "ok": true,
                "payload": { "method": frame["method"] },
            });
            if ws
                .send(Message::Text(reply.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

fn options(port: u16) -> ConnectOptions {
    ConnectOptions {
        port,
        token: "test-token".to_string(),
        client_id: "agentdeck".to_string(),
        client_mode: "desktop".to_string(),
        role: "operator".to_string(),
        scopes: vec!["chat".to_string(), "mgmt".to_string()],
        min_protocol: 1,
        max_protocol: 1,
    }
}

fn identity_store(dir: &std::path::Path) -> Arc<IdentityStore> {
    Arc::new(IdentityStore::new(dir.join("device.json")))
}

#[tokio::test]
async fn test_connect_authenticates_then_serves_requests() {
    let connects: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&connects);

    let port = start_gateway(move |_i, mut ws| {
        let seen = Arc::clone(&seen);
        async move {
            let frame = accept_handshake(&mut ws).await;
            seen.lock().await.push(frame);
            serve_requests(ws).await;
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let (events, _keep) = broadcast::channel(64);
    let client = GatewayClient::connect(options(port), identity_store(temp.path()), events)
        .await
        .unwrap();

    assert!(client.is_connected());

    // The handshake carried the bearer token and a well-formed device claim.
    let connect = connects.lock().await[0].clone();
    assert_eq!(connect["params"]["token"], "test-token");
    assert_eq!(connect["params"]["clientId"], "agentdeck");
    let device = &connect["params"]["device"];
    assert_eq!(device["id"].as_str().unwrap().len(), 64);
    assert!(device["publicKey"].is_string());
    assert!(device["signature"].is_string());
    assert!(device["signedAt"].is_i64());
    assert!(device["nonce"].is_string());

    let payload = client.request("models.list", None).await.unwrap();
    assert_eq!(payload["method"], "models.list");

    client.disconnect().await;
}

#[tokio::test]
async fn test_identity_mismatch_rotates_exactly_once() {
    let connects: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&connects);

    let port = start_gateway(move |i, mut ws| {
        let seen = Arc::clone(&seen);
        async move {
            // First connection: reject the device. Second: accept.
            let frame = if i == 0 {
                reject_handshake(&mut ws, "device token mismatch for this client").await
            } else {
                accept_handshake(&mut ws).await
            };
            seen.lock().await.push(frame);
            if i > 0 {
                serve_requests(ws).await;
            }
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let identity = identity_store(temp.path());
    let before = identity.load_or_create().unwrap().device_id;

    let (events, _keep) = broadcast::channel(64);
    let client = GatewayClient::connect(options(port), Arc::clone(&identity), events)
        .await
        .unwrap();
    assert!(client.is_connected());

    let seen = connects.lock().await;
    assert_eq!(seen.len(), 2);
    let first_id = seen[0]["params"]["device"]["id"].as_str().unwrap();
    let second_id = seen[1]["params"]["device"]["id"].as_str().unwrap();
    assert_eq!(first_id, before);
    assert_ne!(first_id, second_id);

    // The rotated identity is what persists now.
    assert_eq!(identity.load_or_create().unwrap().device_id, second_id);
}

#[tokio::test]
async fn test_persistent_mismatch_fails_after_one_rotation() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let port = start_gateway(move |_i, mut ws| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            reject_handshake(&mut ws, "device identity mismatch").await;
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let (events, _keep) = broadcast::channel(64);
    let result = GatewayClient::connect(options(port), identity_store(temp.path()), events).await;

    assert!(result.is_err());
    // Original attempt plus exactly one post-rotation retry.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_rejection_does_not_rotate() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let port = start_gateway(move |_i, mut ws| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            reject_handshake(&mut ws, "invalid token").await;
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let (events, _keep) = broadcast::channel(64);
    let result = GatewayClient::connect(options(port), identity_store(temp.path()), events).await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_event_frames_reach_subscribers() {
    let port = start_gateway(|_i, mut ws| async move {
        accept_handshake(&mut ws).await;
        let event = json!({
            "type": "event",
            "event": "agent.output",
            "payload": { "text": "hello" },
        });
        ws.send(Message::Text(event.to_string().into()))
            .await
            .unwrap();
        serve_requests(ws).await;
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let (events, _keep) = broadcast::channel(64);
    let mut events_rx = events.subscribe();
    let _client = GatewayClient::connect(options(port), identity_store(temp.path()), events)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::Gateway { event, payload }) = events_rx.recv().await {
                return (event, payload);
            }
        }
    })
    .await
    .expect("gateway event should arrive");

    assert_eq!(received.0, "agent.output");
    assert_eq!(received.1.unwrap()["text"], "hello");
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let port = start_gateway(|_i, mut ws| async move {
        accept_handshake(&mut ws).await;

        // Collect two requests, then answer them in reverse order.
        let mut pending = Vec::new();
        while pending.len() < 2 {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["type"] == "req" {
                    pending.push(frame);
                }
            }
        }
        for frame in pending.iter().rev() {
            let reply = json!({
                "type": "res",
                "id": frame["id"],
                "ok": true,
                "payload": { "method": frame["method"] },
            });
            ws.send(Message::Text(reply.to_string().into()))
                .await
                .unwrap();
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let (events, _keep) = broadcast::channel(64);
    let client = GatewayClient::connect(options(port), identity_store(temp.path()), events)
        .await
        .unwrap();

    let first = client.handle();
    let second = client.handle();
    let (a, b) = tokio::join!(
        first.request("models.list", None),
        second.request("plugins.list", None),
    );

    assert_eq!(a.unwrap()["method"], "models.list");
    assert_eq!(b.unwrap()["method"], "plugins.list");
}

#[tokio::test]
async fn test_reinitialize_while_disconnected_restores_service() {
    let port = start_gateway(|i, mut ws| async move {
        accept_handshake(&mut ws).await;
        if i == 0 {
            // The first session dies right after authenticating.
            let _ = ws.close(None).await;
        } else {
            serve_requests(ws).await;
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let mut settings = SupervisorSettings::new(temp.path().to_path_buf());
    settings.port = port;
    let supervisor = EngineSupervisor::new(settings);

    supervisor.initialize().await.unwrap();

    // Give the close a moment to land, then drive a request through a fresh
    // initialization while the old link sits in its backoff window.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let payload = tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.handle_request("chat.send", None),
    )
    .await
    .expect("request must not hang while disconnected")
    .unwrap();
    assert_eq!(payload["method"], "chat.send");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_initialization_survives_config_write_failure() {
    let port = start_gateway(|_i, mut ws| async move {
        accept_handshake(&mut ws).await;
        serve_requests(ws).await;
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    // Occupy the config path with a directory so every write fails.
    std::fs::create_dir(temp.path().join("config.json")).unwrap();

    let mut settings = SupervisorSettings::new(temp.path().to_path_buf());
    settings.port = port;
    let supervisor = EngineSupervisor::new(settings);

    supervisor.initialize().await.unwrap();
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_supervisor_adopts_gateway_and_dedups_initialization() {
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handshakes);

    let port = start_gateway(move |_i, mut ws| {
        let counter = Arc::clone(&counter);
        async move {
            accept_handshake(&mut ws).await;
            counter.fetch_add(1, Ordering::SeqCst);
            serve_requests(ws).await;
        }
    })
    .await;

    let temp = tempfile::tempdir().unwrap();
    let mut settings = SupervisorSettings::new(temp.path().to_path_buf());
    settings.port = port;
    let supervisor = EngineSupervisor::new(settings);

    // Five concurrent callers share one launch sequence.
    let results = futures_util::future::join_all((0..5).map(|_| {
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.initialize().await }
    }))
    .await;

    for result in results {
        result.unwrap();
    }
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    // The adopted link serves requests end to end.
    let payload = supervisor.handle_request("models.list", None).await.unwrap();
    assert_eq!(payload["method"], "models.list");

    supervisor.shutdown().await;
}
