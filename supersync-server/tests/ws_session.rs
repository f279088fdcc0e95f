//! End-to-end tests over a real WebSocket.
//!
//! Each test starts the router on a free port backed by an in-memory store
//! and drives it with raw protocol frames.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use supersync_core::{entries::entries_schema, Applier, MemoryStore, TreeById, TreeOperation};
use supersync_server::{
    auth::AuthConfig,
    hub::Hub,
    ratelimit::{RateLimitConfig, RateLimiter},
    server::{router, AppState},
};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_test_server(password: Option<&str>, rate_limit: RateLimitConfig) -> u16 {
    let hub = Hub::open(Arc::new(MemoryStore::new())).await.unwrap();
    let state = AppState {
        hub: Arc::new(hub),
        auth: Arc::new(AuthConfig {
            password: password.map(str::to_string),
        }),
        rate_limiter: Arc::new(RateLimiter::new(rate_limit)),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    port
}

async fn connect(port: u16, query: &str) -> Client {
    let url = format!("ws://127.0.0.1:{port}/ws?{query}");
    let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = next(&mut client).await;
    assert_eq!(welcome["type"], "welcome");
    client
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string().into()))
        .await
        .unwrap();
}

async fn next(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("server should answer")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn request(client: &mut Client, request_id: u64, document: Value, request: Value) -> Value {
    send(
        client,
        json!({ "requestId": request_id, "document": document, "request": request }),
    )
    .await;
    next(client).await
}

fn entries() -> Value {
    json!({ "kind": "entries" })
}

fn room(id: &str) -> Value {
    json!({ "kind": "room", "id": id })
}

#[tokio::test]
async fn test_entries_mirror_follows_other_clients() {
    let port = start_test_server(None, RateLimitConfig::default()).await;
    let mut alice = connect(port, "username=alice").await;
    let mut bob = connect(port, "username=bob").await;

    let response = request(&mut alice, 1, entries(), json!({ "op": "subscribe" })).await;
    assert_eq!(response["result"], json!([]));

    let response = request(
        &mut alice,
        2,
        entries(),
        json!({ "op": "add", "node": { "name": "scripts", "type": "folder", "children": [] } }),
    )
    .await;
    assert_eq!(response["requestId"], 2);
    assert_eq!(response["error"], Value::Null);
    assert_eq!(response["result"], 0);

    let response = request(&mut bob, 1, entries(), json!({ "op": "subscribe" })).await;
    let mut mirror = TreeById::from_value(&response["result"], entries_schema(), None).unwrap();
    assert!(mirror.contains("0"));

    let response = request(
        &mut alice,
        3,
        entries(),
        json!({ "op": "add", "node": { "name": "main", "type": "script" }, "parentId": "0" }),
    )
    .await;
    assert_eq!(response["result"], 0);

    let broadcast = next(&mut bob).await;
    assert_eq!(broadcast["type"], "broadcast");
    assert_eq!(broadcast["document"], entries());
    let operation: TreeOperation = serde_json::from_value(broadcast["operation"].clone()).unwrap();
    mirror.apply(&operation).unwrap();
    assert_eq!(mirror.parent_of("1"), Some("0"));
    assert_eq!(mirror.get("1").unwrap().name(), "main");
}

#[tokio::test]
async fn test_rejected_requests_get_errors() {
    let port = start_test_server(None, RateLimitConfig::default()).await;
    let mut alice = connect(port, "username=alice").await;

    send(&mut alice, json!("not a message")).await;
    let response = next(&mut alice).await;
    assert_eq!(response["requestId"], 0);
    assert_eq!(response["error"], "Malformed message");

    let response = request(&mut alice, 1, entries(), json!({ "op": "remove", "id": "0" })).await;
    assert_eq!(response["error"], "Not subscribed to entries");

    request(&mut alice, 2, entries(), json!({ "op": "subscribe" })).await;
    let response = request(&mut alice, 3, entries(), json!({ "op": "remove", "id": "0" })).await;
    assert_eq!(response["error"], "Invalid node id: 0");

    let response = request(&mut alice, 4, entries(), json!({ "op": "explode" })).await;
    assert_eq!(response["error"], "Unknown request");

    let response = request(
        &mut alice,
        5,
        entries(),
        json!({ "op": "appendMessage", "text": "hi" }),
    )
    .await;
    assert_eq!(response["error"], "Request not supported by entries");

    let response = request(&mut alice, 6, room("../etc"), json!({ "op": "subscribe" })).await;
    assert_eq!(response["error"], "Invalid room id: ../etc");
}

#[tokio::test]
async fn test_room_chat_between_two_users() {
    let port = start_test_server(None, RateLimitConfig::default()).await;
    let mut alice = connect(port, "username=alice").await;
    let mut bob = connect(port, "username=bob").await;

    let response = request(&mut alice, 1, room("general"), json!({ "op": "subscribe" })).await;
    assert_eq!(response["result"]["users"], json!([{ "id": "alice", "connectionCount": 1 }]));

    let response = request(&mut bob, 1, room("general"), json!({ "op": "subscribe" })).await;
    assert_eq!(response["result"]["users"].as_array().unwrap().len(), 2);

    let joined = next(&mut alice).await;
    assert_eq!(joined["operation"]["op"], "join");
    assert_eq!(joined["operation"]["item"]["id"], "bob");

    let response = request(
        &mut bob,
        2,
        room("general"),
        json!({ "op": "appendMessage", "text": "hello" }),
    )
    .await;
    assert_eq!(response["result"]["author"], "bob");
    assert_eq!(response["result"]["text"], "hello");

    let message = next(&mut alice).await;
    assert_eq!(message["operation"]["op"], "appendMessage");
    assert_eq!(message["operation"]["entry"]["text"], "hello");

    let response = request(&mut bob, 3, room("general"), json!({ "op": "unsubscribe" })).await;
    assert_eq!(response["error"], Value::Null);

    let left = next(&mut alice).await;
    assert_eq!(left["operation"], json!({ "op": "leave", "id": "bob" }));
}

#[tokio::test]
async fn test_password_is_enforced() {
    let port = start_test_server(Some("hunter2"), RateLimitConfig::default()).await;

    let url = format!("ws://127.0.0.1:{port}/ws?username=alice&password=wrong");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    let url = format!("ws://127.0.0.1:{port}/ws?username=a");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    connect(port, "username=alice&password=hunter2").await;
}

#[tokio::test]
async fn test_mutations_are_rate_limited() {
    let limits = RateLimitConfig {
        burst: 2,
        refill_rate: 0.01,
        enabled: true,
    };
    let port = start_test_server(None, limits).await;
    let mut alice = connect(port, "username=alice").await;
    request(&mut alice, 1, entries(), json!({ "op": "subscribe" })).await;

    for request_id in 2..4 {
        let response = request(
            &mut alice,
            request_id,
            entries(),
            json!({ "op": "add", "node": { "name": format!("n{request_id}") } }),
        )
        .await;
        assert_eq!(response["error"], Value::Null);
    }

    let response = request(
        &mut alice,
        4,
        entries(),
        json!({ "op": "add", "node": { "name": "n4" } }),
    )
    .await;
    let error = response["error"].as_str().unwrap();
    assert!(error.starts_with("Too many requests"), "{error}");
}

#[tokio::test]
async fn test_pipelined_frames_each_get_a_response() {
    let port = start_test_server(None, RateLimitConfig::default()).await;
    let mut alice = connect(port, "username=alice").await;

    let frames = [
        json!({ "requestId": 1, "document": entries(), "request": { "op": "subscribe" } }),
        json!({ "requestId": 2, "document": entries(),
                "request": { "op": "add", "node": { "name": "main", "type": "script" } } }),
        json!({ "requestId": 3, "document": entries(), "request": { "op": "unsubscribe" } }),
    ];
    for frame in &frames {
        alice
            .feed(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }
    alice.flush().await.unwrap();

    let mut answered = Vec::new();
    for _ in 0..3 {
        let response = next(&mut alice).await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["error"], Value::Null);
        answered.push(response["requestId"].as_u64().unwrap());
    }
    assert_eq!(answered, [1, 2, 3]);
}

#[tokio::test]
async fn test_manifest_rename_reaches_other_clients() {
    let port = start_test_server(None, RateLimitConfig::default()).await;
    let mut alice = connect(port, "username=alice").await;
    let mut bob = connect(port, "username=bob").await;
    let manifest = json!({ "kind": "manifest" });

    let response = request(&mut alice, 1, manifest.clone(), json!({ "op": "subscribe" })).await;
    assert_eq!(response["result"]["name"], "Untitled project");
    assert_eq!(response["result"]["formatVersion"], 1);
    request(&mut bob, 1, manifest.clone(), json!({ "op": "subscribe" })).await;

    let response = request(
        &mut alice,
        2,
        manifest.clone(),
        json!({ "op": "setProperty", "path": "name", "value": "Tetris" }),
    )
    .await;
    assert_eq!(response["result"], "Tetris");

    let broadcast = next(&mut bob).await;
    assert_eq!(broadcast["document"], manifest);
    assert_eq!(
        broadcast["operation"],
        json!({ "op": "setProperty", "path": "name", "value": "Tetris" })
    );

    let response = request(
        &mut alice,
        3,
        manifest.clone(),
        json!({ "op": "setProperty", "path": "id", "value": "zzzz" }),
    )
    .await;
    assert_eq!(response["error"], "Invalid key: id");

    let response = request(
        &mut alice,
        4,
        manifest,
        json!({ "op": "add", "node": { "name": "main", "type": "script" } }),
    )
    .await;
    assert_eq!(response["error"], "Request not supported by manifest");
}
