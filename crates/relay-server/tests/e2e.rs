//! End-to-end tests against a live server on a loopback port.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use relay_core::{MemoryStore, MessageStore};
use relay_protocol::{codec, InboundEvent, OutboundEvent};
use relay_server::{router, serve, AppState, Config};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config
}

fn test_state(config: Config) -> Arc<AppState> {
    Arc::new(AppState::new(config, Arc::new(MemoryStore::new())))
}

async fn start(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state));
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

/// Wait until the server has registered `count` open connections.
async fn wait_for_connections(state: &AppState, count: usize) {
    timeout(RECV_TIMEOUT, async {
        while state.relay.multiplexer().stats().open_connections != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections not registered in time");
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame, parsed.
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn announce(client: &mut Client, identity: &str) -> Value {
    send_json(client, json!({ "event": "userConnected", "data": identity })).await;
    recv_json(client).await
}

#[tokio::test]
async fn test_presence_broadcast_to_all_connections() {
    let addr = start(test_state(test_config())).await;
    let mut alice = connect(addr).await;
    let first = announce(&mut alice, "alice").await;
    assert_eq!(first, json!({ "event": "userConnected", "data": [] }));

    let mut bob = connect(addr).await;

    // Bob's announcement reaches both, and excludes only bob
    let to_bob = announce(&mut bob, "bob").await;
    let to_alice = recv_json(&mut alice).await;
    assert_eq!(to_bob, json!({ "event": "userConnected", "data": ["alice"] }));
    assert_eq!(to_alice, to_bob);

    send_json(&mut bob, json!({ "event": "userDisconnected", "data": "bob" })).await;
    let after = recv_json(&mut alice).await;
    assert_eq!(after, json!({ "event": "userConnected", "data": ["alice"] }));
}

#[tokio::test]
async fn test_send_message_reaches_everyone() {
    let state = test_state(test_config());
    let addr = start(Arc::clone(&state)).await;
    let mut alice = connect(addr).await;
    announce(&mut alice, "alice").await;
    let mut bob = connect(addr).await;
    announce(&mut bob, "bob").await;
    recv_json(&mut alice).await;

    send_json(
        &mut alice,
        json!({
            "event": "sendMessage",
            "data": { "de": "alice", "para": "bob", "mensaje": "hola" }
        }),
    )
    .await;

    for client in [&mut alice, &mut bob] {
        let event = recv_json(client).await;
        assert_eq!(event["event"], "newMessage");
        assert_eq!(event["data"]["de"], "alice");
        assert_eq!(event["data"]["para"], "bob");
        assert_eq!(event["data"]["mensaje"], "hola");
        assert_eq!(event["data"]["id"], 1);
    }

    let history = state.relay.store().query_history("alice", "bob").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_stored_messages_reply_then_rebroadcast() {
    let state = test_state(test_config());
    state.relay.store().save_message("alice", "bob", "one").await.unwrap();
    state.relay.store().save_message("bob", "alice", "two").await.unwrap();
    state.relay.store().save_message("carol", "alice", "other").await.unwrap();

    let addr = start(Arc::clone(&state)).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    wait_for_connections(&state, 2).await;

    send_json(
        &mut alice,
        json!({ "event": "getStoredMessages", "data": ["bob", "alice"] }),
    )
    .await;

    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["event"], "storedMessages");
    let bodies: Vec<&str> = reply["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["mensaje"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, ["one", "two"]);

    // Every record is rebroadcast as newMessage, in order
    for client in [&mut alice, &mut bob] {
        assert_eq!(recv_json(client).await["data"]["mensaje"], "one");
        assert_eq!(recv_json(client).await["data"]["mensaje"], "two");
    }
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let addr = start(test_state(test_config())).await;
    let mut client = connect(addr).await;

    client.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut client, json!({ "event": "bogus", "data": 1 })).await;
    send_json(&mut client, json!({ "event": "userConnected", "data": "" })).await;

    let reply = announce(&mut client, "alice").await;
    assert_eq!(reply, json!({ "event": "userConnected", "data": [] }));
}

#[tokio::test]
async fn test_binary_frames_get_binary_replies() {
    let addr = start(test_state(test_config())).await;
    let mut client = connect(addr).await;

    let frame = codec::encode(&InboundEvent::UserConnected("alice".into())).unwrap();
    client.send(Message::Binary(frame.to_vec())).await.unwrap();

    let reply = timeout(RECV_TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected binary frame, got {reply:?}");
    };
    let event: OutboundEvent = codec::decode(&data).unwrap();
    assert_eq!(event, OutboundEvent::UserConnected(vec![]));
}

#[tokio::test]
async fn test_transport_close_keeps_presence() {
    let state = test_state(test_config());
    let addr = start(Arc::clone(&state)).await;

    let mut alice = connect(addr).await;
    announce(&mut alice, "alice").await;
    alice.close(None).await.unwrap();

    wait_for_connections(&state, 0).await;

    assert!(state.relay.presence().contains("alice").await);
}

#[tokio::test]
async fn test_transport_close_removes_presence_when_configured() {
    let mut config = test_config();
    config.presence.remove_on_disconnect = true;
    let state = test_state(config);
    let addr = start(Arc::clone(&state)).await;

    let mut alice = connect(addr).await;
    announce(&mut alice, "alice").await;
    let mut bob = connect(addr).await;
    announce(&mut bob, "bob").await;
    recv_json(&mut alice).await;

    alice.close(None).await.unwrap();

    let update = recv_json(&mut bob).await;
    assert_eq!(update, json!({ "event": "userConnected", "data": ["bob"] }));
    assert!(!state.relay.presence().contains("alice").await);
}

#[tokio::test]
async fn test_register_and_list_users() {
    let app = router(test_state(test_config()));

    let register = |body: Value| {
        Request::post("/register")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let response = app
        .clone()
        .oneshot(register(json!({ "username": "alice", "realName": "Alice A." })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let created: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(created["user_name"], "alice");
    assert_eq!(created["name"], "Alice A.");

    let response = app
        .clone()
        .oneshot(register(json!({ "username": "alice", "realName": "Someone Else" })))
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let existing: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(existing, json!({ "ms": "INGRESO CORRECTAMENTE." }));

    let response = app
        .clone()
        .oneshot(register(json!({ "username": "  ", "realName": "x" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(Request::get("/usersall").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let names: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(names, json!(["alice"]));

    let response = app
        .oneshot(Request::get("/users").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let users: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(users.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_health() {
    let app = router(test_state(test_config()));
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["online"], 0);
}
