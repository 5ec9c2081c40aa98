//! Websocket integration tests: a real listener, real clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use roomchat::{AppState, Config, Groups, app, auth, chat, db};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "ws-test-secret";

fn test_config(chat_requires_auth: bool) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_owned(),
        database_url: "sqlite::memory:".to_owned(),
        jwt_secret: SECRET.to_owned(),
        redis_url: None,
        chat_requires_auth,
    }
}

async fn seeded_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory database");
    db::init_schema(&pool).await.expect("create schema");
    for (id, username, role) in [(1, "alice", "owner"), (2, "bob", "renter")] {
        sqlx::query("INSERT INTO users (id,username,role) VALUES (?,?,?)")
            .bind(id)
            .bind(username)
            .bind(role)
            .execute(&pool)
            .await
            .expect("seed user");
    }
    pool
}

async fn test_state(chat_requires_auth: bool) -> AppState {
    AppState {
        db_pool: seeded_pool().await,
        groups: Groups::local(),
        config: test_config(chat_requires_auth),
    }
}

async fn spawn_server(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.expect("serve");
    });
    format!("ws://{addr}")
}

async fn connect(base: &str, path: &str) -> WsClient {
    let (ws, _) = connect_async(format!("{base}{path}"))
        .await
        .expect("websocket handshake");
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::text(value.to_string()))
        .await
        .expect("send frame");
}

async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if frame.is_text() {
            return serde_json::from_str(frame.to_text().expect("utf8 frame")).expect("json frame");
        }
    }
}

async fn assert_silent(ws: &mut WsClient) {
    let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "expected no frame, got {extra:?}");
}

// connects are racy against the server-side group join; give the sessions a
// moment to register before broadcasting at them
async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn send_reaches_both_participants_and_the_receivers_inbox() {
    let state = test_state(false).await;
    let room = chat::store::get_or_create_room(&state.db_pool, 1, 2)
        .await
        .expect("create room");
    let base = spawn_server(state).await;

    let alice_token = auth::issue_token(1, SECRET).expect("token");
    let bob_token = auth::issue_token(2, SECRET).expect("token");

    let mut alice = connect(&base, &format!("/ws/chat/{}?token={alice_token}", room.id)).await;
    let mut bob = connect(&base, &format!("/ws/chat/{}?token={bob_token}", room.id)).await;
    let mut bob_inbox = connect(&base, &format!("/ws/notifications?token={bob_token}")).await;
    settle().await;

    send_json(&mut alice, json!({ "message": "hi", "receiver_id": 2 })).await;

    let to_alice = next_json(&mut alice).await;
    let to_bob = next_json(&mut bob).await;
    assert_eq!(to_alice["message"], "hi");
    assert_eq!(to_alice["sender_id"], 1);
    assert_eq!(to_alice["sender_username"], "alice");
    assert!(to_alice["timestamp"].is_string());
    assert_eq!(to_alice["message_id"], to_bob["message_id"]);

    let push = next_json(&mut bob_inbox).await;
    assert_eq!(push["title"], "New message from alice");
    assert_eq!(push["message"], "hi");
    assert_eq!(push["is_read"], false);
    assert_eq!(push["data"]["message_id"], to_alice["message_id"]);
    assert_eq!(push["data"]["sender_id"], 1);
    assert_eq!(push["data"]["room_id"], room.id);
}

#[tokio::test]
async fn read_receipts_converge_and_only_the_receiver_can_trigger_them() {
    let state = test_state(false).await;
    let room = chat::store::get_or_create_room(&state.db_pool, 1, 2)
        .await
        .expect("create room");
    let base = spawn_server(state).await;

    let alice_token = auth::issue_token(1, SECRET).expect("token");
    let bob_token = auth::issue_token(2, SECRET).expect("token");

    let mut alice = connect(&base, &format!("/ws/chat/{}?token={alice_token}", room.id)).await;
    let mut bob = connect(&base, &format!("/ws/chat/{}?token={bob_token}", room.id)).await;
    settle().await;

    send_json(&mut alice, json!({ "message": "hi", "receiver_id": 2 })).await;
    let message_id = next_json(&mut alice).await["message_id"].as_i64().unwrap();
    assert_eq!(next_json(&mut bob).await["message_id"], message_id);

    // alice is the sender, not the receiver: her read is a silent no-op
    send_json(&mut alice, json!({ "action": "read", "message_id": message_id })).await;
    // bob's read flips the message and fans the receipt out to the room
    send_json(&mut bob, json!({ "action": "read", "message_id": message_id })).await;

    for ws in [&mut alice, &mut bob] {
        let receipt = next_json(ws).await;
        assert_eq!(receipt["event"], "read");
        assert_eq!(receipt["message_id"], message_id);
        assert_eq!(receipt["reader_id"], 2);
    }

    // already read: a repeat produces no state change and no broadcast
    send_json(&mut bob, json!({ "action": "read", "message_id": message_id })).await;
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn anonymous_chat_connections_observe_the_room_by_default() {
    let state = test_state(false).await;
    let room = chat::store::get_or_create_room(&state.db_pool, 1, 2)
        .await
        .expect("create room");
    let base = spawn_server(state).await;

    let alice_token = auth::issue_token(1, SECRET).expect("token");
    let mut guest = connect(&base, &format!("/ws/chat/{}", room.id)).await;
    let mut alice = connect(&base, &format!("/ws/chat/{}?token={alice_token}", room.id)).await;
    settle().await;

    // anonymous frames carry no identity and are dropped
    send_json(&mut guest, json!({ "message": "anon", "receiver_id": 1 })).await;
    send_json(&mut alice, json!({ "message": "hi", "receiver_id": 2 })).await;

    let seen = next_json(&mut guest).await;
    assert_eq!(seen["message"], "hi");
    assert_eq!(seen["sender_id"], 1);
    assert_silent(&mut guest).await;
}

#[tokio::test]
async fn chat_auth_policy_rejects_anonymous_handshakes() {
    let state = test_state(true).await;
    let room = chat::store::get_or_create_room(&state.db_pool, 1, 2)
        .await
        .expect("create room");
    let base = spawn_server(state).await;

    let result = connect_async(format!("{base}/ws/chat/{}", room.id)).await;
    assert!(result.is_err());

    let alice_token = auth::issue_token(1, SECRET).expect("token");
    let _alice = connect(&base, &format!("/ws/chat/{}?token={alice_token}", room.id)).await;
}

#[tokio::test]
async fn anonymous_notification_handshake_is_refused() {
    let state = test_state(false).await;
    let base = spawn_server(state).await;

    let result = connect_async(format!("{base}/ws/notifications")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected an http rejection, got {other:?}"),
    }

    // a forged token is treated exactly like no token
    let result = connect_async(format!("{base}/ws/notifications?token=garbage")).await;
    assert!(result.is_err());
}
