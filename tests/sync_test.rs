//! WebSocket sync server integration tests — handshake gating, channel
//! lifecycle, fan-out, disconnect buffering, and resync.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use taskd::auth::StaticKeyAuth;
use taskd::config::ServerConfig;
use taskd::registry::StaticRegistry;
use taskd::sync;
use taskd::sync::broadcaster::SyncBroadcaster;
use taskd::tasks::query::QueryEngine;
use taskd::tasks::TaskStore;
use taskd::AppContext;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const API_KEY: &str = "test-key";

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_context(buffer_limit: usize, domains: HashMap<String, Vec<String>>) -> Arc<AppContext> {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = ServerConfig::new(Some(0), Some(dir.path().to_path_buf()), None, None);
    config.sync.buffer_limit = buffer_limit;
    // Keep the TempDir alive for the whole test process.
    std::mem::forget(dir);

    Arc::new(AppContext {
        store: Arc::new(TaskStore::new(None)),
        broadcaster: Arc::new(SyncBroadcaster::new(
            buffer_limit,
            Duration::from_secs(60),
        )),
        query: Arc::new(QueryEngine::new()),
        auth: Arc::new(StaticKeyAuth::new(API_KEY)),
        registry: Arc::new(StaticRegistry::new(domains)),
        config: Arc::new(config),
    })
}

async fn start_server(buffer_limit: usize, domains: HashMap<String, Vec<String>>) -> SocketAddr {
    let ctx = test_context(buffer_limit, domains);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(sync::serve(listener, ctx));
    addr
}

fn frame(client_id: &str, message_type: &str, data: Value) -> Message {
    Message::Text(
        json!({
            "type": message_type,
            "data": data,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "client_id": client_id,
        })
        .to_string(),
    )
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            // Non-text control frames are not protocol messages.
            _ => continue,
        }
    }
}

/// Connect and complete the handshake; asserts auth and hello, returns the
/// open socket plus the `resync` flag from connection_success.
async fn connect(addr: SocketAddr, client_id: &str) -> (Ws, bool) {
    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(frame(client_id, "connect", json!({"api_key": API_KEY})))
        .await
        .unwrap();

    let auth = recv_json(&mut ws).await;
    assert_eq!(auth["type"], "auth_status");
    assert_eq!(auth["data"]["status"], "authenticated");

    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "connection_success");
    let resync = hello["data"]["resync"].as_bool().unwrap_or(false);
    (ws, resync)
}

async fn join(ws: &mut Ws, client_id: &str, channel: &str) {
    ws.send(frame(client_id, "join_channel", json!({"channel": channel})))
        .await
        .unwrap();
    let ack = recv_json(ws).await;
    assert_eq!(ack["type"], "subscription_success", "unexpected: {ack}");
    assert_eq!(ack["data"]["channel"], channel);
}

#[tokio::test]
async fn handshake_rejects_wrong_key_and_closes() {
    let addr = start_server(16, HashMap::new()).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(frame("c1", "connect", json!({"api_key": "nope"})))
        .await
        .unwrap();

    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["data"]["status"], "error");
    assert_eq!(err["data"]["code"], 401);
    assert_eq!(err["data"]["error_type"], "auth_error");

    // Server closes right after the rejection.
    let next = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None));
}

#[tokio::test]
async fn unknown_message_type_is_a_validation_error() {
    let addr = start_server(16, HashMap::new()).await;
    let (mut ws, _) = connect(addr, "c1").await;

    ws.send(frame("c1", "task_destroy", json!({})))
        .await
        .unwrap();
    // The frame never parses as task_destroy isn't a known type; the raw
    // text is rejected before the sum type is even constructed.
    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["data"]["code"], 400);
    assert_eq!(err["data"]["error_type"], "validation_error");
}

#[tokio::test]
async fn channel_lifecycle_with_registry_gating() {
    let mut domains = HashMap::new();
    domains.insert("professional".to_string(), vec!["c1".to_string()]);
    let addr = start_server(16, domains).await;

    let (mut ws, _) = connect(addr, "c2").await;

    // Malformed channel name.
    ws.send(frame("c2", "join_channel", json!({"channel": "no-scope"})))
        .await
        .unwrap();
    let err = recv_json(&mut ws).await;
    assert_eq!(err["data"]["code"], 403);
    assert_eq!(err["data"]["error_type"], "invalid_channel");

    // Domain locked to c1.
    ws.send(frame(
        "c2",
        "join_channel",
        json!({"channel": "domain:professional"}),
    ))
    .await
    .unwrap();
    let err = recv_json(&mut ws).await;
    assert_eq!(err["data"]["code"], 403);
    assert_eq!(err["data"]["error_type"], "domain_denied");
    assert_eq!(err["data"]["domain"], "professional");

    // Open domain works, and leave acks.
    join(&mut ws, "c2", "domain:personal").await;
    ws.send(frame(
        "c2",
        "leave_channel",
        json!({"channel": "domain:personal"}),
    ))
    .await
    .unwrap();
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "unsubscription_success");
}

#[tokio::test]
async fn committed_mutations_fan_out_to_subscribers() {
    let addr = start_server(16, HashMap::new()).await;

    let (mut observer, _) = connect(addr, "observer").await;
    join(&mut observer, "observer", "domain:default").await;

    let (mut writer, _) = connect(addr, "writer").await;
    writer
        .send(frame(
            "writer",
            "task_update",
            json!({"action": "create", "id": "t1", "label": "Fan out"}),
        ))
        .await
        .unwrap();

    let delta = recv_json(&mut observer).await;
    assert_eq!(delta["type"], "task_update");
    assert_eq!(delta["data"]["id"], "t1");
    assert_eq!(delta["data"]["status"], "pending");
    assert_eq!(delta["channel"], "domain:default");

    // The writer has no subscription and hears nothing.
    let silence = tokio::time::timeout(Duration::from_millis(300), writer.next()).await;
    assert!(silence.is_err());
}

#[tokio::test]
async fn disconnected_client_replays_backlog_in_commit_order() {
    let addr = start_server(16, HashMap::new()).await;

    let (mut observer, _) = connect(addr, "observer").await;
    join(&mut observer, "observer", "domain:default").await;
    drop(observer);
    // Let the server notice the transport drop before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut writer, _) = connect(addr, "writer").await;
    for id in ["t1", "t2", "t3"] {
        writer
            .send(frame(
                "writer",
                "task_update",
                json!({"action": "create", "id": id, "label": id}),
            ))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut observer, resync) = connect(addr, "observer").await;
    assert!(!resync);
    for expected in ["t1", "t2", "t3"] {
        let delta = recv_json(&mut observer).await;
        assert_eq!(delta["type"], "task_update");
        assert_eq!(delta["data"]["id"], expected);
        assert_ne!(delta["data"]["resync"], true);
    }
}

#[tokio::test]
async fn backlog_overflow_forces_full_resync() {
    let addr = start_server(2, HashMap::new()).await;

    let (mut observer, _) = connect(addr, "observer").await;
    join(&mut observer, "observer", "domain:default").await;
    drop(observer);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut writer, _) = connect(addr, "writer").await;
    for id in ["t1", "t2", "t3", "t4"] {
        writer
            .send(frame(
                "writer",
                "task_update",
                json!({"action": "create", "id": id, "label": id}),
            ))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut observer, resync) = connect(addr, "observer").await;
    assert!(resync, "overflowed backlog must trigger a resync");

    // Full snapshots for everything visible through the subscription, each
    // flagged resync, never a partial replay.
    let mut seen = Vec::new();
    for _ in 0..4 {
        let delta = recv_json(&mut observer).await;
        assert_eq!(delta["type"], "task_update");
        assert_eq!(delta["data"]["resync"], true);
        seen.push(delta["data"]["id"].as_str().unwrap().to_string());
    }
    seen.sort();
    assert_eq!(seen, vec!["t1", "t2", "t3", "t4"]);
}

#[tokio::test]
async fn search_round_trips_over_the_socket() {
    let addr = start_server(16, HashMap::new()).await;
    let (mut ws, _) = connect(addr, "c1").await;

    for (id, label) in [("t1", "Fix login"), ("t2", "Write docs")] {
        ws.send(frame(
            "c1",
            "task_update",
            json!({"action": "create", "id": id, "label": label}),
        ))
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws.send(frame(
        "c1",
        "task_search",
        json!({
            "text": "login",
            "pagination": {"page": 1, "pageSize": 10},
        }),
    ))
    .await
    .unwrap();

    let result = recv_json(&mut ws).await;
    assert_eq!(result["type"], "task_search_result");
    assert_eq!(result["data"]["totalItems"], 1);
    assert_eq!(result["data"]["items"][0]["id"], "t1");
}

#[tokio::test]
async fn invalid_pagination_is_rejected_at_the_gate() {
    let addr = start_server(16, HashMap::new()).await;
    let (mut ws, _) = connect(addr, "c1").await;

    ws.send(frame(
        "c1",
        "task_search",
        json!({"pagination": {"page": 0, "pageSize": 10}}),
    ))
    .await
    .unwrap();

    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["data"]["code"], 400);
}

#[tokio::test]
async fn explicit_disconnect_ends_the_session() {
    let addr = start_server(16, HashMap::new()).await;
    let (mut ws, _) = connect(addr, "c1").await;

    ws.send(frame("c1", "disconnect", Value::Null)).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None));
}

#[tokio::test]
async fn client_retries_with_backoff_and_rejoins_channels() {
    use taskd::config::SyncConfig;
    use taskd::sync::client::{self, ClientConfig, ClientState};
    use taskd::sync::envelope::{Message as Wire, TaskCommand, TaskUpdateData};
    use taskd::tasks::model::CreateTask;

    // Reserve an address, then release it so the first attempt fails.
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let config = ClientConfig::from_sync(
        &format!("ws://{addr}"),
        API_KEY,
        "roamer",
        vec!["domain:default".to_string()],
        &SyncConfig::default(),
    );
    let mut client = client::spawn(config);

    // No server yet: the loop reports Error and backs off before retrying.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*client.state.borrow(), ClientState::Error);

    // Bring the server up on the reserved address before the retry lands.
    let ctx = test_context(16, HashMap::new());
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(sync::serve(listener, ctx));

    tokio::time::timeout(Duration::from_secs(10), async {
        while *client.state.borrow() != ClientState::Connected {
            client.state.changed().await.unwrap();
        }
    })
    .await
    .expect("client never reconnected");

    // Connected means handshake and join ack completed; the re-joined
    // subscription is live, so a command fans back as a delta.
    client
        .commands
        .send(Wire::TaskUpdate(TaskUpdateData::Command(
            TaskCommand::Create {
                task: CreateTask::new("t1", "From the client"),
            },
        )))
        .await
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(3), client.events.recv())
        .await
        .expect("no delta before timeout")
        .unwrap();
    match envelope.message {
        Wire::TaskUpdate(TaskUpdateData::Delta(delta)) => assert_eq!(delta.id, "t1"),
        other => panic!("expected a task delta, got {other:?}"),
    }
}
