//! E2E tests for the lapsync web server
//!
//! Each test binds a real listener on an ephemeral port and talks to it
//! over WebSocket and HTTP.

use futures_util::{SinkExt, StreamExt};
use lapsync_core::protocol::{ClientMessage, ReceiptStatus, ServerMessage};
use lapsync_core::{ControllerHandle, EngineConfig, MemoryStore, SessionState};
use lapsync_server::logs::LogBuffer;
use lapsync_server::{AppState, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn quick_engine() -> EngineConfig {
    EngineConfig {
        clear_retry_attempts: 1,
        clear_retry_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

async fn start_with(store: MemoryStore) -> (SocketAddr, ControllerHandle) {
    start_engine(store, quick_engine()).await
}

async fn start_engine(store: MemoryStore, engine: EngineConfig) -> (SocketAddr, ControllerHandle) {
    let controller = ControllerHandle::spawn(Box::new(store), engine).unwrap();
    let config = ServerConfig {
        port: 0,
        bind_addr: "127.0.0.1".to_string(),
    };
    let listener = lapsync_server::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(controller.clone(), config, LogBuffer::default());
    tokio::spawn(lapsync_server::serve(listener, state, std::future::pending()));
    (addr, controller)
}

async fn start() -> (SocketAddr, ControllerHandle) {
    start_with(MemoryStore::new()).await
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/api/v1/ws", addr))
        .await
        .expect("WebSocket connect failed");
    ws
}

async fn next_message(ws: &mut Ws) -> ServerMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timed out waiting for server message")
            .expect("WebSocket closed")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("Invalid server message");
        }
    }
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    let json = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

fn submit(id: &str, elapsed_ms: u64) -> ClientMessage {
    ClientMessage::SubmitRecord {
        client_record_id: id.to_string(),
        elapsed_ms,
        captured_at: chrono::Utc::now(),
        session_id: None,
    }
}

/// A connecting client first receives the full current ledger
#[tokio::test]
async fn test_connect_receives_snapshot() {
    let (addr, controller) = start().await;
    controller
        .submit(12_000, "pre".to_string(), None, None)
        .await
        .unwrap();

    let mut ws = connect(addr).await;
    match next_message(&mut ws).await {
        ServerMessage::Snapshot {
            state, records, ..
        } => {
            assert_eq!(state, SessionState::Active);
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].client_record_id, "pre");
        }
        other => panic!("Expected snapshot, got {:?}", other),
    }
}

/// A submission is receipted to its sender and broadcast to everyone
#[tokio::test]
async fn test_submit_broadcasts_to_all_clients() {
    let (addr, _controller) = start().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    next_message(&mut a).await;
    next_message(&mut b).await;

    send(&mut a, &submit("lap-1", 30_000)).await;

    let mut saw_receipt = false;
    let mut saw_event = false;
    for _ in 0..2 {
        match next_message(&mut a).await {
            ServerMessage::Receipt { status, .. } => {
                assert_eq!(status, ReceiptStatus::Committed { sequence_number: 1 });
                saw_receipt = true;
            }
            ServerMessage::RecordAppended { record } => {
                assert_eq!(record.client_record_id, "lap-1");
                saw_event = true;
            }
            other => panic!("Unexpected {:?}", other),
        }
    }
    assert!(saw_receipt && saw_event);

    match next_message(&mut b).await {
        ServerMessage::RecordAppended { record } => {
            assert_eq!(record.sequence_number, 1);
            assert_eq!(record.elapsed_ms, 30_000);
        }
        other => panic!("Expected record_appended, got {:?}", other),
    }
}

/// Resubmitting the same client record id is acknowledged, not duplicated
#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let (addr, controller) = start().await;
    controller
        .submit(5_000, "b1".to_string(), None, None)
        .await
        .unwrap();

    let mut ws = connect(addr).await;
    next_message(&mut ws).await;
    send(&mut ws, &submit("b1", 5_000)).await;

    match next_message(&mut ws).await {
        ServerMessage::Receipt {
            client_record_id,
            status,
        } => {
            assert_eq!(client_record_id, "b1");
            assert_eq!(status, ReceiptStatus::Duplicate { sequence_number: 1 });
        }
        other => panic!("Expected receipt, got {:?}", other),
    }
    assert_eq!(controller.snapshot().len(), 1);
}

/// Every observer sees the old epoch cleared before the new one starts
#[tokio::test]
async fn test_reset_over_websocket_orders_events() {
    let (addr, controller) = start().await;
    controller
        .submit(1_000, "a".to_string(), None, None)
        .await
        .unwrap();
    let old = controller.snapshot().session_id.clone();

    let mut requester = connect(addr).await;
    let mut observer = connect(addr).await;
    next_message(&mut requester).await;
    next_message(&mut observer).await;

    send(&mut requester, &ClientMessage::RequestReset).await;

    match next_message(&mut observer).await {
        ServerMessage::SessionCleared { session_id } => assert_eq!(session_id, old),
        other => panic!("Expected session_cleared, got {:?}", other),
    }
    match next_message(&mut observer).await {
        ServerMessage::SessionStarted { session_id, .. } => {
            assert_ne!(session_id, old);
            assert_eq!(session_id, controller.snapshot().session_id);
        }
        other => panic!("Expected session_started, got {:?}", other),
    }
    assert!(controller.snapshot().is_empty());
}

/// A snapshot can be requested at any time
#[tokio::test]
async fn test_request_snapshot() {
    let (addr, controller) = start().await;
    let mut ws = connect(addr).await;
    next_message(&mut ws).await;

    controller
        .submit(2_000, "x".to_string(), None, None)
        .await
        .unwrap();
    // Drain the live event first
    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::RecordAppended { .. }
    ));

    send(&mut ws, &ClientMessage::RequestSnapshot).await;
    match next_message(&mut ws).await {
        ServerMessage::Snapshot { records, .. } => assert_eq!(records.len(), 1),
        other => panic!("Expected snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_message_gets_error() {
    let (addr, _controller) = start().await;
    let mut ws = connect(addr).await;
    next_message(&mut ws).await;

    ws.send(Message::Text("{\"type\":\"launch\"}".into()))
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::Error { .. }
    ));
}

#[tokio::test]
async fn test_http_submit_and_list_laps() {
    let (addr, _controller) = start().await;
    let client = reqwest::Client::new();

    for (id, ms) in [("h1", 61_230u64), ("h2", 125_000)] {
        let resp = client
            .post(format!("http://{}/api/v1/laps", addr))
            .json(&serde_json::json!({ "elapsed_ms": ms, "client_record_id": id }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["outcome"], "committed");
    }

    let body: serde_json::Value = client
        .get(format!("http://{}/api/v1/laps", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let laps = body["laps"].as_array().unwrap();
    assert_eq!(laps.len(), 2);
    assert_eq!(laps[0]["elapsed"], "00:01:01.23");
    assert_eq!(laps[1]["lap_ms"], 63_770);
    assert_eq!(laps[1]["lap"], "00:01:03");

    let status: serde_json::Value = client
        .get(format!("http://{}/api/v1/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["record_count"], 2);
    assert_eq!(status["state"], "active");
}

/// Reset fails with 503 while storage is down and resumes once it is back
#[tokio::test]
async fn test_http_reset_storage_unavailable() {
    let store = MemoryStore::new();
    let faults = store.fault_switch();
    let (addr, controller) = start_with(store).await;
    let original = controller.snapshot().session_id.clone();
    let client = reqwest::Client::new();

    faults.set_unavailable(true);
    let resp = client
        .post(format!("http://{}/api/v1/reset", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(controller.snapshot().state, SessionState::Clearing);

    faults.set_unavailable(false);
    let body: serde_json::Value = client
        .post(format!("http://{}/api/v1/reset", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["previous_session"], original.as_str());
    assert_eq!(controller.snapshot().state, SessionState::Active);
}

#[tokio::test]
async fn test_security_headers() {
    let (addr, _controller) = start().await;
    let resp = reqwest::get(format!("http://{}/api/v1/status", addr))
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
}

/// A connection that falls behind the hub gets a fresh snapshot instead of
/// silently missing laps
#[tokio::test]
async fn test_lagging_connection_gets_snapshot() {
    let engine = EngineConfig {
        broadcast_capacity: 1,
        ..quick_engine()
    };
    let (addr, controller) = start_engine(MemoryStore::new(), engine).await;
    let mut ws = connect(addr).await;
    assert!(matches!(next_message(&mut ws).await, ServerMessage::Snapshot { .. }));

    // Commit from another thread while this runtime is blocked, so the
    // connection's send task can't keep up with the hub
    let writer = controller.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            for lap in 1..=10u64 {
                writer
                    .submit(lap * 1000, format!("lag-{}", lap), None, None)
                    .await
                    .unwrap();
            }
        });
    })
    .join()
    .unwrap();

    match next_message(&mut ws).await {
        ServerMessage::Snapshot { records, .. } => {
            let seqs: Vec<u64> = records.iter().map(|r| r.sequence_number).collect();
            assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
        }
        other => panic!("Expected a resync snapshot, got {:?}", other),
    }
    assert_eq!(controller.snapshot().len(), 10);
}
