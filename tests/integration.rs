//! End-to-end tests over a real WebSocket connection and real subprocesses.
//!
//! Grounded on the pack's `sanjay920-agentsh/tests/test_server.rs` style
//! (spin up the real service in-process, drive it through its actual
//! protocol, assert on real subprocess behavior) adapted from an in-process
//! duplex MCP transport to a real TCP+WebSocket client via
//! `tokio-tungstenite`, since this crate's frontage is WS/JSON-RPC rather
//! than MCP-over-stdio.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use cc_executor::config::Config;
use cc_executor::registry::SessionRegistry;
use cc_executor::timing::TimingStore;
use cc_executor::ws::{self, AppState};

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        listen_addr: "127.0.0.1:0".to_string(),
        max_sessions: 10,
        session_idle_timeout_s: 3600,
        ws_max_message_bytes: 1024 * 1024,
        ws_ping_interval_s: 3600,
        ws_pong_timeout_s: 3600,
        default_total_timeout_s: 5.0,
        default_stall_timeout_s: 5.0,
        extreme_stall_timeout_s: 600.0,
        stall_fraction_of_total: 0.3,
        max_line_bytes: 8192,
        max_total_bytes: 1024 * 1024,
        allowed_commands: None,
        hook_config_path: None,
        timing_store_dsn: None,
        history_ttl_s: 3600,
        history_samples_cap: 100,
        graceful_shutdown_s: 2,
        log_level: "error".to_string(),
    })
}

/// Boot the real axum app on an OS-assigned port and return its address.
/// The server runs for the remainder of the test process; there is no
/// shutdown handshake here, mirroring how these throwaway test servers are
/// treated in the pack (the process exits at test end regardless).
async fn spawn_server(config: Arc<Config>) -> SocketAddr {
    let timing = Arc::new(TimingStore::new(None, config.history_ttl_s, config.history_samples_cap, config.stall_fraction_of_total, 1.0, config.extreme_stall_timeout_s));
    let registry = SessionRegistry::new(config.clone(), timing, None);
    let state = AppState {
        registry,
        config: config.clone(),
        start_time: Instant::now(),
    };
    let app = Router::new()
        .route("/health", get(ws::health))
        .route("/ws/mcp", get(ws::ws_upgrade))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/ws/mcp");
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        match ws.next().await.expect("stream ended unexpectedly").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_request(ws: &mut WsStream, id: &str, method: &str, params: Value) {
    let req = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
}

/// Read frames until one matching `method` (a notification) or a response
/// with the given `id` is found; returns whichever matched first.
async fn recv_until(ws: &mut WsStream, predicate: impl Fn(&Value) -> bool) -> Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let v = tokio::time::timeout(deadline.saturating_duration_since(Instant::now()), recv_json(ws))
            .await
            .expect("timed out waiting for expected frame");
        if predicate(&v) {
            return v;
        }
    }
}

#[tokio::test]
async fn connected_notification_arrives_first() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["method"], "connected");
    assert!(connected["params"]["session_id"].is_string());
}

#[tokio::test]
async fn ping_is_answered() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(&mut ws, "1", "ping", json!({})).await;
    let reply = recv_until(&mut ws, |v| v["id"] == "1").await;
    assert_eq!(reply["result"]["pong"], true);
}

#[tokio::test]
async fn sequential_execution_is_enforced() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(&mut ws, "1", "execute", json!({"command": "sleep 1"})).await;
    let first = recv_until(&mut ws, |v| v["id"] == "1").await;
    assert_eq!(first["result"]["accepted"], true);

    send_request(&mut ws, "2", "execute", json!({"command": "echo too-soon"})).await;
    let second = recv_until(&mut ws, |v| v["id"] == "2").await;
    assert_eq!(second["error"]["data"]["kind"], "AlreadyRunning");

    let _completed = recv_until(&mut ws, |v| {
        v["method"] == "execution_completed"
    })
    .await;
}

#[tokio::test]
async fn output_chunks_carry_stdout_then_completion_follows() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(&mut ws, "1", "execute", json!({"command": "echo hello-world"})).await;
    let _accepted = recv_until(&mut ws, |v| v["id"] == "1").await;

    let started = recv_until(&mut ws, |v| v["method"] == "execution_started").await;
    assert!(started["params"]["execution_id"].is_string());

    let chunk = recv_until(&mut ws, |v| v["method"] == "output_chunk").await;
    assert_eq!(chunk["params"]["stream"], "stdout");
    assert!(chunk["params"]["data"].as_str().unwrap().contains("hello-world"));

    let completed = recv_until(&mut ws, |v| v["method"] == "execution_completed").await;
    assert_eq!(completed["params"]["status"], "EXITED");
    assert_eq!(completed["params"]["exit_code"], 0);
}

#[tokio::test]
async fn stall_timeout_fires_on_silent_child() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(
        &mut ws,
        "1",
        "execute",
        json!({"command": "sleep 30", "total_timeout_s": 30.0, "stall_timeout_s": 0.5}),
    )
    .await;
    let _accepted = recv_until(&mut ws, |v| v["id"] == "1").await;

    let completed = recv_until(&mut ws, |v| v["method"] == "execution_completed").await;
    assert_eq!(completed["params"]["status"], "STALLED");
}

#[tokio::test]
async fn cancel_terminates_a_running_execution() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(&mut ws, "1", "execute", json!({"command": "sleep 30"})).await;
    let _accepted = recv_until(&mut ws, |v| v["id"] == "1").await;
    let _started = recv_until(&mut ws, |v| v["method"] == "execution_started").await;

    send_request(&mut ws, "2", "control", json!({"type": "CANCEL"})).await;
    let ack = recv_until(&mut ws, |v| v["id"] == "2").await;
    assert_eq!(ack["result"]["acknowledged"], true);

    let completed = recv_until(&mut ws, |v| v["method"] == "execution_completed").await;
    assert_eq!(completed["params"]["status"], "CANCELLED");
}

#[tokio::test]
async fn control_without_running_execution_is_rejected_over_the_wire() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(&mut ws, "1", "control", json!({"type": "PAUSE"})).await;
    let reply = recv_until(&mut ws, |v| v["id"] == "1").await;
    assert_eq!(reply["error"]["data"]["kind"], "NoActiveExecution");
}

#[tokio::test]
async fn pause_then_resume_allows_completion() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(
        &mut ws,
        "1",
        "execute",
        json!({"command": "sh -c 'sleep 0.2; echo done'", "stall_timeout_s": 10.0}),
    )
    .await;
    let _accepted = recv_until(&mut ws, |v| v["id"] == "1").await;
    let _started = recv_until(&mut ws, |v| v["method"] == "execution_started").await;

    send_request(&mut ws, "2", "control", json!({"type": "PAUSE"})).await;
    let _ack = recv_until(&mut ws, |v| v["id"] == "2").await;
    let _paused = recv_until(&mut ws, |v| v["method"] == "paused").await;

    send_request(&mut ws, "3", "control", json!({"type": "RESUME"})).await;
    let _ack = recv_until(&mut ws, |v| v["id"] == "3").await;
    let _resumed = recv_until(&mut ws, |v| v["method"] == "resumed").await;

    let completed = recv_until(&mut ws, |v| v["method"] == "execution_completed").await;
    assert_eq!(completed["params"]["status"], "EXITED");
}

#[tokio::test]
async fn malformed_json_does_not_close_the_connection() {
    let addr = spawn_server(test_config()).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    ws.send(Message::Text("{ not valid json".into())).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["error"]["code"], -32700);

    // The socket is still usable afterward.
    send_request(&mut ws, "1", "ping", json!({})).await;
    let pong = recv_until(&mut ws, |v| v["id"] == "1").await;
    assert_eq!(pong["result"]["pong"], true);
}

#[tokio::test]
async fn large_output_is_capped_and_warns_once() {
    let mut config = (*test_config()).clone();
    config.max_total_bytes = 4096;
    config.default_total_timeout_s = 20.0;
    config.default_stall_timeout_s = 20.0;
    let addr = spawn_server(Arc::new(config)).await;
    let mut ws = connect(addr).await;
    let _connected = recv_json(&mut ws).await;

    send_request(&mut ws, "1", "execute", json!({"command": "head -c 200000 /dev/zero"})).await;
    let _accepted = recv_until(&mut ws, |v| v["id"] == "1").await;

    let mut warnings = 0;
    let completed = loop {
        let v = recv_json(&mut ws).await;
        if v["method"] == "warning" && v["params"]["kind"] == "output_limit_reached" {
            warnings += 1;
        }
        if v["method"] == "execution_completed" {
            break v;
        }
    };
    assert_eq!(warnings, 1, "exactly one output_limit_reached warning expected");
    assert!(completed["params"]["bytes_dropped"].as_u64().unwrap() > 0);
    assert!(
        completed["params"]["bytes_out"].as_u64().unwrap() + completed["params"]["bytes_err"].as_u64().unwrap()
            <= 4096
    );
}

#[tokio::test]
async fn health_endpoint_reports_status() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = spawn_server(test_config()).await;
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.contains("200 OK"));
    assert!(response.contains("\"status\":\"healthy\""));
}

#[tokio::test]
async fn session_cap_rejects_handshake_beyond_capacity() {
    let mut config = (*test_config()).clone();
    config.max_sessions = 1;
    let config = Arc::new(config);
    let addr = spawn_server(config).await;

    let _first = connect(addr).await;
    // Give the admitted session a moment to register before the second dial.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://{addr}/ws/mcp");
    let result = tokio_tungstenite::connect_async(url).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 503);
        }
        other => panic!("expected HTTP 503 rejection, got: {other:?}"),
    }
}
