//! WebSocket JSON-RPC Frontend (C8) — terminates the WebSocket, parses and
//! validates JSON-RPC 2.0 requests, routes them to a [`Session`], and
//! multiplexes notifications and responses onto a single outbound stream.
//!
//! Grounded on the teacher's `ws/mod.rs` `handle_ws` (split socket into
//! sink/stream, `tokio::select!` over incoming frames and a side channel of
//! server-originated events, one task owning the sink so sends never
//! interleave) — the protocol contents are fully replaced: this module
//! dispatches closed, typed JSON-RPC request/response/notification values
//! from `rpc.rs` instead of the teacher's dynamic `serde_json::Value`
//! dispatch on a `"type"` field, per spec.md §9's explicit redesign flag.
//!
//! Unlike the teacher, there is no separate `send_task` forwarding channel:
//! one task owns both the socket's write half and the read loop, since a
//! session has at most one execution in flight and thus at most one
//! concurrent source of notifications — the extra channel the teacher needs
//! for fan-in from many persistent shell sessions has no counterpart here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::rpc::{
    ClientMethod, Notification, RpcErrorObject, RpcErrorResponse, RpcRequest, RpcResponse,
};
use crate::session::Session;

/// Shared state handed to every axum route: the process-wide registry, the
/// immutable config, and the server's start time (for `/health`'s uptime).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// `GET /health` — unauthenticated liveness probe (spec.md §6.1).
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "sessions": state.registry.count().await,
        "uptime_s": state.start_time.elapsed().as_secs_f64(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /ws/mcp` — WebSocket upgrade handler.
///
/// Admission is checked *before* completing the upgrade: a session-cap
/// rejection is returned as a plain HTTP response so the client sees a
/// structured body rather than a WebSocket that opens and immediately
/// closes.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    match state.registry.admit().await {
        Ok((session, notify_rx)) => {
            let registry = state.registry.clone();
            let config = state.config.clone();
            ws.max_message_size(config.ws_max_message_bytes)
                .on_upgrade(move |socket| handle_ws(socket, session, notify_rx, registry, config))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "session_limit_reached", "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// Drive one admitted connection until it closes.
///
/// Owns the socket's sink directly in this task's `select!` loop, rather
/// than funneling through an extra mpsc channel: the only two sources of
/// outbound traffic are this session's own [`Notification`]s and this
/// connection's own JSON-RPC replies, so no cross-task fan-in is needed and
/// sends are trivially serialized by construction.
async fn handle_ws(
    socket: WebSocket,
    session: Arc<Session>,
    mut notify_rx: mpsc::Receiver<Notification>,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
) {
    let (mut sink, mut stream) = socket.split();

    let connected = json!({
        "jsonrpc": "2.0",
        "method": "connected",
        "params": {
            "session_id": session.id,
            "server_version": env!("CARGO_PKG_VERSION"),
            "limits": {
                "default_total_timeout_s": config.default_total_timeout_s,
                "default_stall_timeout_s": config.default_stall_timeout_s,
                "extreme_stall_timeout_s": config.extreme_stall_timeout_s,
                "max_total_bytes": config.max_total_bytes,
                "max_line_bytes": config.max_line_bytes,
                "ws_max_message_bytes": config.ws_max_message_bytes,
            },
        },
    });
    if sink
        .send(Message::Text(connected.to_string().into()))
        .await
        .is_err()
    {
        registry.remove(&session.id).await;
        return;
    }

    let ping_interval = Duration::from_secs(config.ws_ping_interval_s.max(1));
    let pong_timeout = Duration::from_secs(config.ws_pong_timeout_s.max(1));
    let mut ping_ticker = tokio::time::interval(ping_interval);
    ping_ticker.tick().await; // first tick fires immediately; consume it
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            biased;

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        session.touch().await;
                        let reply = handle_request(&session, &text).await;
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        session.touch().await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        warn!(session_id = %session.id, "binary frame is out of protocol, closing");
                        let _ = sink.send(Message::Close(Some(CloseFrame {
                            code: 1003,
                            reason: "binary frames are not supported".into(),
                        }))).await;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session.id, error = %e, "websocket read error, closing");
                        break;
                    }
                }
            }

            notif = notify_rx.recv() => {
                let Some(n) = notif else { continue };
                if sink.send(Message::Text(n.to_envelope().to_string().into())).await.is_err() {
                    break;
                }
            }

            _ = ping_ticker.tick() => {
                if last_pong.elapsed() > pong_timeout + ping_interval {
                    warn!(session_id = %session.id, "ping/pong keepalive timed out, closing");
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "keepalive timeout".into(),
                    }))).await;
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(session_id = %session.id, "connection closed, cancelling any running execution");
    session.close().await;
    registry.remove(&session.id).await;
    let _ = sink.close().await;
}

/// Parse and dispatch one inbound JSON-RPC request, returning the response
/// envelope to send back. Malformed JSON and unknown/invalid methods never
/// reach or mutate the [`Session`]'s state.
async fn handle_request(session: &Arc<Session>, text: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            return response_value(RpcErrorResponse::new(
                Value::Null,
                RpcErrorObject::new(
                    crate::rpc::RpcErrorCode::ParseError,
                    format!("malformed JSON-RPC request: {e}"),
                ),
            ));
        }
    };
    let id = request.id.clone();

    match request.into_method() {
        Err(e) => response_value(RpcErrorResponse::new(id, e)),
        Ok(ClientMethod::Execute(params)) => match session.execute(params).await {
            Ok(accepted) => response_value(RpcResponse::new(
                id,
                json!({ "execution_id": accepted.execution_id, "accepted": true }),
            )),
            Err(e) => response_value(RpcErrorResponse::new(id, e)),
        },
        Ok(ClientMethod::Control(params)) => match session.control(params.kind).await {
            Ok(()) => response_value(RpcResponse::new(id, json!({ "acknowledged": true }))),
            Err(e) => response_value(RpcErrorResponse::new(id, e)),
        },
        Ok(ClientMethod::Ping) => response_value(RpcResponse::new(
            id,
            json!({ "pong": true, "server_time": now_rfc3339() }),
        )),
    }
}

fn response_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).expect("response types always serialize")
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingStore;
    use std::sync::Arc;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            listen_addr: "127.0.0.1:0".to_string(),
            max_sessions: 10,
            session_idle_timeout_s: 3600,
            ws_max_message_bytes: 1024 * 1024,
            ws_ping_interval_s: 30,
            ws_pong_timeout_s: 10,
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
            log_level: "info".to_string(),
        })
    }

    async fn test_session() -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(64);
        Session::new(
            "s1".to_string(),
            test_config(),
            Arc::new(TimingStore::new(None, 3600, 100, 0.3, 1.0, 60.0)),
            None,
            tx,
        )
    }

    #[tokio::test]
    async fn malformed_json_yields_parse_error_without_touching_session() {
        let session = test_session().await;
        let reply = handle_request(&session, "{ not json").await;
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn ping_method_is_answered() {
        let session = test_session().await;
        let reply = handle_request(
            &session,
            r#"{"jsonrpc":"2.0","id":"1","method":"ping","params":{}}"#,
        )
        .await;
        assert_eq!(reply["result"]["pong"], true);
        assert_eq!(reply["id"], "1");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let session = test_session().await;
        let reply = handle_request(
            &session,
            r#"{"jsonrpc":"2.0","id":"1","method":"bogus","params":{}}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn control_without_running_execution_is_rejected() {
        let session = test_session().await;
        let reply = handle_request(
            &session,
            r#"{"jsonrpc":"2.0","id":"1","method":"control","params":{"type":"CANCEL"}}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn execute_accepts_and_returns_execution_id() {
        let session = test_session().await;
        let reply = handle_request(
            &session,
            r#"{"jsonrpc":"2.0","id":"1","method":"execute","params":{"command":"sh -c 'exit 0'"}}"#,
        )
        .await;
        assert_eq!(reply["result"]["accepted"], true);
        assert!(reply["result"]["execution_id"].is_string());
    }
}
