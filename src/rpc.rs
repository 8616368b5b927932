//! JSON-RPC 2.0 request/response/notification types (part of C8).
//!
//! Redesigned away from the teacher's dynamic `serde_json::Value` dispatch
//! on a `"type"` field (see `examples/gawd-ai-sctl/server/src/ws/mod.rs`) into
//! closed tagged-variant types, per spec.md §9's explicit redesign flag:
//! parse once at the boundary (`ClientMethod::try_from`), pass typed values
//! internally from there on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, HookError, ProtocolError, SessionStateError};

/// Raw inbound JSON-RPC 2.0 envelope, deserialized before method-specific
/// params are validated.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Params for the `execute` method.
#[derive(Debug, Deserialize)]
pub struct ExecuteParams {
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub total_timeout_s: Option<f64>,
    pub stall_timeout_s: Option<f64>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// The `type` field of a `control` request.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlType {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Deserialize)]
pub struct ControlParams {
    #[serde(rename = "type")]
    pub kind: ControlType,
}

/// A validated, typed client method — the only shape the rest of the crate
/// ever sees for an inbound request.
pub enum ClientMethod {
    Execute(ExecuteParams),
    Control(ControlParams),
    Ping,
}

impl RpcRequest {
    /// Parse `self.params` into a typed [`ClientMethod`] based on `self.method`.
    pub fn into_method(self) -> Result<ClientMethod, ProtocolError> {
        match self.method.as_str() {
            "execute" => serde_json::from_value(self.params)
                .map(ClientMethod::Execute)
                .map_err(|e| ProtocolError::InvalidParams(e.to_string())),
            "control" => serde_json::from_value(self.params)
                .map(ClientMethod::Control)
                .map_err(|e| ProtocolError::InvalidParams(e.to_string())),
            "ping" => Ok(ClientMethod::Ping),
            other => Err(ProtocolError::UnknownMethod(other.to_string())),
        }
    }
}

/// Named JSON-RPC error codes used by this service, layered on top of the
/// JSON-RPC 2.0 reserved ranges (`-32700..-32600`) in the implementation-
/// defined `-32000..-32099` band.
#[derive(Debug, Clone, Copy)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    AlreadyRunning,
    NoActiveExecution,
    InvalidState,
    InvalidCommand,
    CommandNotAllowed,
    HookAborted,
}

impl RpcErrorCode {
    fn code(self) -> i64 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::AlreadyRunning => -32000,
            RpcErrorCode::NoActiveExecution => -32001,
            RpcErrorCode::InvalidState => -32002,
            RpcErrorCode::InvalidCommand => -32003,
            RpcErrorCode::CommandNotAllowed => -32004,
            RpcErrorCode::HookAborted => -32005,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RpcErrorCode::ParseError => "ParseError",
            RpcErrorCode::InvalidRequest => "InvalidRequest",
            RpcErrorCode::MethodNotFound => "MethodNotFound",
            RpcErrorCode::InvalidParams => "InvalidParams",
            RpcErrorCode::AlreadyRunning => "AlreadyRunning",
            RpcErrorCode::NoActiveExecution => "NoActiveExecution",
            RpcErrorCode::InvalidState => "InvalidState",
            RpcErrorCode::InvalidCommand => "InvalidCommand",
            RpcErrorCode::CommandNotAllowed => "CommandNotAllowed",
            RpcErrorCode::HookAborted => "HookAborted",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(kind: RpcErrorCode, message: impl Into<String>) -> Self {
        RpcErrorObject {
            code: kind.code(),
            message: message.into(),
            data: Some(serde_json::json!({ "kind": kind.name() })),
        }
    }
}

impl From<ProtocolError> for RpcErrorObject {
    fn from(e: ProtocolError) -> Self {
        let kind = match &e {
            ProtocolError::MalformedJson(_) => RpcErrorCode::ParseError,
            ProtocolError::UnknownMethod(_) => RpcErrorCode::MethodNotFound,
            ProtocolError::InvalidParams(_) => RpcErrorCode::InvalidParams,
        };
        RpcErrorObject::new(kind, e.to_string())
    }
}

impl From<SessionStateError> for RpcErrorObject {
    fn from(e: SessionStateError) -> Self {
        let kind = match &e {
            SessionStateError::AlreadyRunning => RpcErrorCode::AlreadyRunning,
            SessionStateError::NoActiveExecution => RpcErrorCode::NoActiveExecution,
            SessionStateError::InvalidState => RpcErrorCode::InvalidState,
        };
        RpcErrorObject::new(kind, e.to_string())
    }
}

impl From<CommandError> for RpcErrorObject {
    fn from(e: CommandError) -> Self {
        let kind = match &e {
            CommandError::Empty | CommandError::LexFailure(_) => RpcErrorCode::InvalidCommand,
            CommandError::NotAllowed(_) => RpcErrorCode::CommandNotAllowed,
        };
        RpcErrorObject::new(kind, e.to_string())
    }
}

impl From<HookError> for RpcErrorObject {
    fn from(e: HookError) -> Self {
        RpcErrorObject::new(RpcErrorCode::HookAborted, e.to_string())
    }
}

/// A successful JSON-RPC response.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
}

impl RpcResponse {
    pub fn new(id: Value, result: Value) -> Self {
        RpcResponse {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

/// A failed JSON-RPC response.
#[derive(Debug, Serialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub error: RpcErrorObject,
}

impl RpcErrorResponse {
    pub fn new(id: Value, error: impl Into<RpcErrorObject>) -> Self {
        RpcErrorResponse {
            jsonrpc: "2.0",
            id,
            error: error.into(),
        }
    }
}

/// Server-to-client notifications (no `id`; spec.md §6.2).
#[derive(Debug, Serialize)]
#[serde(tag = "method", content = "params")]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    Connected {
        session_id: String,
        server_version: &'static str,
        limits: Value,
    },
    ExecutionStarted {
        execution_id: String,
        fingerprint: String,
        predicted_total_s: Option<f64>,
        predicted_stall_s: Option<f64>,
    },
    OutputChunk {
        execution_id: String,
        stream: &'static str,
        seq: u64,
        data: String,
        truncated: bool,
    },
    Paused {
        execution_id: String,
    },
    Resumed {
        execution_id: String,
    },
    Warning {
        execution_id: Option<String>,
        kind: &'static str,
        message: String,
    },
    HookWarning {
        hook_point: &'static str,
        severity: &'static str,
        error: String,
        impact: Option<String>,
        suggestion: Option<String>,
    },
    ExecutionCompleted {
        execution_id: String,
        status: &'static str,
        exit_code: Option<i32>,
        signal: Option<i32>,
        duration_s: f64,
        bytes_out: u64,
        bytes_err: u64,
        bytes_dropped: u64,
    },
}

impl Notification {
    /// Wrap as the bare JSON-RPC 2.0 notification envelope (`jsonrpc` added,
    /// no `id`).
    pub fn to_envelope(&self) -> Value {
        let mut v = serde_json::to_value(self).expect("Notification always serializes");
        if let Value::Object(ref mut map) = v {
            map.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_params_parse_from_raw_request() {
        let req: RpcRequest = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "1",
            "method": "execute",
            "params": { "command": "echo hi" }
        }))
        .unwrap();
        match req.into_method().unwrap() {
            ClientMethod::Execute(p) => assert_eq!(p.command, "echo hi"),
            _ => panic!("expected Execute"),
        }
    }

    #[test]
    fn unknown_method_is_protocol_error() {
        let req = RpcRequest {
            jsonrpc: None,
            id: Value::String("1".to_string()),
            method: "bogus".to_string(),
            params: Value::Null,
        };
        assert!(matches!(
            req.into_method(),
            Err(ProtocolError::UnknownMethod(_))
        ));
    }

    #[test]
    fn notification_envelope_carries_method_and_jsonrpc() {
        let n = Notification::Paused {
            execution_id: "e1".to_string(),
        };
        let v = n.to_envelope();
        assert_eq!(v["method"], "paused");
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["params"]["execution_id"], "e1");
    }
}
