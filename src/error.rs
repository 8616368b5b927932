//! Error taxonomy.
//!
//! Each variant here corresponds to one of the error kinds in the service's
//! design (config validation, session admission, protocol parsing, session
//! state violations, hook failures, spawn failures). Errors that occur before
//! a command is spawned are surfaced as JSON-RPC error objects; errors that
//! occur during or after execution are folded into `execution_completed` or
//! `warning` notifications instead (see `rpc::ErrorObject::from`).

use thiserror::Error;

/// Failure loading or validating [`crate::config::Config`]. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Failure admitting a new session (capacity, malformed handshake).
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("session limit reached (max {max})")]
    SessionLimitReached { max: usize },
}

/// Failure parsing or validating an inbound JSON-RPC request.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

/// A session-state invariant was violated by the requested operation.
#[derive(Debug, Error)]
pub enum SessionStateError {
    #[error("a command is already running on this session")]
    AlreadyRunning,
    #[error("no active execution on this session")]
    NoActiveExecution,
    #[error("invalid control operation for current state")]
    InvalidState,
}

/// The requested command was rejected before spawn.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("command failed to shell-lex: {0}")]
    LexFailure(String),
    #[error("command '{0}' is not in the configured allow-list")]
    NotAllowed(String),
}

/// Failure kind surfaced by the hook pipeline.
#[derive(Debug, Error, Clone)]
pub enum HookError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("hook timed out after {0:.1}s")]
    Timeout(f64),
    #[error("hook exited with code {0}")]
    Exit(i32),
    #[error("hook aborted: {0}")]
    Abort(String),
    #[error("hook stdout did not parse as JSON: {0}")]
    MalformedResult(String),
}

/// The OS refused to start the child process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
