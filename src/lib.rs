#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! cc-executor library — a WebSocket-fronted process-execution service that
//! sequentially orchestrates spawned CLI subprocesses, one bounded execution
//! slot per session.
//!
//! - `config` — environment-driven typed configuration
//! - `error` — the error taxonomy shared by every layer
//! - `timing` — the persistent duration-history store and timeout estimator
//! - `hooks` — the external validator/transformer subprocess pipeline
//! - `stream` — bounded, chunked draining of a child's stdout/stderr
//! - `supervisor` — one execution's process lifecycle, timers, and signals
//! - `session` — per-connection state owning at most one running execution
//! - `registry` — process-wide admission control and session lookup
//! - `rpc` — the JSON-RPC 2.0 request/response/notification types
//! - `secrets` — the sensitive-env-var blocklist shared by hooks and the supervisor
//! - `ws` — the WebSocket frontend and health endpoint

pub mod config;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod rpc;
pub mod secrets;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod timing;
pub mod ws;

pub use config::Config;
pub use registry::SessionRegistry;
