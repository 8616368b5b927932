//! Hook Runner (C3) — external validator/transformer subprocesses invoked at
//! well-defined lifecycle points.
//!
//! Each invocation follows the deadlock-safe pattern used for hook-like
//! subprocesses elsewhere in the ecosystem: both stdout and stderr drains are
//! spawned before stdin is written, so a hook that echoes input back before
//! consuming all of it can never wedge against this side.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::HookError;
use crate::secrets::is_sensitive;

/// Closed set of lifecycle points a hook may be registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreExecute,
    PreClaude,
    PostClaude,
    PreTool,
    PostTool,
    PreEdit,
    PostEdit,
    PostOutput,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::PreExecute => "pre_execute",
            HookPoint::PreClaude => "pre_claude",
            HookPoint::PostClaude => "post_claude",
            HookPoint::PreTool => "pre_tool",
            HookPoint::PostTool => "post_tool",
            HookPoint::PreEdit => "pre_edit",
            HookPoint::PostEdit => "post_edit",
            HookPoint::PostOutput => "post_output",
        }
    }

    fn from_str(s: &str) -> Option<HookPoint> {
        Some(match s {
            "pre_execute" => HookPoint::PreExecute,
            "pre_claude" => HookPoint::PreClaude,
            "post_claude" => HookPoint::PostClaude,
            "pre_tool" => HookPoint::PreTool,
            "post_tool" => HookPoint::PostTool,
            "pre_edit" => HookPoint::PreEdit,
            "post_edit" => HookPoint::PostEdit,
            "post_output" => HookPoint::PostOutput,
            _ => return None,
        })
    }

    /// Only these hook points are allowed to mutate the command via
    /// `modified_command`; all others may only emit warnings.
    fn allows_mutation(self) -> bool {
        matches!(self, HookPoint::PreExecute | HookPoint::PreClaude)
    }
}

/// One configured hook command.
#[derive(Debug, Clone)]
pub struct HookSpec {
    pub command: String,
    pub timeout_s: f64,
}

/// Parsed `hook_config_path` JSON file (spec.md §6.3).
#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    hooks: HashMap<HookPoint, Vec<HookSpec>>,
    default_timeout_s: f64,
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawHookConfig {
    #[serde(default)]
    hooks: HashMap<String, RawHookValue>,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default)]
    env: HashMap<String, String>,
}

fn default_timeout() -> f64 {
    30.0
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawHookValue {
    Shorthand(String),
    Explicit { command: String, timeout: Option<f64> },
    List(Vec<RawHookValue>),
}

impl HookConfig {
    /// Load and parse the hook config JSON file. Unknown top-level keys and
    /// unknown hook_point keys are ignored (the latter with a startup
    /// warning), per spec.md §6.3.
    pub async fn load(path: &str) -> Result<HookConfig, String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| format!("failed to read hook config {path}: {e}"))?;
        let raw: RawHookConfig =
            serde_json::from_slice(&bytes).map_err(|e| format!("invalid hook config: {e}"))?;

        let mut hooks: HashMap<HookPoint, Vec<HookSpec>> = HashMap::new();
        for (key, value) in raw.hooks {
            let Some(point) = HookPoint::from_str(&key) else {
                warn!("hook config: unknown hook_point '{key}', ignoring");
                continue;
            };
            let mut specs = Vec::new();
            flatten_hook_value(value, raw.timeout, &mut specs);
            hooks.insert(point, specs);
        }

        Ok(HookConfig {
            hooks,
            default_timeout_s: raw.timeout,
            env: raw.env,
        })
    }

    pub fn for_point(&self, point: HookPoint) -> &[HookSpec] {
        self.hooks.get(&point).map_or(&[], Vec::as_slice)
    }
}

fn flatten_hook_value(value: RawHookValue, default_timeout_s: f64, out: &mut Vec<HookSpec>) {
    match value {
        RawHookValue::Shorthand(command) => out.push(HookSpec {
            command,
            timeout_s: default_timeout_s,
        }),
        RawHookValue::Explicit { command, timeout } => out.push(HookSpec {
            command,
            timeout_s: timeout.unwrap_or(default_timeout_s),
        }),
        RawHookValue::List(items) => {
            for item in items {
                flatten_hook_value(item, default_timeout_s, out);
            }
        }
    }
}

/// Outcome of running the hooks registered at one lifecycle point.
#[derive(Debug, Default)]
pub struct HookOutcome {
    /// Replacement command, only honored for `pre_execute`/`pre_claude`.
    pub modified_command: Option<String>,
    /// Set when a hook requested abort; carries its `error` message.
    pub abort: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HookResultJson {
    modified_command: Option<String>,
    #[serde(default)]
    abort: bool,
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

const MAX_STDOUT_LOG_BYTES: usize = 10 * 1024;

/// Render bytes for logging: printable UTF-8 as-is (truncated to the cap),
/// otherwise a hex preview of the first 64 bytes per SPEC_FULL.md §10.5.
fn render_for_log(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.len() <= MAX_STDOUT_LOG_BYTES => s.to_string(),
        Ok(s) => format!("{}... (truncated, {} bytes)", &s[..MAX_STDOUT_LOG_BYTES], s.len()),
        Err(_) => {
            let preview_len = bytes.len().min(64);
            format!(
                "{}... (binary, {} bytes)",
                hex::encode(&bytes[..preview_len]),
                bytes.len()
            )
        }
    }
}

/// Run every hook registered at `point` sequentially, in declaration order.
///
/// Context is passed to each hook as environment variables: `execution_id`,
/// `session_id`, `command`, and any extra fields the caller supplies (e.g.
/// `exit_code`, `bytes_out`, `duration_s`) pre-serialized into `context`.
pub async fn run_hooks(
    config: &HookConfig,
    point: HookPoint,
    session_id: &str,
    execution_id: &str,
    mut context: HashMap<String, String>,
) -> HookOutcome {
    let mut outcome = HookOutcome::default();
    context.insert("session_id".to_string(), session_id.to_string());
    context.insert("execution_id".to_string(), execution_id.to_string());
    for (k, v) in &config.env {
        context.entry(k.clone()).or_insert_with(|| v.clone());
    }

    for spec in config.for_point(point) {
        match run_one_hook(spec, &context).await {
            Ok(result) => {
                if point.allows_mutation() {
                    if let Some(cmd) = result.modified_command {
                        context.insert("command".to_string(), cmd.clone());
                        outcome.modified_command = Some(cmd);
                    }
                }
                if result.abort {
                    outcome.abort = Some(result.error.unwrap_or_else(|| "hook aborted".to_string()));
                    break;
                }
                outcome.warnings.extend(result.warnings);
            }
            Err(e) => {
                warn!(hook_point = point.as_str(), error = %e, "hook failed");
                outcome.warnings.push(e.to_string());
                if point == HookPoint::PreExecute || point == HookPoint::PreClaude {
                    outcome.abort = Some(e.to_string());
                    break;
                }
            }
        }
    }
    outcome
}

async fn run_one_hook(
    spec: &HookSpec,
    context: &HashMap<String, String>,
) -> Result<HookResultJson, HookError> {
    let parts = shlex::split(&spec.command)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| HookError::ExecutableNotFound(spec.command.clone()))?;
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| HookError::ExecutableNotFound(spec.command.clone()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in context {
        if !is_sensitive(k) {
            cmd.env(k, v);
        }
    }
    // Never let an ambient sensitive var leak into the hook's environment.
    for (k, _) in std::env::vars() {
        if is_sensitive(&k) {
            cmd.env_remove(&k);
        }
    }
    #[cfg(unix)]
    {
        // SAFETY: pre_exec runs after fork, before exec, in the child only.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|_| HookError::ExecutableNotFound(spec.command.clone()))?;
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let wait_result = tokio::time::timeout(Duration::from_secs_f64(spec.timeout_s), child.wait()).await;
    let status = match wait_result {
        Ok(Ok(status)) => status,
        Ok(Err(_)) => return Err(HookError::Exit(-1)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(HookError::Timeout(spec.timeout_s));
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    if !stderr_bytes.is_empty() {
        info!(hook = %spec.command, stderr = %render_for_log(&stderr_bytes), "hook stderr");
    }

    if !status.success() {
        return Err(HookError::Exit(status.code().unwrap_or(-1)));
    }

    if stdout_bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HookResultJson::default());
    }

    serde_json::from_slice(&stdout_bytes)
        .map_err(|e| HookError::MalformedResult(format!("{e}: {}", render_for_log(&stdout_bytes))))
}
