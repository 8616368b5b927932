//! Session (C6) — per-connection state machine owning at most one running
//! Execution.
//!
//! Grounded on the teacher's `sessions/session.rs` `ManagedSession` (one
//! struct owning a child's lifecycle behind a lock, exposing signal/kill as
//! async methods), reduced from a pool-of-persistent-executions model down
//! to "at most one Execution at a time" per spec.md §3/§4.6: a second
//! `execute` while one is running is rejected outright rather than queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CommandError, SessionStateError, SpawnError};
use crate::hooks::{self, HookConfig, HookPoint};
use crate::rpc::{ControlType, ExecuteParams, Notification, RpcErrorObject};
use crate::stream::DrainEvent;
use crate::supervisor::{self, ControlCommand, ExitStatusKind, Limits};
use crate::timing::{self, TimingStore};

/// Why `execute` was rejected before a process was ever spawned.
#[derive(Debug)]
pub enum ExecuteError {
    State(SessionStateError),
    Command(CommandError),
    HookAbort(String),
    Spawn(SpawnError),
}

impl From<ExecuteError> for RpcErrorObject {
    fn from(e: ExecuteError) -> Self {
        match e {
            ExecuteError::State(e) => e.into(),
            ExecuteError::Command(e) => e.into(),
            ExecuteError::Spawn(e) => {
                RpcErrorObject::new(crate::rpc::RpcErrorCode::InvalidCommand, e.to_string())
            }
            ExecuteError::HookAbort(msg) => {
                RpcErrorObject::new(crate::rpc::RpcErrorCode::HookAborted, msg)
            }
        }
    }
}

enum SessionState {
    Idle,
    /// Hooks are running / the child is being spawned; blocks a concurrent
    /// `execute` without yet having a `control_tx` to expose.
    Starting,
    Running {
        execution_id: String,
        control_tx: mpsc::Sender<ControlCommand>,
    },
}

/// Accepted-synchronously result of `execute`; the rest of the lifecycle is
/// reported via [`Notification`]s on the session's outbound channel.
pub struct ExecuteAccepted {
    pub execution_id: String,
}

/// One WebSocket connection's worth of state: identity, the hook/timing
/// services it shares with every other session, and at most one running
/// execution.
pub struct Session {
    pub id: String,
    config: Arc<Config>,
    timing: Arc<TimingStore>,
    hooks: Option<Arc<HookConfig>>,
    state: Mutex<SessionState>,
    notify_tx: mpsc::Sender<Notification>,
    last_activity: Mutex<Instant>,
}

fn first_token(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

fn check_allowed(config: &Config, command: &str) -> Result<(), CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::Empty);
    }
    if let Some(allowed) = &config.allowed_commands {
        let program = first_token(command);
        if !allowed.iter().any(|a| a == program) {
            return Err(CommandError::NotAllowed(program.to_string()));
        }
    }
    Ok(())
}

impl Session {
    pub fn new(
        id: String,
        config: Arc<Config>,
        timing: Arc<TimingStore>,
        hooks: Option<Arc<HookConfig>>,
        notify_tx: mpsc::Sender<Notification>,
    ) -> Arc<Session> {
        Arc::new(Session {
            id,
            config,
            timing,
            hooks,
            state: Mutex::new(SessionState::Idle),
            notify_tx,
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// True when the session has no execution in flight and has been quiet
    /// for at least `idle_timeout_s` — the idle-sweep eligibility check.
    pub async fn is_idle_past(&self, idle_timeout_s: u64) -> bool {
        let idle = matches!(*self.state.lock().await, SessionState::Idle);
        idle && self.last_activity.lock().await.elapsed().as_secs() >= idle_timeout_s
    }

    /// Accept and run one command. Returns as soon as the child has been
    /// spawned (or rejected); the rest of the execution is reported via
    /// notifications on a background task.
    pub async fn execute(self: &Arc<Self>, params: ExecuteParams) -> Result<ExecuteAccepted, ExecuteError> {
        {
            let mut state = self.state.lock().await;
            match &*state {
                SessionState::Idle => *state = SessionState::Starting,
                _ => return Err(ExecuteError::State(SessionStateError::AlreadyRunning)),
            }
        }

        match self.start_execution(params).await {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                *self.state.lock().await = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn start_execution(
        self: &Arc<Self>,
        params: ExecuteParams,
    ) -> Result<ExecuteAccepted, ExecuteError> {
        check_allowed(&self.config, &params.command).map_err(ExecuteError::Command)?;

        let execution_id = Uuid::new_v4().to_string();
        let mut context = HashMap::new();
        context.insert("command".to_string(), params.command.clone());

        let command = if let Some(hooks) = &self.hooks {
            let outcome = hooks::run_hooks(hooks, HookPoint::PreExecute, &self.id, &execution_id, context).await;
            for warning in &outcome.warnings {
                self.emit(Notification::HookWarning {
                    hook_point: HookPoint::PreExecute.as_str(),
                    severity: "warning",
                    error: warning.clone(),
                    impact: None,
                    suggestion: None,
                })
                .await;
            }
            if let Some(error) = outcome.abort {
                return Err(ExecuteError::HookAbort(error));
            }
            outcome.modified_command.unwrap_or(params.command)
        } else {
            params.command
        };

        check_allowed(&self.config, &command).map_err(ExecuteError::Command)?;

        let fingerprint = timing::fingerprint(&command);
        let estimate = self.timing.lookup(&fingerprint).await;
        let total_timeout_s = params
            .total_timeout_s
            .or_else(|| estimate.map(|e| e.predicted_total_s))
            .unwrap_or(self.config.default_total_timeout_s);
        let stall_timeout_s = params
            .stall_timeout_s
            .or_else(|| estimate.map(|e| e.predicted_stall_s))
            .unwrap_or(self.config.default_stall_timeout_s)
            .min(self.config.extreme_stall_timeout_s);

        let limits = Limits {
            total_timeout_s,
            stall_timeout_s,
            max_total_bytes: self.config.max_total_bytes,
            max_line_bytes: self.config.max_line_bytes,
        };

        let handle = supervisor::spawn(
            &command,
            &params.env,
            limits,
            self.id.clone(),
            execution_id.clone(),
            self.config.graceful_shutdown_s,
        )
        .await
        .map_err(ExecuteError::Spawn)?;

        *self.state.lock().await = SessionState::Running {
            execution_id: execution_id.clone(),
            control_tx: handle.control_tx.clone(),
        };

        self.emit(Notification::ExecutionStarted {
            execution_id: execution_id.clone(),
            fingerprint: fingerprint.clone(),
            predicted_total_s: estimate.map(|e| e.predicted_total_s),
            predicted_stall_s: estimate.map(|e| e.predicted_stall_s),
        })
        .await;

        let session = Arc::clone(self);
        let execution_id_for_task = execution_id.clone();
        tokio::spawn(async move {
            session.drive(execution_id_for_task, command, fingerprint, handle).await;
        });

        Ok(ExecuteAccepted { execution_id })
    }

    async fn drive(
        self: Arc<Self>,
        execution_id: String,
        command: String,
        fingerprint: String,
        mut handle: supervisor::SupervisorHandle,
    ) {
        while let Some(event) = handle.events_rx.recv().await {
            match event {
                DrainEvent::Chunk { stream, seq, data, truncated } => {
                    self.emit(Notification::OutputChunk {
                        execution_id: execution_id.clone(),
                        stream: stream.as_str(),
                        seq,
                        data,
                        truncated,
                    })
                    .await;
                }
                DrainEvent::OutputLimitReached => {
                    self.emit(Notification::Warning {
                        execution_id: Some(execution_id.clone()),
                        kind: "output_limit_reached",
                        message: "execution output exceeded max_total_bytes; excess has been dropped".to_string(),
                    })
                    .await;
                }
            }
        }

        let completion = match handle.completion_rx.await {
            Ok(c) => c,
            Err(_) => {
                warn!(session_id = %self.id, execution_id, "supervisor dropped without a completion");
                *self.state.lock().await = SessionState::Idle;
                return;
            }
        };

        for flag in &completion.also_triggered {
            self.emit(Notification::Warning {
                execution_id: Some(execution_id.clone()),
                kind: "race_condition",
                message: format!("a concurrent control command raced the terminal condition: {flag}"),
            })
            .await;
        }

        if let Some(hooks) = &self.hooks {
            let mut context = HashMap::new();
            context.insert("command".to_string(), command.clone());
            context.insert("status".to_string(), completion.status.as_str().to_string());
            context.insert(
                "exit_code".to_string(),
                completion.exit_code.map_or_else(String::new, |c| c.to_string()),
            );
            context.insert("bytes_out".to_string(), completion.bytes_out.to_string());
            context.insert("bytes_err".to_string(), completion.bytes_err.to_string());
            context.insert("duration_s".to_string(), completion.duration_s.to_string());

            let outcome = hooks::run_hooks(hooks, HookPoint::PostOutput, &self.id, &execution_id, context).await;
            for warning in &outcome.warnings {
                self.emit(Notification::HookWarning {
                    hook_point: HookPoint::PostOutput.as_str(),
                    severity: "warning",
                    error: warning.clone(),
                    impact: None,
                    suggestion: None,
                })
                .await;
            }
            // modified_command/abort from post_output are not actionable —
            // the execution already ran; see the decided Open Question.
        }

        if completion.status == ExitStatusKind::Exited {
            self.timing.record(&fingerprint, completion.duration_s).await;
        }

        info!(
            session_id = %self.id,
            execution_id,
            status = completion.status.as_str(),
            "reporting execution_completed"
        );

        self.emit(Notification::ExecutionCompleted {
            execution_id,
            status: completion.status.as_str(),
            exit_code: completion.exit_code,
            signal: completion.signal,
            duration_s: completion.duration_s,
            bytes_out: completion.bytes_out,
            bytes_err: completion.bytes_err,
            bytes_dropped: completion.bytes_dropped,
        })
        .await;

        *self.state.lock().await = SessionState::Idle;
    }

    /// Apply PAUSE/RESUME/CANCEL to the running execution, if any.
    pub async fn control(&self, kind: ControlType) -> Result<(), SessionStateError> {
        let state = self.state.lock().await;
        match &*state {
            SessionState::Running { control_tx, execution_id } => {
                let cmd = match kind {
                    ControlType::Pause => ControlCommand::Pause,
                    ControlType::Resume => ControlCommand::Resume,
                    ControlType::Cancel => ControlCommand::Cancel,
                };
                let notify = match kind {
                    ControlType::Pause => Some(Notification::Paused {
                        execution_id: execution_id.clone(),
                    }),
                    ControlType::Resume => Some(Notification::Resumed {
                        execution_id: execution_id.clone(),
                    }),
                    ControlType::Cancel => None,
                };
                control_tx
                    .send(cmd)
                    .await
                    .map_err(|_| SessionStateError::NoActiveExecution)?;
                drop(state);
                if let Some(n) = notify {
                    self.emit(n).await;
                }
                Ok(())
            }
            SessionState::Starting | SessionState::Idle => Err(SessionStateError::NoActiveExecution),
        }
    }

    /// Dropped-socket cleanup: an implicit CANCEL on whatever is running,
    /// per spec.md §5.
    pub async fn close(&self) {
        let state = self.state.lock().await;
        if let SessionState::Running { control_tx, .. } = &*state {
            let _ = control_tx.send(ControlCommand::Cancel).await;
        }
    }

    async fn emit(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification).await;
    }
}
