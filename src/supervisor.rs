//! Process Supervisor (C5) — owns one Execution's process and timers, from
//! spawn through `TERMINAL(status)`.
//!
//! Grounded on the teacher's `shell/process.rs::spawn_shell_pgroup` (pre_exec
//! + process-group leader) for spawn, and `sessions/session.rs`'s
//! `send_signal`/`graceful_kill` for the SIGTERM→SIGKILL termination
//! protocol — generalized from raw `libc::kill` calls to `nix::sys::signal`,
//! matching the safer signal-to-process-group idiom used elsewhere in the
//! retrieved pack. The dual total/stall timer state machine has no teacher
//! counterpart and is built directly from spec.md §4.5.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant as TokioInstant;
use tracing::{info, warn};

use crate::error::SpawnError;
use crate::secrets::is_sensitive;
use crate::stream::{drain_stream, DrainEvent, OutputBudget, StreamKind};

/// Bounds applied to one execution (`Execution.limits` in the data model).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub total_timeout_s: f64,
    pub stall_timeout_s: f64,
    pub max_total_bytes: usize,
    pub max_line_bytes: usize,
}

/// Terminal outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusKind {
    Exited,
    Signaled,
    Timeout,
    Stalled,
    Cancelled,
    SpawnFailed,
}

impl ExitStatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitStatusKind::Exited => "EXITED",
            ExitStatusKind::Signaled => "SIGNALED",
            ExitStatusKind::Timeout => "TIMEOUT",
            ExitStatusKind::Stalled => "STALLED",
            ExitStatusKind::Cancelled => "CANCELLED",
            ExitStatusKind::SpawnFailed => "SPAWN_FAILED",
        }
    }
}

/// Control operations a Session applies to a running Supervisor.
#[derive(Debug, Clone, Copy)]
pub enum ControlCommand {
    Pause,
    Resume,
    Cancel,
}

/// Final record of one execution, handed back to the owning Session.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExitStatusKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub bytes_out: u64,
    pub bytes_err: u64,
    pub bytes_dropped: u64,
    pub duration_s: f64,
    /// Other terminal conditions that raced the winner (spec.md §4.5 tie-break).
    pub also_triggered: Vec<&'static str>,
}

/// Live channels a Session drives while an execution runs.
pub struct SupervisorHandle {
    pub pid: u32,
    pub events_rx: mpsc::Receiver<DrainEvent>,
    pub control_tx: mpsc::Sender<ControlCommand>,
    pub completion_rx: oneshot::Receiver<Completion>,
}

/// Spawn `command` as the leader of a new process group and drive it to
/// completion in a background task.
///
/// Returns as soon as the child has been spawned (not when it exits) with a
/// handle for observing output and applying PAUSE/RESUME/CANCEL.
pub async fn spawn(
    command: &str,
    env_overrides: &HashMap<String, String>,
    limits: Limits,
    session_id: String,
    execution_id: String,
    graceful_shutdown_s: u64,
) -> Result<SupervisorHandle, SpawnError> {
    let bad_command = |msg: &str| SpawnError::Io {
        command: command.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string()),
    };
    let parts = shlex::split(command)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_command("command failed to shell-lex"))?;
    let (program, args) = parts.split_first().ok_or_else(|| bad_command("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // The process group, not Drop, owns termination — see `terminate_group`.
        .kill_on_drop(false);

    // Child environment = parent env minus the sensitive-key blocklist, plus
    // hook-merged env_overrides, plus the session/execution id vars —
    // spec.md §4.5. Strip before adding the id vars and overrides so neither
    // can be clobbered back in by a same-named ambient var.
    for (k, _) in std::env::vars() {
        if is_sensitive(&k) {
            cmd.env_remove(&k);
        }
    }
    cmd.env("CC_EXECUTOR_SESSION_ID", &session_id)
        .env("CC_EXECUTOR_EXECUTION_ID", &execution_id)
        .envs(env_overrides);

    // SAFETY: setsid is async-signal-safe; runs after fork, before exec, in
    // the child only.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| SpawnError::Io {
        command: command.to_string(),
        source: e,
    })?;
    let pid = child
        .id()
        .ok_or_else(|| bad_command("child exited before its pid could be read"))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let budget = Arc::new(OutputBudget::new(limits.max_total_bytes));
    let activity = Arc::new(Notify::new());
    let (events_tx, events_rx) = mpsc::channel(256);
    let (control_tx, control_rx) = mpsc::channel(8);
    let (completion_tx, completion_rx) = oneshot::channel();

    let stdout_task = tokio::spawn(drain_stream(
        StreamKind::Stdout,
        stdout,
        limits.max_line_bytes,
        budget.clone(),
        events_tx.clone(),
        activity.clone(),
    ));
    let stderr_task = tokio::spawn(drain_stream(
        StreamKind::Stderr,
        stderr,
        limits.max_line_bytes,
        budget.clone(),
        events_tx,
        activity.clone(),
    ));

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = child.wait().await;
        let _ = exit_tx.send(result);
    });

    info!(session_id = %session_id, execution_id = %execution_id, pid, command, "execution spawned");

    tokio::spawn(run(
        pid,
        limits,
        control_rx,
        exit_rx,
        stdout_task,
        stderr_task,
        budget,
        activity,
        completion_tx,
        graceful_shutdown_s,
        session_id,
        execution_id,
    ));

    Ok(SupervisorHandle {
        pid,
        events_rx,
        control_tx,
        completion_rx,
    })
}

type WaitResult = std::io::Result<std::process::ExitStatus>;

#[allow(clippy::too_many_arguments)]
async fn run(
    pid: u32,
    limits: Limits,
    mut control_rx: mpsc::Receiver<ControlCommand>,
    mut exit_rx: oneshot::Receiver<WaitResult>,
    stdout_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
    budget: Arc<OutputBudget>,
    activity: Arc<Notify>,
    completion_tx: oneshot::Sender<Completion>,
    graceful_shutdown_s: u64,
    session_id: String,
    execution_id: String,
) {
    let start = Instant::now();
    let total_deadline = TokioInstant::now() + Duration::from_secs_f64(limits.total_timeout_s.max(0.0));
    let mut stall_deadline = TokioInstant::now() + Duration::from_secs_f64(limits.stall_timeout_s.max(0.0));
    let mut paused = false;
    let mut also_triggered: Vec<&'static str> = Vec::new();
    let mut natural_exit: Option<WaitResult> = None;

    let status = 'outer: loop {
        tokio::select! {
            biased;

            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(ControlCommand::Pause) => {
                        if !paused {
                            paused = true;
                            let _ = signal::kill(Pid::from_raw(-pgid(pid)), Signal::SIGSTOP);
                            info!(session_id = %session_id, execution_id = %execution_id, "execution paused");
                        }
                    }
                    Some(ControlCommand::Resume) => {
                        if paused {
                            paused = false;
                            stall_deadline = TokioInstant::now() + Duration::from_secs_f64(limits.stall_timeout_s.max(0.0));
                            let _ = signal::kill(Pid::from_raw(-pgid(pid)), Signal::SIGCONT);
                            info!(session_id = %session_id, execution_id = %execution_id, "execution resumed");
                        }
                    }
                    Some(ControlCommand::Cancel) => {
                        break 'outer ExitStatusKind::Cancelled;
                    }
                    None => break 'outer ExitStatusKind::Cancelled,
                }
            }

            () = activity.notified() => {
                if !paused {
                    stall_deadline = TokioInstant::now() + Duration::from_secs_f64(limits.stall_timeout_s.max(0.0));
                }
            }

            () = tokio::time::sleep_until(total_deadline) => {
                break 'outer ExitStatusKind::Timeout;
            }

            () = tokio::time::sleep_until(stall_deadline), if !paused => {
                break 'outer ExitStatusKind::Stalled;
            }

            exit_result = &mut exit_rx => {
                natural_exit = Some(exit_result.unwrap_or_else(|_| {
                    Err(std::io::Error::other("wait task dropped"))
                }));
                break 'outer ExitStatusKind::Exited;
            }
        }
    };

    // Tie-break: record any other condition that was already pending when
    // the winner broke the loop, per spec.md §4.5.
    while let Ok(extra) = control_rx.try_recv() {
        also_triggered.push(match extra {
            ControlCommand::Pause => "pause_also_pending",
            ControlCommand::Resume => "resume_also_pending",
            ControlCommand::Cancel => "cancel_also_pending",
        });
    }

    let resolved = if status == ExitStatusKind::Exited {
        natural_exit
    } else {
        terminate_group(pid, graceful_shutdown_s, exit_rx, &session_id, &execution_id).await
    };

    let (final_status, exit_code, signal_num) = classify(status, resolved);

    let grace = Duration::from_secs(graceful_shutdown_s.max(1));
    let mut stdout_task = stdout_task;
    let mut stderr_task = stderr_task;
    if tokio::time::timeout(grace, &mut stdout_task).await.is_err() {
        stdout_task.abort();
        warn!(session_id = %session_id, execution_id = %execution_id, "stdout drainer still running past grace window, cancelled");
    }
    if tokio::time::timeout(grace, &mut stderr_task).await.is_err() {
        stderr_task.abort();
        warn!(session_id = %session_id, execution_id = %execution_id, "stderr drainer still running past grace window, cancelled");
    }

    let (bytes_out, bytes_err, bytes_dropped) = budget.snapshot().await;
    let duration_s = start.elapsed().as_secs_f64();

    info!(
        session_id = %session_id,
        execution_id = %execution_id,
        status = final_status.as_str(),
        duration_s,
        bytes_out,
        bytes_err,
        bytes_dropped,
        "execution completed"
    );

    let _ = completion_tx.send(Completion {
        status: final_status,
        exit_code,
        signal: signal_num,
        bytes_out,
        bytes_err,
        bytes_dropped,
        duration_s,
        also_triggered,
    });
}

#[allow(clippy::cast_possible_wrap)]
fn pgid(pid: u32) -> i32 {
    pid as i32
}

fn classify(
    status: ExitStatusKind,
    resolved: Option<WaitResult>,
) -> (ExitStatusKind, Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    match resolved {
        Some(Ok(es)) => {
            if let Some(sig) = es.signal() {
                let effective = if status == ExitStatusKind::Exited {
                    ExitStatusKind::Signaled
                } else {
                    status
                };
                (effective, None, Some(sig))
            } else {
                let effective = if status == ExitStatusKind::Exited {
                    ExitStatusKind::Exited
                } else {
                    status
                };
                (effective, es.code(), None)
            }
        }
        Some(Err(_)) | None => {
            if status == ExitStatusKind::Exited {
                (ExitStatusKind::SpawnFailed, None, None)
            } else {
                (status, None, None)
            }
        }
    }
}

/// The termination protocol (spec.md §4.5), shared by TIMEOUT, STALLED,
/// CANCELLED, and Session-close cleanup:
///
/// 1. If the group leader is alive, SIGTERM the whole group (`-pgid`).
/// 2. Wait up to `graceful_shutdown_s` for `wait()` to resolve.
/// 3. If still alive, SIGKILL the group and wait a short bound again.
/// 4. If still alive after that, log a leak and return `None`.
///
/// Existence is checked (`kill(pid, None)`) before each signal to avoid
/// hitting a PID the OS has since recycled.
async fn terminate_group(
    pid: u32,
    graceful_shutdown_s: u64,
    mut exit_rx: oneshot::Receiver<WaitResult>,
    session_id: &str,
    execution_id: &str,
) -> Option<WaitResult> {
    let leader = Pid::from_raw(pgid(pid));
    let group = Pid::from_raw(-pgid(pid));

    if signal::kill(leader, None).is_ok() {
        let _ = signal::kill(group, Signal::SIGTERM);
    }
    if let Ok(result) = tokio::time::timeout(Duration::from_secs(graceful_shutdown_s), &mut exit_rx).await
    {
        return Some(result.unwrap_or_else(|_| Err(std::io::Error::other("wait task dropped"))));
    }

    warn!(session_id, execution_id, pid, "SIGTERM did not reap process group, escalating to SIGKILL");
    if signal::kill(leader, None).is_ok() {
        let _ = signal::kill(group, Signal::SIGKILL);
    }
    match tokio::time::timeout(Duration::from_secs(5), &mut exit_rx).await {
        Ok(result) => Some(result.unwrap_or_else(|_| Err(std::io::Error::other("wait task dropped")))),
        Err(_) => {
            warn!(session_id, execution_id, pid, "process group survived SIGKILL, marking leaked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exits_normally_and_reports_code() {
        let handle = spawn(
            "sh -c 'exit 7'",
            &HashMap::new(),
            Limits {
                total_timeout_s: 5.0,
                stall_timeout_s: 5.0,
                max_total_bytes: 1024,
                max_line_bytes: 256,
            },
            "s1".to_string(),
            "e1".to_string(),
            2,
        )
        .await
        .unwrap();

        let completion = handle.completion_rx.await.unwrap();
        assert_eq!(completion.status, ExitStatusKind::Exited);
        assert_eq!(completion.exit_code, Some(7));
    }

    #[tokio::test]
    async fn stalls_when_child_is_silent() {
        let handle = spawn(
            "sleep 5",
            &HashMap::new(),
            Limits {
                total_timeout_s: 30.0,
                stall_timeout_s: 0.2,
                max_total_bytes: 1024,
                max_line_bytes: 256,
            },
            "s1".to_string(),
            "e1".to_string(),
            2,
        )
        .await
        .unwrap();

        let completion = handle.completion_rx.await.unwrap();
        assert_eq!(completion.status, ExitStatusKind::Stalled);
    }

    #[tokio::test]
    async fn cancel_terminates_the_group() {
        let mut handle = spawn(
            "sleep 30",
            &HashMap::new(),
            Limits {
                total_timeout_s: 60.0,
                stall_timeout_s: 60.0,
                max_total_bytes: 1024,
                max_line_bytes: 256,
            },
            "s1".to_string(),
            "e1".to_string(),
            2,
        )
        .await
        .unwrap();

        handle.control_tx.send(ControlCommand::Cancel).await.unwrap();
        let completion = handle.completion_rx.await.unwrap();
        assert_eq!(completion.status, ExitStatusKind::Cancelled);
        assert!(signal::kill(Pid::from_raw(pgid(handle.pid)), None).is_err());
    }

    #[tokio::test]
    async fn sensitive_ambient_env_is_stripped_from_the_child() {
        // SAFETY: unique var name for this test, no other test reads/writes it.
        unsafe {
            std::env::set_var("CC_EXECUTOR_TEST_API_KEY", "leaked-secret");
        }

        let mut handle = spawn(
            "sh -c 'echo KEY=$CC_EXECUTOR_TEST_API_KEY'",
            &HashMap::new(),
            Limits {
                total_timeout_s: 5.0,
                stall_timeout_s: 5.0,
                max_total_bytes: 1024,
                max_line_bytes: 256,
            },
            "s1".to_string(),
            "e1".to_string(),
            2,
        )
        .await
        .unwrap();

        let mut lines = Vec::new();
        while let Some(ev) = handle.events_rx.recv().await {
            if let DrainEvent::Chunk { data, .. } = ev {
                lines.push(data);
            }
        }
        let completion = handle.completion_rx.await.unwrap();
        assert_eq!(completion.status, ExitStatusKind::Exited);

        unsafe {
            std::env::remove_var("CC_EXECUTOR_TEST_API_KEY");
        }

        assert!(
            lines.iter().any(|l| l.contains("KEY=")) && !lines.iter().any(|l| l.contains("leaked-secret")),
            "sensitive ambient env var leaked into child: {lines:?}"
        );
    }

    #[tokio::test]
    async fn invalid_command_fails_to_lex() {
        let result = spawn(
            "",
            &HashMap::new(),
            Limits {
                total_timeout_s: 5.0,
                stall_timeout_s: 5.0,
                max_total_bytes: 1024,
                max_line_bytes: 256,
            },
            "s1".to_string(),
            "e1".to_string(),
            2,
        )
        .await;
        assert!(result.is_err());
    }
}
