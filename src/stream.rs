//! Stream Drainer (C4) — concurrent, bounded, back-pressured draining of a
//! child's stdout/stderr into framed output chunks.
//!
//! Grounded on the teacher's `shell/process.rs::read_capped` (keep draining
//! past the cap instead of closing the pipe early, to avoid SIGPIPE/deadlock
//! when the child is still writing to the other stream) and
//! `sessions/buffer.rs`'s sequenced-entry shape, generalized from an
//! unbounded ring buffer to a per-execution line framer with `truncated` /
//! `bytes_dropped` accounting (spec.md §4.4).

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};

/// Which child stream an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One event emitted by a drain task: either a framed output chunk or the
/// one-time signal that the shared `max_total_bytes` budget was just
/// exceeded. A sibling variant rather than a side channel, since both share
/// the same per-stream ordering the Session relies on (spec.md §5: no
/// notification for an execution follows `execution_completed`, but
/// `output_limit_reached` must still land before it).
#[derive(Debug, Clone)]
pub enum DrainEvent {
    /// One framed chunk of output, ready to become an `output_chunk` notification.
    Chunk {
        stream: StreamKind,
        /// Monotonically increasing, per-stream sequence number.
        seq: u64,
        data: String,
        /// Set when this chunk hit `max_line_bytes` without seeing a newline.
        truncated: bool,
    },
    /// `bytes_out + bytes_err` just exceeded `max_total_bytes` for the first
    /// time this execution — emitted at most once, per spec.md §4.4/§8.
    OutputLimitReached,
}

struct BudgetState {
    max_total_bytes: usize,
    bytes_out: u64,
    bytes_err: u64,
    bytes_dropped: u64,
    warned: bool,
}

/// Shared, per-execution accounting of combined stdout+stderr bytes against
/// `max_total_bytes`. Owned exclusively by one Supervisor; the two drain
/// tasks of a single execution share it, which is the only place this crate
/// puts a lock between concurrently running tasks of the *same* execution.
pub struct OutputBudget(Mutex<BudgetState>);

impl OutputBudget {
    pub fn new(max_total_bytes: usize) -> Self {
        OutputBudget(Mutex::new(BudgetState {
            max_total_bytes,
            bytes_out: 0,
            bytes_err: 0,
            bytes_dropped: 0,
            warned: false,
        }))
    }

    /// Reserve space for `len` bytes belonging to `kind`. Returns
    /// `(bytes_to_keep, just_exceeded)`: `bytes_to_keep <= len`, and
    /// `just_exceeded` is true at most once across the execution's lifetime —
    /// the caller uses it to emit exactly one `output_limit_reached` warning.
    async fn reserve(&self, kind: StreamKind, len: usize) -> (usize, bool) {
        let mut state = self.0.lock().await;
        let used = (state.bytes_out + state.bytes_err) as usize;
        let remaining = state.max_total_bytes.saturating_sub(used);
        let keep = len.min(remaining);
        let dropped = len - keep;
        match kind {
            StreamKind::Stdout => state.bytes_out += keep as u64,
            StreamKind::Stderr => state.bytes_err += keep as u64,
        }
        state.bytes_dropped += dropped as u64;
        let just_exceeded = dropped > 0 && !state.warned;
        if just_exceeded {
            state.warned = true;
        }
        (keep, just_exceeded)
    }

    /// Account bytes read from the stream but discarded without ever being
    /// offered to `reserve` — the newline-resync gap after an over-long
    /// line. These never compete for the total-bytes budget, but still left
    /// the pipe without reaching the client, so they belong in
    /// `bytes_dropped` for an accurate completion record (spec.md §3).
    async fn record_resync_drop(&self, len: usize) {
        if len == 0 {
            return;
        }
        let mut state = self.0.lock().await;
        state.bytes_dropped += len as u64;
    }

    /// Final `(bytes_out, bytes_err, bytes_dropped)` for the completion record.
    pub async fn snapshot(&self) -> (u64, u64, u64) {
        let s = self.0.lock().await;
        (s.bytes_out, s.bytes_err, s.bytes_dropped)
    }
}

const READ_CHUNK: usize = 8192;

/// Drain one child stream into framed [`DrainEvent`]s, emitted on `tx`.
///
/// A "line" is bytes up to and including `\n`, or `max_line_bytes` bytes if no
/// newline is seen first — in the latter case the partial line is emitted
/// with `truncated=true` and the drainer discards bytes until the next
/// newline before resuming normal framing, per spec.md §4.4.
///
/// Bytes beyond the shared `budget`'s cap are accounted as dropped and never
/// reach `tx`; `activity` is notified once per emitted chunk so the
/// Supervisor's stall timer can reset on it without needing to inspect chunk
/// contents.
///
/// Returns when the stream reaches EOF. Completes independently of the
/// child's `wait()` — the caller must never serialize this behind `wait()`,
/// to avoid the classic pipe-buffer deadlock on large output.
pub async fn drain_stream<R>(
    kind: StreamKind,
    mut reader: R,
    max_line_bytes: usize,
    budget: Arc<OutputBudget>,
    tx: mpsc::Sender<DrainEvent>,
    activity: Arc<tokio::sync::Notify>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line_buf: Vec<u8> = Vec::with_capacity(max_line_bytes.min(4096));
    let mut resync = false;
    let mut seq: u64 = 0;
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut read_buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut chunk = &read_buf[..n];

        while !chunk.is_empty() {
            if resync {
                match chunk.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        budget.record_resync_drop(pos + 1).await;
                        chunk = &chunk[pos + 1..];
                        resync = false;
                    }
                    None => {
                        budget.record_resync_drop(chunk.len()).await;
                        break;
                    }
                }
                continue;
            }

            if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                line_buf.extend_from_slice(&chunk[..=pos]);
                chunk = &chunk[pos + 1..];
                seq += 1;
                emit(kind, seq, &line_buf, false, &budget, &tx, &activity).await;
                line_buf.clear();
                continue;
            }

            let space_left = max_line_bytes.saturating_sub(line_buf.len());
            if chunk.len() <= space_left {
                line_buf.extend_from_slice(chunk);
                chunk = &[];
            } else {
                line_buf.extend_from_slice(&chunk[..space_left]);
                chunk = &chunk[space_left..];
                seq += 1;
                emit(kind, seq, &line_buf, true, &budget, &tx, &activity).await;
                line_buf.clear();
                resync = true;
            }
        }
    }

    // EOF with a trailing partial line (no newline ever arrived) — still a
    // real chunk, not truncated, just never newline-terminated.
    if !line_buf.is_empty() && !resync {
        seq += 1;
        emit(kind, seq, &line_buf, false, &budget, &tx, &activity).await;
    }
}

async fn emit(
    kind: StreamKind,
    seq: u64,
    raw: &[u8],
    truncated: bool,
    budget: &Arc<OutputBudget>,
    tx: &mpsc::Sender<DrainEvent>,
    activity: &Arc<tokio::sync::Notify>,
) {
    let (keep, just_exceeded) = budget.reserve(kind, raw.len()).await;
    if just_exceeded {
        let _ = tx.send(DrainEvent::OutputLimitReached).await;
    }
    if keep == 0 {
        // Entirely dropped: still counts toward bytes_dropped via `reserve`,
        // but there is nothing left to forward.
        return;
    }
    let data = String::from_utf8_lossy(&raw[..keep]).into_owned();
    if tx
        .send(DrainEvent::Chunk {
            stream: kind,
            seq,
            data,
            truncated,
        })
        .await
        .is_ok()
    {
        activity.notify_one();
    }
}
