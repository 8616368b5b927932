//! Timing Store (C2) — persistent key→duration-history map with TTL.
//!
//! Returns predicted total/stall budgets for a task fingerprint. Degrades
//! silently to `None`/no-op whenever the backing file can't be read or
//! written — per spec, transient I/O errors against this store are never
//! propagated to callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A predicted total/stall timeout pair derived from historical samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub predicted_total_s: f64,
    pub predicted_stall_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimingRecord {
    fingerprint: String,
    samples: Vec<f64>,
    last_updated: u64,
}

/// Key→duration-history store, optionally backed by a JSON file on disk.
pub struct TimingStore {
    records: Arc<RwLock<HashMap<String, TimingRecord>>>,
    path: Option<PathBuf>,
    ttl_s: u64,
    samples_cap: usize,
    stall_fraction: f64,
    min_stall_s: f64,
    max_stall_s: f64,
}

fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Normalize a command string for fingerprinting: strip volatile tokens
/// (anything that looks like a UUID, a long hex/decimal run, or an
/// ISO-ish timestamp) and truncate to a bounded length so near-identical
/// invocations collapse to the same fingerprint.
fn normalize_command(command: &str) -> String {
    let mut out = String::with_capacity(command.len().min(512));
    for token in command.split_whitespace() {
        let looks_volatile = token.len() >= 8
            && (token.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
                || token.chars().all(|c| c.is_ascii_digit()));
        if !out.is_empty() {
            out.push(' ');
        }
        if looks_volatile {
            out.push_str("<X>");
        } else {
            out.push_str(token);
        }
    }
    out.truncate(512);
    out
}

/// Compute the fingerprint used to key timing history: `hash(command_class,
/// normalized_command)`. `command_class` is the first whitespace token
/// (the executable name), so `curl https://a` and `curl https://b` share a
/// fingerprint class while remaining distinguishable via the normalized body.
pub fn fingerprint(command: &str) -> String {
    let command_class = command.split_whitespace().next().unwrap_or("");
    let normalized = normalize_command(command);
    let mut hasher = Sha256::new();
    hasher.update(command_class.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sort-and-index percentile, grounded on the teacher's
/// `TunnelStats::rtt_stats`: sort unstable, index at
/// `ceil(len * fraction)` clamped to `len - 1`.
fn percentile(samples: &[f64], fraction: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = sorted.len();
    if len == 0 {
        return 0.0;
    }
    let idx = ((len as f64) * fraction).ceil() as usize;
    sorted[idx.saturating_sub(1).min(len - 1)]
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

impl TimingStore {
    /// Construct a store. `path` is the optional on-disk JSON file
    /// (`timing_store_dsn` in config); when `None` the store is purely
    /// in-memory for the lifetime of the process.
    pub fn new(
        path: Option<PathBuf>,
        ttl_s: u64,
        samples_cap: usize,
        stall_fraction: f64,
        min_stall_s: f64,
        max_stall_s: f64,
    ) -> Self {
        TimingStore {
            records: Arc::new(RwLock::new(HashMap::new())),
            path,
            ttl_s,
            samples_cap,
            stall_fraction,
            min_stall_s,
            max_stall_s,
        }
    }

    /// Load any existing on-disk records. Failure (missing file, bad JSON)
    /// is logged and treated as "start empty" — never fatal.
    pub async fn load(&self) {
        let Some(path) = &self.path else { return };
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, TimingRecord>>(&bytes) {
                Ok(loaded) => {
                    let mut records = self.records.write().await;
                    *records = loaded;
                    debug!(count = records.len(), "loaded timing store");
                }
                Err(e) => warn!("timing store file is not valid JSON, starting empty: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to read timing store file, starting empty: {e}"),
        }
    }

    async fn persist(&self) {
        let Some(path) = &self.path else { return };
        let records = self.records.read().await;
        match serde_json::to_vec(&*records) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(path, bytes).await {
                    warn!("failed to persist timing store: {e}");
                }
            }
            Err(e) => warn!("failed to serialize timing store: {e}"),
        }
    }

    /// Record one completed execution's duration against its fingerprint.
    /// Fire-and-forget: I/O failures are logged, never returned.
    pub async fn record(&self, fingerprint: &str, duration_s: f64) {
        {
            let mut records = self.records.write().await;
            let entry = records
                .entry(fingerprint.to_string())
                .or_insert_with(|| TimingRecord {
                    fingerprint: fingerprint.to_string(),
                    samples: Vec::new(),
                    last_updated: now_s(),
                });
            entry.samples.push(duration_s);
            if entry.samples.len() > self.samples_cap {
                let excess = entry.samples.len() - self.samples_cap;
                entry.samples.drain(0..excess);
            }
            entry.last_updated = now_s();
        }
        self.evict_expired().await;
        self.persist().await;
    }

    async fn evict_expired(&self) {
        let cutoff = now_s().saturating_sub(self.ttl_s);
        let mut records = self.records.write().await;
        records.retain(|_, r| r.last_updated >= cutoff);
    }

    /// Look up a predicted total/stall estimate for a fingerprint.
    /// Returns `None` when no samples exist, following the same "degrade
    /// silently" policy as every other Timing Store operation.
    pub async fn lookup(&self, fingerprint: &str) -> Option<Estimate> {
        let records = self.records.read().await;
        let record = records.get(fingerprint)?;
        if record.samples.is_empty() {
            return None;
        }
        let predicted_total_s = if record.samples.len() >= 5 {
            percentile(&record.samples, 0.9)
        } else {
            mean(&record.samples)
        };
        let predicted_stall_s = (self.stall_fraction * predicted_total_s)
            .clamp(self.min_stall_s, self.max_stall_s);
        Some(Estimate {
            predicted_total_s,
            predicted_stall_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_matches_teacher_idiom_for_small_sets() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&samples, 0.9), 5.0);
        assert_eq!(percentile(&samples, 0.0), 1.0);
    }

    #[test]
    fn fingerprint_is_stable_and_strips_volatile_tokens() {
        let a = fingerprint("curl https://api/v1/jobs/11111111-2222-3333-4444-555555555555");
        let b = fingerprint("curl https://api/v1/jobs/99999999-aaaa-bbbb-cccc-dddddddddddd");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn lookup_returns_none_with_no_samples() {
        let store = TimingStore::new(None, 3600, 100, 0.3, 1.0, 600.0);
        assert!(store.lookup("nope").await.is_none());
    }

    #[tokio::test]
    async fn lookup_uses_mean_below_five_samples_and_percentile_at_or_above() {
        let store = TimingStore::new(None, 3600, 100, 0.3, 1.0, 600.0);
        let fp = "fp";
        for d in [1.0, 2.0, 3.0] {
            store.record(fp, d).await;
        }
        let est = store.lookup(fp).await.unwrap();
        assert!((est.predicted_total_s - 2.0).abs() < 1e-9);

        store.record(fp, 4.0).await;
        store.record(fp, 100.0).await;
        let est = store.lookup(fp).await.unwrap();
        assert_eq!(est.predicted_total_s, 100.0);
    }

    #[tokio::test]
    async fn persists_and_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.json");
        {
            let store = TimingStore::new(Some(path.clone()), 3600, 100, 0.3, 1.0, 600.0);
            store.record("fp", 5.0).await;
        }
        let reloaded = TimingStore::new(Some(path), 3600, 100, 0.3, 1.0, 600.0);
        reloaded.load().await;
        assert!(reloaded.lookup("fp").await.is_some());
    }
}
