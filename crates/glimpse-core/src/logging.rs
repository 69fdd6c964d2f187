//! Structured logging schema, field name constants, and subscriber setup.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log tooling can query by the same field names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention (breaker trip, scheduler bug) |
//! | WARN  | Recoverable issue, automatic fallback applied (task retry, permanent failure) |
//! | INFO  | Lifecycle events, concurrency adjustments, stale recoveries |
//! | DEBUG | Decision points, cycle summaries, config choices |
//! | TRACE | Per-item iteration (claims, lane picks) |

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "governor", "database", "jobs", "scheduler"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "semaphore", "tuner", "breaker", "pool", "tasks", "stage", "pipeline"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim", "fail", "recover_stale", "scan_due", "cycle", "finish_cycle"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Pipeline stage name.
pub const STAGE: &str = "stage";

/// Task row id.
pub const TASK_ID: &str = "task_id";

/// Capture batch id.
pub const SUBJECT_ID: &str = "subject_id";

/// Capability budget pool.
pub const CAPABILITY: &str = "capability";

/// Scheduler lane.
pub const LANE: &str = "lane";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempts consumed by a task.
pub const ATTEMPTS: &str = "attempts";

/// Rows touched by a statement.
pub const ROW_COUNT: &str = "row_count";

/// Concurrency limit after an adjustment.
pub const LIMIT: &str = "limit";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Why a scheduler was woken.
pub const REASON: &str = "reason";

// ─── Subscriber setup ──────────────────────────────────────────────────────

/// Output settings for [`init_tracing`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `"json"` or `"text"`.
    pub format: String,
    /// Optional log file; rotated daily.
    pub file: Option<String>,
    /// ANSI color override (auto-detected when `None`).
    pub ansi: Option<bool>,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            file: None,
            ansi: None,
            default_filter: "glimpse_core=info,glimpse_governor=info,glimpse_db=info,glimpse_jobs=info"
                .to_string(),
        }
    }
}

impl LogConfig {
    /// Read output settings from the environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LOG_FORMAT` | `text` | `json` or `text` |
    /// | `LOG_FILE` | unset | Path of a daily-rotated log file |
    /// | `LOG_ANSI` | auto | `true`/`false` override for ANSI colors |
    /// | `RUST_LOG` | crate-level `info` | Standard env filter |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            format: std::env::var("LOG_FORMAT").unwrap_or(defaults.format),
            file: std::env::var("LOG_FILE").ok(),
            ansi: std::env::var("LOG_ANSI")
                .ok()
                .map(|v| v == "true" || v == "1"),
            default_filter: defaults.default_filter,
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Install the global tracing subscriber.
///
/// Returns the file writer guard when file logging is enabled; keep it alive
/// for the lifetime of the process or buffered lines are lost. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);

    let init_err = |e: tracing_subscriber::util::TryInitError| {
        Error::Config(format!("failed to install tracing subscriber: {e}"))
    };

    if let Some(ref path) = config.file {
        let path = Path::new(path);
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("glimpse.log");
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if config.is_json() {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init()
                .map_err(init_err)?;
        } else {
            // No ANSI in files unless explicitly requested.
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(config.ansi.unwrap_or(false));
            registry.with(layer).try_init().map_err(init_err)?;
        }
        Ok(Some(guard))
    } else {
        if config.is_json() {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(init_err)?;
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = config.ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).try_init().map_err(init_err)?;
        }
        Ok(None)
    }
}
