//! Centralized default constants for the glimpse pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration types in [`crate::config`] start from these constants and
//! environment overrides are layered on top.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// GOVERNOR: CONCURRENCY
// =============================================================================

/// Base concurrent calls to the vision-language model.
pub const VLM_CONCURRENCY: usize = 2;

/// Base concurrent calls to the text model.
pub const TEXT_CONCURRENCY: usize = 4;

/// Base concurrent calls to the embedding model.
pub const EMBEDDING_CONCURRENCY: usize = 4;

/// Vision-language call timeout in seconds.
pub const VLM_TIMEOUT_SECS: u64 = 120;

/// Text model call timeout in seconds.
pub const TEXT_TIMEOUT_SECS: u64 = 60;

/// Embedding call timeout in seconds.
pub const EMBEDDING_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// GOVERNOR: ADAPTIVE TUNER (AIMD)
// =============================================================================

/// Whether adaptive concurrency control runs by default.
pub const TUNER_ENABLED: bool = true;

/// Outcomes retained in the sliding window.
pub const TUNER_WINDOW_SIZE: usize = 20;

/// Minimum samples before the failure rate is considered.
pub const TUNER_MIN_RATE_SAMPLES: usize = 5;

/// Failure ratio in the window that triggers a degrade.
pub const TUNER_FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Consecutive failures that trigger a degrade.
pub const TUNER_FAILURE_THRESHOLD: u32 = 2;

/// Minimum time between two adjustments, in milliseconds.
pub const TUNER_COOLDOWN_MS: u64 = 30_000;

/// Permits restored per recovery step.
pub const TUNER_RECOVERY_STEP: usize = 1;

/// Consecutive successes required before a recovery step.
pub const TUNER_RECOVERY_SUCCESS_THRESHOLD: u32 = 10;

/// Floor for the degraded limit.
pub const TUNER_MIN_CONCURRENCY: usize = 1;

// =============================================================================
// GOVERNOR: CIRCUIT BREAKER
// =============================================================================

/// Trailing window in which failures are counted, in milliseconds.
pub const BREAKER_WINDOW_MS: u64 = 10_000;

/// Failures within the window that trip the breaker.
pub const BREAKER_THRESHOLD: usize = 3;

// =============================================================================
// TASK RETRY
// =============================================================================

/// Attempts before a task becomes `failed_permanent`.
pub const TASK_MAX_ATTEMPTS: u32 = 5;

/// Backoff delays indexed by `attempts - 1`, in milliseconds.
/// The last entry repeats for any further attempts.
pub const TASK_BACKOFF_SCHEDULE_MS: [u64; 5] = [10_000, 30_000, 120_000, 300_000, 600_000];

/// Upper bound of the random jitter added to each backoff, in milliseconds.
pub const TASK_BACKOFF_JITTER_MS: u64 = 5_000;

// =============================================================================
// STAGE SCHEDULING
// =============================================================================

/// Polling interval when no retry is due, in milliseconds.
pub const STAGE_SCAN_INTERVAL_MS: u64 = 60_000;

/// Shortest delay between two cycles, in milliseconds.
pub const STAGE_MIN_DELAY_MS: u64 = 1_000;

/// Delay before a woken scheduler runs its cycle, in milliseconds.
pub const STAGE_SOON_DELAY_MS: u64 = 50;

/// Time after which a `running` row is considered abandoned, in milliseconds.
pub const STAGE_STALE_AFTER_MS: u64 = 300_000;

/// Maximum rows fetched per due scan.
pub const STAGE_SCAN_LIMIT: usize = 50;

/// Concurrent items dispatched per cycle.
pub const STAGE_CONCURRENCY: usize = 4;

/// Age under which a first-attempt row is treated as realtime work, in milliseconds.
pub const STAGE_REALTIME_WINDOW_MS: u64 = 120_000;

/// Realtime lane weight in the round-robin sequence.
pub const LANE_WEIGHT_REALTIME: u32 = 3;

/// Recovery lane weight in the round-robin sequence.
pub const LANE_WEIGHT_RECOVERY: u32 = 1;

// =============================================================================
// EVENT BUS
// =============================================================================

/// Buffer capacity for the broadcast event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum pooled SQLite connections.
pub const DB_MAX_CONNECTIONS: u32 = 4;

/// SQLite busy timeout in milliseconds.
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;
