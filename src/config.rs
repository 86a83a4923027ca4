use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for failed attempts within a job.
///
/// Attempt `n` waits `base_backoff * growth_factor^(n-1)` (capped at
/// `max_backoff`, plus jitter) before becoming eligible for re-dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per task, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Multiplier applied per subsequent retry.
    pub growth_factor: f64,
    /// Ceiling on the computed delay.
    pub max_backoff: Duration,
    /// Fraction of the delay added/subtracted at random to avoid
    /// synchronized retry storms (0.0 disables jitter).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            growth_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter_ratio: 0.2,
        }
    }
}

/// Limits for the shared SSH session pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Cap on live connections across all hosts.
    pub max_sessions: usize,
    /// Cap on live connections to a single host.
    pub max_per_host: usize,
    /// TCP + handshake timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Idle handles older than this are evicted.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            // One command channel per host at a time; small sshd
            // MaxSessions limits are common on fleet targets.
            max_per_host: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Bounds on how much command output is stored inline per attempt.
///
/// Full byte lengths are always recorded; the text itself is truncated so
/// per-row cost in the store stays predictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub max_inline_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_inline_bytes: 64 * 1024,
        }
    }
}

/// Fully resolved runner configuration.
///
/// Config file and environment loading live outside this crate; everything
/// here arrives as already-resolved values and is passed in explicitly at
/// job submission rather than read from ambient state.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path to the SQLite state database.
    pub store_path: PathBuf,
    /// Concurrency budget used when a job does not specify its own.
    pub default_concurrency: usize,
    /// Per-task command timeout used when a job does not specify its own.
    pub default_timeout: Duration,
    pub default_retry: RetryPolicy,
    pub pool: PoolConfig,
    pub capture: CaptureConfig,
    /// Whether an attempt interrupted by a process crash consumes its slot
    /// in the retry budget. When false, recovery discards the orphaned
    /// attempt row and the retry is free.
    pub count_interrupted_attempts: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("fleetrun.db"),
            default_concurrency: 8,
            default_timeout: Duration::from_secs(300),
            default_retry: RetryPolicy::default(),
            pool: PoolConfig::default(),
            capture: CaptureConfig::default(),
            count_interrupted_attempts: true,
        }
    }
}
