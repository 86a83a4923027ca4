use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetryPolicy;

/// Aggregate status of a job, a pure function of its task statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyFailed => "partially_failed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "partially_failed" => Some(JobStatus::PartiallyFailed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one per-host task within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "dispatched" => Some(TaskStatus::Dispatched),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "retrying" => Some(TaskStatus::Retrying),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of one attempt.
///
/// `ConnectionLost` is distinguished from a plain non-zero exit because it
/// signals an indeterminate remote state: the command may or may not have
/// taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Succeeded,
    NonZeroExit,
    TimedOut,
    ConnectionLost,
    ConnectFailed,
    AuthRejected,
}

impl OutcomeKind {
    pub fn is_success(self) -> bool {
        matches!(self, OutcomeKind::Succeeded)
    }

    /// Retrying cannot change an authentication decision.
    pub fn is_fatal(self) -> bool {
        matches!(self, OutcomeKind::AuthRejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Succeeded => "succeeded",
            OutcomeKind::NonZeroExit => "non_zero_exit",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::ConnectionLost => "connection_lost",
            OutcomeKind::ConnectFailed => "connect_failed",
            OutcomeKind::AuthRejected => "auth_rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(OutcomeKind::Succeeded),
            "non_zero_exit" => Some(OutcomeKind::NonZeroExit),
            "timed_out" => Some(OutcomeKind::TimedOut),
            "connection_lost" => Some(OutcomeKind::ConnectionLost),
            "connect_failed" => Some(OutcomeKind::ConnectFailed),
            "auth_rejected" => Some(OutcomeKind::AuthRejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of submitted work: one command applied to a set of hosts under
/// one policy. Mutated only by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub status: JobStatus,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Per-task command timeout in milliseconds.
    pub timeout_ms: u64,
    /// Set by `cancel_job`; dispatch stops, in-flight outcomes still land.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The per-host unit of execution; exactly one per (job, host).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub host_id: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_outcome: Option<OutcomeKind>,
    pub last_error: Option<String>,
    /// When a retrying task becomes eligible for re-dispatch.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

/// One concrete execution try of a task. Append-only: a terminal attempt is
/// never mutated, a new attempt is created instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub task_id: Uuid,
    /// 1-based, monotonically increasing per task.
    pub seq: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<OutcomeKind>,
    pub exit_code: Option<i32>,
    /// Inline capture, truncated to the configured bound.
    pub stdout: String,
    pub stderr: String,
    /// True byte lengths before truncation.
    pub stdout_len: u64,
    pub stderr_len: u64,
    pub error: Option<String>,
}

impl Attempt {
    /// Combined stdout and stderr, stderr last.
    pub fn output(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.trim().is_empty() {
            parts.push(self.stdout.trim());
        }
        if !self.stderr.trim().is_empty() {
            parts.push(self.stderr.trim());
        }
        parts.join("\n")
    }
}

/// What the executor hands back for one finished attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub kind: OutcomeKind,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_len: u64,
    pub stderr_len: u64,
    pub error: Option<String>,
}

impl AttemptOutcome {
    pub fn failure(kind: OutcomeKind, error: String) -> Self {
        Self {
            kind,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_len: 0,
            stderr_len: 0,
            error: Some(error),
        }
    }
}

/// Next task status after an attempt outcome, per the retry policy.
///
/// `cancelled` reflects a job-level cancel observed before the outcome
/// landed: the attempt's true result is still honoured (a late success stays
/// `Succeeded`), but no further retries are scheduled.
pub fn next_task_status(
    outcome: OutcomeKind,
    attempt_count: u32,
    policy: &RetryPolicy,
    cancelled: bool,
) -> TaskStatus {
    if outcome.is_success() {
        return TaskStatus::Succeeded;
    }
    if cancelled {
        return TaskStatus::Cancelled;
    }
    if outcome.is_fatal() || attempt_count >= policy.max_attempts {
        return TaskStatus::Failed;
    }
    TaskStatus::Retrying
}

/// Aggregate job status from task statuses.
pub fn aggregate_status(tasks: &[TaskStatus]) -> JobStatus {
    if tasks.is_empty() {
        return JobStatus::Pending;
    }
    if tasks.iter().all(|s| *s == TaskStatus::Pending) {
        return JobStatus::Pending;
    }
    if tasks.iter().any(|s| !s.is_terminal()) {
        return JobStatus::Running;
    }

    let succeeded = tasks.iter().filter(|s| **s == TaskStatus::Succeeded).count();
    let cancelled = tasks.iter().filter(|s| **s == TaskStatus::Cancelled).count();

    if succeeded == tasks.len() {
        JobStatus::Completed
    } else if succeeded > 0 {
        JobStatus::PartiallyFailed
    } else if cancelled > 0 {
        JobStatus::Cancelled
    } else {
        JobStatus::Failed
    }
}
