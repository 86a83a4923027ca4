//! Reduces task outcomes into a job-level summary.
//!
//! Pure read over the state store with no side effects; safe to call while
//! the job is still running, in which case the view is partial.

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{JobStatus, OutcomeKind, TaskStatus};
use crate::store::StateStore;

/// Per-host detail in a job summary. `outcome` keeps the error
/// classification so "definitely failed" and "connection lost, remote state
/// unknown" stay distinguishable.
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub outcome: Option<OutcomeKind>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub command: String,
    pub status: JobStatus,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
    pub hosts: Vec<HostReport>,
}

/// Reduce all task outcomes belonging to `job_id` into a summary.
pub fn summarize(store: &StateStore, job_id: Uuid) -> Result<JobSummary> {
    let job = store.read_job(job_id)?;
    let tasks = store.list_tasks(job_id)?;

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    let mut cancelled = Vec::new();
    let mut hosts = Vec::with_capacity(tasks.len());

    for task in tasks {
        match task.status {
            TaskStatus::Succeeded => succeeded.push(task.host_id.clone()),
            TaskStatus::Failed => failed.push(task.host_id.clone()),
            TaskStatus::Cancelled => cancelled.push(task.host_id.clone()),
            _ => {}
        }

        let exit_code = store
            .list_attempts(task.id)?
            .iter()
            .rev()
            .find_map(|attempt| attempt.exit_code);

        hosts.push(HostReport {
            host_id: task.host_id,
            status: task.status,
            attempts: task.attempt_count,
            outcome: task.last_outcome,
            exit_code,
            error: task.last_error,
        });
    }

    Ok(JobSummary {
        job_id,
        command: job.command,
        status: job.status,
        succeeded,
        failed,
        cancelled,
        hosts,
    })
}
