use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RetryPolicy, RunnerConfig};
use crate::error::{FleetError, Result};
use crate::executor::TaskExecutor;
use crate::registry::HostRegistry;
use crate::scheduler::job::{AttemptOutcome, Job, JobStatus, TaskStatus};
use crate::store::StateStore;

/// What a caller submits: one command, a host set, and policy overrides.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub command: String,
    pub hosts: Vec<String>,
    pub concurrency: Option<usize>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

/// Drives job lifecycle: expands jobs into tasks, dispatches ready tasks to
/// the executor under the concurrency budget, applies retry policy, and
/// writes every transition through the state store.
pub struct JobScheduler {
    store: StateStore,
    executor: Arc<TaskExecutor>,
    registry: Arc<HostRegistry>,
    config: RunnerConfig,
}

impl JobScheduler {
    pub fn new(
        store: StateStore,
        executor: Arc<TaskExecutor>,
        registry: Arc<HostRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Create the job and its per-host task rows. Hosts are validated
    /// against the registry up front so a typo fails the submission, not a
    /// task three retries later.
    pub fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        if spec.hosts.is_empty() {
            return Err(FleetError::Internal("job has no target hosts".to_string()));
        }
        for host_id in &spec.hosts {
            self.registry.resolve(host_id)?;
        }

        let job = Job {
            id: Uuid::new_v4(),
            command: spec.command,
            status: JobStatus::Pending,
            concurrency: spec.concurrency.unwrap_or(self.config.default_concurrency),
            retry: spec.retry.unwrap_or(self.config.default_retry),
            timeout_ms: spec
                .timeout
                .unwrap_or(self.config.default_timeout)
                .as_millis() as u64,
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        };
        let tasks = self.store.create_job_with_tasks(&job, &spec.hosts)?;

        tracing::info!(
            job_id = %job.id,
            hosts = tasks.len(),
            concurrency = job.concurrency,
            "Job submitted"
        );
        Ok(job.id)
    }

    /// Request cancellation: no further dispatch for this job; waiting tasks
    /// become cancelled; in-flight attempts are asked to stop but their true
    /// outcomes are still recorded.
    pub fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.store.cancel_job(job_id, Utc::now())?;
        tracing::info!(job_id = %job_id, "Job cancellation requested");
        Ok(())
    }

    /// Reset tasks stranded in dispatched by a previous process death, then
    /// return the jobs that still need driving.
    pub fn recover(&self) -> Result<Vec<Uuid>> {
        self.store
            .recover(self.config.count_interrupted_attempts, Utc::now())?;
        self.store.unfinished_jobs()
    }

    /// Drive `job_id` until every task reaches a terminal state or the job
    /// is cancelled. Safe to call on an already-terminal job.
    pub async fn run(&self, job_id: Uuid, cancel: &CancellationToken) -> Result<Job> {
        let job = self.store.read_job(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let timeout = Duration::from_millis(job.timeout_ms);
        let budget = Arc::new(Semaphore::new(job.concurrency.max(1)));
        let mut inflight: JoinSet<(Uuid, u32, AttemptOutcome)> = JoinSet::new();
        // Child token so a store-side cancel of this job does not tear down
        // the caller's shutdown token (shared across jobs).
        let job_token = cancel.child_token();
        let mut cancel_applied = false;

        loop {
            let cancel_wanted =
                job_token.is_cancelled() || self.store.cancel_requested(job_id)?;
            if cancel_wanted && !cancel_applied {
                self.store.cancel_job(job_id, Utc::now())?;
                job_token.cancel();
                cancel_applied = true;
                tracing::info!(job_id = %job_id, "Dispatch stopped, draining in-flight attempts");
            }

            if !cancel_applied {
                if let Err(e) = self.dispatch_ready(job_id, timeout, &budget, &job_token, &mut inflight) {
                    // A store hiccup aborts this scheduling cycle; the next
                    // iteration retries rather than dropping the job.
                    tracing::warn!(job_id = %job_id, error = %e, "Dispatch cycle aborted");
                }
            }

            if inflight.is_empty() {
                if self.store.nonterminal_tasks(job_id)? == 0 {
                    break;
                }
                if cancel_applied {
                    // Cancelled with nothing in flight: remaining tasks were
                    // already marked cancelled above.
                    break;
                }
                // Only backoff timers remain; sleep until the earliest one.
                let wait = self.time_until_eligible(job_id)?;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = job_token.cancelled() => {}
                }
                continue;
            }

            tokio::select! {
                joined = inflight.join_next() => {
                    match joined {
                        Some(Ok((task_id, seq, outcome))) => {
                            self.record_outcome(task_id, seq, &outcome).await?;
                        }
                        Some(Err(e)) => {
                            // The attempt future itself failed; the task is
                            // left dispatched and the recovery scan will
                            // reset it.
                            tracing::error!(job_id = %job_id, error = %e, "Attempt task aborted");
                        }
                        None => {}
                    }
                }
                _ = job_token.cancelled(), if !cancel_applied => {}
                _ = tokio::time::sleep(Duration::from_millis(200)), if !cancel_applied => {
                    // Wake periodically so elapsed backoffs dispatch even
                    // while other attempts are still running.
                }
            }
        }

        let job = self.store.read_job(job_id)?;
        tracing::info!(job_id = %job_id, status = %job.status, "Job finished driving");
        Ok(job)
    }

    /// Start attempts for every ready task that fits in the budget.
    fn dispatch_ready(
        &self,
        job_id: Uuid,
        timeout: Duration,
        budget: &Arc<Semaphore>,
        job_token: &CancellationToken,
        inflight: &mut JoinSet<(Uuid, u32, AttemptOutcome)>,
    ) -> Result<()> {
        let free = budget.available_permits();
        if free == 0 {
            return Ok(());
        }

        let job = self.store.read_job(job_id)?;
        let ready = self.store.ready_tasks(job_id, Utc::now(), free)?;
        for task in ready {
            let seq = match self.store.record_attempt_start(task.id, Utc::now()) {
                Ok(seq) => seq,
                Err(FleetError::Internal(detail)) => {
                    // Lost a race with cancellation; skip.
                    tracing::debug!(task_id = %task.id, detail, "Task no longer dispatchable");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let permit = Arc::clone(budget)
                .try_acquire_owned()
                .map_err(|_| FleetError::Internal("concurrency budget exhausted".to_string()))?;
            let executor = Arc::clone(&self.executor);
            let command = job.command.clone();
            let token = job_token.clone();
            let task_id = task.id;
            let host_id = task.host_id.clone();

            tracing::debug!(
                job_id = %job_id,
                task_id = %task_id,
                host = %host_id,
                attempt = seq,
                "Dispatching attempt"
            );
            inflight.spawn(async move {
                let outcome = executor.run(&host_id, &command, timeout, &token).await;
                drop(permit);
                (task_id, seq, outcome)
            });
        }
        Ok(())
    }

    /// Record an attempt outcome, retrying transient store errors; a job
    /// transition is not considered committed until the store confirms it.
    async fn record_outcome(
        &self,
        task_id: Uuid,
        seq: u32,
        outcome: &AttemptOutcome,
    ) -> Result<TaskStatus> {
        let mut delay = Duration::from_millis(50);
        for _ in 0..3 {
            match self
                .store
                .record_attempt_outcome(task_id, seq, outcome, Utc::now())
            {
                Ok(status) => {
                    tracing::info!(
                        task_id = %task_id,
                        attempt = seq,
                        outcome = %outcome.kind,
                        status = %status,
                        "Attempt recorded"
                    );
                    return Ok(status);
                }
                Err(FleetError::Store(e)) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Store write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        self.store
            .record_attempt_outcome(task_id, seq, outcome, Utc::now())
    }

    fn time_until_eligible(&self, job_id: Uuid) -> Result<Duration> {
        let fallback = Duration::from_millis(200);
        let Some(eligible_at) = self.store.earliest_eligible(job_id)? else {
            return Ok(fallback);
        };
        let wait = (eligible_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Ok(wait.max(Duration::from_millis(10)).min(Duration::from_secs(5)))
    }
}
