//! State store transition tests: every attempt, task, and job write must
//! land atomically and be idempotent where the scheduler can replay it.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use fleetrun::config::RetryPolicy;
use fleetrun::error::FleetError;
use fleetrun::scheduler::job::AttemptOutcome;
use fleetrun::scheduler::{Job, JobStatus, OutcomeKind, TaskStatus};
use fleetrun::store::StateStore;

fn sample_job(command: &str, max_attempts: u32) -> Job {
    Job {
        id: Uuid::new_v4(),
        command: command.to_string(),
        status: JobStatus::Pending,
        concurrency: 4,
        retry: RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(10),
            growth_factor: 2.0,
            max_backoff: Duration::from_millis(100),
            jitter_ratio: 0.0,
        },
        timeout_ms: 5_000,
        cancel_requested: false,
        created_at: Utc::now(),
        completed_at: None,
    }
}

fn success() -> AttemptOutcome {
    AttemptOutcome {
        kind: OutcomeKind::Succeeded,
        exit_code: Some(0),
        stdout: "ok\n".to_string(),
        stderr: String::new(),
        stdout_len: 3,
        stderr_len: 0,
        error: None,
    }
}

fn nonzero_exit(code: i32) -> AttemptOutcome {
    AttemptOutcome {
        kind: OutcomeKind::NonZeroExit,
        exit_code: Some(code),
        stdout: String::new(),
        stderr: String::new(),
        stdout_len: 0,
        stderr_len: 0,
        error: Some(format!("exit code {code}")),
    }
}

#[test]
fn job_round_trips_with_policy() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 5);
    store.create_job(&job).unwrap();

    let read = store.read_job(job.id).unwrap();
    assert_eq!(read.command, "uptime");
    assert_eq!(read.status, JobStatus::Pending);
    assert_eq!(read.retry, job.retry);
    assert_eq!(read.timeout_ms, 5_000);
    assert!(!read.cancel_requested);
    assert!(read.completed_at.is_none());
}

#[test]
fn read_missing_job_is_not_found() {
    let store = StateStore::open_in_memory().unwrap();
    let err = store.read_job(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, FleetError::JobNotFound(_)));
}

#[test]
fn task_expansion_is_idempotent() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();

    let hosts = vec!["web-1".to_string(), "web-2".to_string()];
    let first = store.create_tasks(job.id, &hosts).unwrap();
    let second = store.create_tasks(job.id, &hosts).unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2, "re-expansion must not duplicate tasks");
    let first_ids: Vec<Uuid> = first.iter().map(|t| t.id).collect();
    let second_ids: Vec<Uuid> = second.iter().map(|t| t.id).collect();
    assert_eq!(first_ids, second_ids);
    assert!(first.iter().all(|t| t.status == TaskStatus::Pending));
}

#[test]
fn job_and_tasks_are_created_as_one_unit() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    let hosts = vec!["web-1".to_string(), "web-2".to_string()];

    let tasks = store.create_job_with_tasks(&job, &hosts).unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(store.read_job(job.id).unwrap().status, JobStatus::Pending);

    // A replay with the same job id fails on the job insert and the whole
    // write rolls back: its task rows must not land.
    let err = store
        .create_job_with_tasks(&job, &["web-3".to_string()])
        .unwrap_err();
    assert!(matches!(err, FleetError::Store(_)));
    let hosts: Vec<String> = store
        .list_tasks(job.id)
        .unwrap()
        .into_iter()
        .map(|t| t.host_id)
        .collect();
    assert_eq!(hosts, vec!["web-1", "web-2"]);
}

#[test]
fn attempt_start_moves_task_to_dispatched() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    assert_eq!(seq, 1);

    let task = &store.list_tasks(job.id).unwrap()[0];
    assert_eq!(task.status, TaskStatus::Dispatched);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(store.read_job(job.id).unwrap().status, JobStatus::Running);
}

#[test]
fn attempt_start_rejects_dispatched_task() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    let err = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap_err();
    assert!(matches!(err, FleetError::Internal(_)));

    // No second attempt row slipped through.
    assert_eq!(store.list_attempts(tasks[0].id).unwrap().len(), 1);
}

#[test]
fn success_outcome_completes_single_task_job() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    let status = store
        .record_attempt_outcome(tasks[0].id, seq, &success(), Utc::now())
        .unwrap();
    assert_eq!(status, TaskStatus::Succeeded);

    let job = store.read_job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());

    let attempt = &store.list_attempts(tasks[0].id).unwrap()[0];
    assert_eq!(attempt.outcome, Some(OutcomeKind::Succeeded));
    assert_eq!(attempt.stdout, "ok\n");
    assert!(attempt.finished_at.is_some());
}

#[test]
fn failure_below_budget_schedules_retry_with_backoff() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("deploy.sh", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    let now = Utc::now();
    let seq = store.record_attempt_start(tasks[0].id, now).unwrap();
    let status = store
        .record_attempt_outcome(tasks[0].id, seq, &nonzero_exit(1), now)
        .unwrap();
    assert_eq!(status, TaskStatus::Retrying);

    let task = &store.list_tasks(job.id).unwrap()[0];
    let eligible = task.next_eligible_at.expect("retrying task needs a wakeup time");
    assert!(eligible > now);

    // Not ready before the backoff elapses, ready after.
    assert!(store.ready_tasks(job.id, now, 10).unwrap().is_empty());
    let later = now + chrono::Duration::milliseconds(500);
    assert_eq!(store.ready_tasks(job.id, later, 10).unwrap().len(), 1);
    assert_eq!(store.earliest_eligible(job.id).unwrap(), Some(eligible));
}

#[test]
fn attempt_cap_is_exact() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("deploy.sh", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    for expected_seq in 1..=3 {
        let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
        assert_eq!(seq, expected_seq);
        store
            .record_attempt_outcome(tasks[0].id, seq, &nonzero_exit(1), Utc::now())
            .unwrap();
    }

    let task = &store.list_tasks(job.id).unwrap()[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(store.list_attempts(tasks[0].id).unwrap().len(), 3);
    assert_eq!(store.read_job(job.id).unwrap().status, JobStatus::Failed);

    // A fourth start must be rejected.
    let err = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap_err();
    assert!(matches!(err, FleetError::Internal(_)));
}

#[test]
fn outcome_write_is_idempotent() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    store
        .record_attempt_outcome(tasks[0].id, seq, &success(), Utc::now())
        .unwrap();

    // Replay with a different result: the closed attempt must not change.
    let status = store
        .record_attempt_outcome(tasks[0].id, seq, &nonzero_exit(1), Utc::now())
        .unwrap();
    assert_eq!(status, TaskStatus::Succeeded);

    let attempts = store.list_attempts(tasks[0].id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, Some(OutcomeKind::Succeeded));
}

#[test]
fn cancel_cancels_waiting_tasks_and_keeps_late_success() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();
    let tasks = store
        .create_tasks(job.id, &["web-1".to_string(), "web-2".to_string()])
        .unwrap();

    // web-1 is in flight; web-2 is still waiting.
    let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    store.cancel_job(job.id, Utc::now()).unwrap();
    assert!(store.cancel_requested(job.id).unwrap());

    let listed = store.list_tasks(job.id).unwrap();
    assert_eq!(listed[0].status, TaskStatus::Dispatched);
    assert_eq!(listed[1].status, TaskStatus::Cancelled);

    // The in-flight attempt lands after the cancel; its success stands.
    let status = store
        .record_attempt_outcome(tasks[0].id, seq, &success(), Utc::now())
        .unwrap();
    assert_eq!(status, TaskStatus::Succeeded);
    assert_eq!(
        store.read_job(job.id).unwrap().status,
        JobStatus::PartiallyFailed
    );
}

#[test]
fn cancel_after_failure_does_not_retry() {
    let store = StateStore::open_in_memory().unwrap();
    let job = sample_job("uptime", 3);
    store.create_job(&job).unwrap();
    let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();

    let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    store.cancel_job(job.id, Utc::now()).unwrap();

    let status = store
        .record_attempt_outcome(tasks[0].id, seq, &nonzero_exit(1), Utc::now())
        .unwrap();
    assert_eq!(status, TaskStatus::Cancelled);
    assert_eq!(store.read_job(job.id).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn cancel_unknown_job_is_not_found() {
    let store = StateStore::open_in_memory().unwrap();
    let err = store.cancel_job(Uuid::new_v4(), Utc::now()).unwrap_err();
    assert!(matches!(err, FleetError::JobNotFound(_)));
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    let job = sample_job("uptime", 3);
    {
        let store = StateStore::open(&path).unwrap();
        store.create_job(&job).unwrap();
        let tasks = store.create_tasks(job.id, &["web-1".to_string()]).unwrap();
        store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    assert_eq!(store.read_job(job.id).unwrap().command, "uptime");
    let tasks = store.list_tasks(job.id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Dispatched);
    assert_eq!(store.list_attempts(tasks[0].id).unwrap().len(), 1);
}

#[test]
fn unfinished_jobs_excludes_terminal() {
    let store = StateStore::open_in_memory().unwrap();

    let done = sample_job("uptime", 3);
    store.create_job(&done).unwrap();
    let tasks = store.create_tasks(done.id, &["web-1".to_string()]).unwrap();
    let seq = store.record_attempt_start(tasks[0].id, Utc::now()).unwrap();
    store
        .record_attempt_outcome(tasks[0].id, seq, &success(), Utc::now())
        .unwrap();

    let open = sample_job("deploy.sh", 3);
    store.create_job(&open).unwrap();
    store.create_tasks(open.id, &["web-1".to_string()]).unwrap();

    assert_eq!(store.unfinished_jobs().unwrap(), vec![open.id]);
}
