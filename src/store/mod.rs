//! Durable record of jobs, tasks, and attempts.
//!
//! The store is the source of truth for recovery. Every transition write is
//! a single SQLite transaction: an attempt outcome, the resulting task
//! transition, and the job aggregate recompute land together, so a crash can
//! never leave a task marked dispatched with a terminal attempt, or an
//! attempt closed under a stale task status.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{FleetError, Result};
use crate::scheduler::backoff::delay_for_attempt;
use crate::scheduler::job::{
    aggregate_status, next_task_status, Attempt, AttemptOutcome, Job, JobStatus, OutcomeKind,
    Task, TaskStatus,
};

const SCHEMA_VERSION: i64 = 1;

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| FleetError::Internal(format!("corrupt id in store: {e}")))
}

fn parse_job_status(text: &str) -> Result<JobStatus> {
    JobStatus::parse(text)
        .ok_or_else(|| FleetError::Internal(format!("unknown job status in store: {text}")))
}

fn parse_task_status(text: &str) -> Result<TaskStatus> {
    TaskStatus::parse(text)
        .ok_or_else(|| FleetError::Internal(format!("unknown task status in store: {text}")))
}

/// SQLite-backed state store. One connection guarded by a mutex; writes are
/// brief and callers never hold external locks around it.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id               TEXT PRIMARY KEY,
                command          TEXT NOT NULL,
                status           TEXT NOT NULL,
                concurrency      INTEGER NOT NULL,
                max_attempts     INTEGER NOT NULL,
                base_backoff_ms  INTEGER NOT NULL,
                growth_factor    REAL NOT NULL,
                max_backoff_ms   INTEGER NOT NULL,
                jitter_ratio     REAL NOT NULL,
                timeout_ms       INTEGER NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at       INTEGER NOT NULL,
                completed_at     INTEGER
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id               TEXT PRIMARY KEY,
                job_id           TEXT NOT NULL REFERENCES jobs(id),
                host_id          TEXT NOT NULL,
                status           TEXT NOT NULL,
                attempt_count    INTEGER NOT NULL DEFAULT 0,
                last_outcome     TEXT,
                last_error       TEXT,
                next_eligible_at INTEGER,
                UNIQUE (job_id, host_id)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_job_status ON tasks (job_id, status);

            CREATE TABLE IF NOT EXISTS attempts (
                task_id     TEXT NOT NULL REFERENCES tasks(id),
                seq         INTEGER NOT NULL,
                started_at  INTEGER NOT NULL,
                finished_at INTEGER,
                outcome     TEXT,
                exit_code   INTEGER,
                stdout      TEXT NOT NULL DEFAULT '',
                stderr      TEXT NOT NULL DEFAULT '',
                stdout_len  INTEGER NOT NULL DEFAULT 0,
                stderr_len  INTEGER NOT NULL DEFAULT 0,
                error       TEXT,
                PRIMARY KEY (task_id, seq)
            );",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    // ===== Jobs =====

    fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
        conn.execute(
            "INSERT INTO jobs (id, command, status, concurrency, max_attempts,
                               base_backoff_ms, growth_factor, max_backoff_ms, jitter_ratio,
                               timeout_ms, cancel_requested, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id.to_string(),
                job.command,
                job.status.as_str(),
                job.concurrency as i64,
                job.retry.max_attempts as i64,
                job.retry.base_backoff.as_millis() as i64,
                job.retry.growth_factor,
                job.retry.max_backoff.as_millis() as i64,
                job.retry.jitter_ratio,
                job.timeout_ms as i64,
                job.cancel_requested as i64,
                ts(job.created_at),
                job.completed_at.map(ts),
            ],
        )?;
        Ok(())
    }

    fn insert_tasks(conn: &Connection, job_id: Uuid, host_ids: &[String]) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO tasks (id, job_id, host_id, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (job_id, host_id) DO NOTHING",
        )?;
        for host_id in host_ids {
            stmt.execute(params![
                Uuid::new_v4().to_string(),
                job_id.to_string(),
                host_id,
                TaskStatus::Pending.as_str(),
            ])?;
        }
        Ok(())
    }

    pub fn create_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Self::insert_job(&conn, job)
    }

    /// Expand a job into one task per host. Idempotent: the (job, host)
    /// uniqueness constraint makes re-expansion after a crash a no-op.
    pub fn create_tasks(&self, job_id: Uuid, host_ids: &[String]) -> Result<Vec<Task>> {
        {
            let conn = self.conn.lock().expect("store lock poisoned");
            Self::insert_tasks(&conn, job_id, host_ids)?;
        }
        self.list_tasks(job_id)
    }

    /// Create a job and its per-host tasks as one durable unit. A crash
    /// during submission can never leave a task-less job behind.
    pub fn create_job_with_tasks(&self, job: &Job, host_ids: &[String]) -> Result<Vec<Task>> {
        {
            let mut conn = self.conn.lock().expect("store lock poisoned");
            let tx = conn.transaction()?;
            Self::insert_job(&tx, job)?;
            Self::insert_tasks(&tx, job.id, host_ids)?;
            tx.commit()?;
        }
        self.list_tasks(job.id)
    }

    pub fn read_job(&self, job_id: Uuid) -> Result<Job> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Self::read_job_locked(&conn, job_id)
    }

    fn read_job_locked(conn: &Connection, job_id: Uuid) -> Result<Job> {
        let row = conn
            .query_row(
                "SELECT id, command, status, concurrency, max_attempts, base_backoff_ms,
                        growth_factor, max_backoff_ms, jitter_ratio, timeout_ms,
                        cancel_requested, created_at, completed_at
                 FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, i64>(11)?,
                        row.get::<_, Option<i64>>(12)?,
                    ))
                },
            )
            .optional()?
            .ok_or(FleetError::JobNotFound(job_id))?;

        Ok(Job {
            id: parse_uuid(&row.0)?,
            command: row.1,
            status: parse_job_status(&row.2)?,
            concurrency: row.3 as usize,
            retry: RetryPolicy {
                max_attempts: row.4 as u32,
                base_backoff: std::time::Duration::from_millis(row.5 as u64),
                growth_factor: row.6,
                max_backoff: std::time::Duration::from_millis(row.7 as u64),
                jitter_ratio: row.8,
            },
            timeout_ms: row.9 as u64,
            cancel_requested: row.10 != 0,
            created_at: from_ts(row.11),
            completed_at: row.12.map(from_ts),
        })
    }

    /// Jobs that have not reached a terminal aggregate status, oldest first.
    pub fn unfinished_jobs(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs WHERE status IN ('pending', 'running') ORDER BY created_at",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    // ===== Tasks =====

    const TASK_COLUMNS: &'static str =
        "id, job_id, host_id, status, attempt_count, last_outcome, last_error, next_eligible_at";

    fn collect_tasks(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| {
                Ok(Task {
                    id: parse_uuid(&row.0)?,
                    job_id: parse_uuid(&row.1)?,
                    host_id: row.2,
                    status: parse_task_status(&row.3)?,
                    attempt_count: row.4 as u32,
                    last_outcome: row.5.as_deref().and_then(OutcomeKind::parse),
                    last_error: row.6,
                    next_eligible_at: row.7.map(from_ts),
                })
            })
            .collect()
    }

    pub fn list_tasks(&self, job_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Self::collect_tasks(
            &conn,
            &format!(
                "SELECT {} FROM tasks WHERE job_id = ?1 ORDER BY rowid",
                Self::TASK_COLUMNS
            ),
            params![job_id.to_string()],
        )
    }

    /// Tasks eligible for dispatch right now: pending, or retrying with an
    /// elapsed backoff. First eligible first.
    pub fn ready_tasks(&self, job_id: Uuid, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Self::collect_tasks(
            &conn,
            &format!(
                "SELECT {} FROM tasks
                 WHERE job_id = ?1
                   AND (status = 'pending'
                        OR (status = 'retrying' AND next_eligible_at IS NOT NULL
                            AND next_eligible_at <= ?2))
                 ORDER BY COALESCE(next_eligible_at, 0), rowid
                 LIMIT ?3",
                Self::TASK_COLUMNS
            ),
            params![job_id.to_string(), ts(now), limit as i64],
        )
    }

    pub fn nonterminal_tasks(&self, job_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1
             AND status IN ('pending', 'dispatched', 'retrying')",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Earliest time a retrying task of this job becomes eligible.
    pub fn earliest_eligible(&self, job_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(next_eligible_at) FROM tasks
             WHERE job_id = ?1 AND status = 'retrying'",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(min.map(from_ts))
    }

    // ===== Attempts =====

    /// Open a new attempt for an eligible task. One transaction: the task
    /// moves to dispatched, its attempt count increments, and the attempt
    /// row appears together. Returns the 1-based attempt sequence number.
    pub fn record_attempt_start(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<u32> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let (job_id, status, attempt_count): (String, String, i64) = tx
            .query_row(
                "SELECT job_id, status, attempt_count FROM tasks WHERE id = ?1",
                params![task_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(FleetError::TaskNotFound(task_id))?;

        let status = parse_task_status(&status)?;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Retrying) {
            return Err(FleetError::Internal(format!(
                "task {task_id} not dispatchable from {status}"
            )));
        }

        let seq = attempt_count as u32 + 1;
        tx.execute(
            "UPDATE tasks SET status = 'dispatched', attempt_count = ?2, next_eligible_at = NULL
             WHERE id = ?1",
            params![task_id.to_string(), seq as i64],
        )?;
        tx.execute(
            "INSERT INTO attempts (task_id, seq, started_at) VALUES (?1, ?2, ?3)",
            params![task_id.to_string(), seq as i64, ts(now)],
        )?;
        tx.execute(
            "UPDATE jobs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![job_id],
        )?;

        tx.commit()?;
        Ok(seq)
    }

    /// Close an attempt and apply the resulting task and job transitions as
    /// one durable unit. Idempotent: closing an already-terminal attempt is
    /// a no-op that returns the task's current status.
    pub fn record_attempt_outcome(
        &self,
        task_id: Uuid,
        seq: u32,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let (job_id, task_status, attempt_count): (String, String, i64) = tx
            .query_row(
                "SELECT job_id, status, attempt_count FROM tasks WHERE id = ?1",
                params![task_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(FleetError::TaskNotFound(task_id))?;
        let job_id = parse_uuid(&job_id)?;

        let open: Option<bool> = tx
            .query_row(
                "SELECT finished_at IS NULL FROM attempts WHERE task_id = ?1 AND seq = ?2",
                params![task_id.to_string(), seq as i64],
                |row| row.get(0),
            )
            .optional()?;
        match open {
            None => {
                return Err(FleetError::Internal(format!(
                    "no attempt {seq} recorded for task {task_id}"
                )));
            }
            Some(false) => {
                // Already closed; terminal attempts are never mutated.
                return parse_task_status(&task_status);
            }
            Some(true) => {}
        }

        let job = Self::read_job_locked(&tx, job_id)?;

        tx.execute(
            "UPDATE attempts
             SET finished_at = ?3, outcome = ?4, exit_code = ?5,
                 stdout = ?6, stderr = ?7, stdout_len = ?8, stderr_len = ?9, error = ?10
             WHERE task_id = ?1 AND seq = ?2",
            params![
                task_id.to_string(),
                seq as i64,
                ts(now),
                outcome.kind.as_str(),
                outcome.exit_code,
                outcome.stdout,
                outcome.stderr,
                outcome.stdout_len as i64,
                outcome.stderr_len as i64,
                outcome.error,
            ],
        )?;

        let next = next_task_status(
            outcome.kind,
            attempt_count as u32,
            &job.retry,
            job.cancel_requested,
        );
        let next_eligible_at = if next == TaskStatus::Retrying {
            Some(ts(now + chrono::Duration::from_std(delay_for_attempt(&job.retry, attempt_count as u32))
                .unwrap_or_else(|_| chrono::Duration::zero())))
        } else {
            None
        };

        tx.execute(
            "UPDATE tasks
             SET status = ?2, last_outcome = ?3, last_error = ?4, next_eligible_at = ?5
             WHERE id = ?1",
            params![
                task_id.to_string(),
                next.as_str(),
                outcome.kind.as_str(),
                outcome.error,
                next_eligible_at,
            ],
        )?;

        Self::recompute_job_status(&tx, job_id, now)?;
        tx.commit()?;
        Ok(next)
    }

    pub fn list_attempts(&self, task_id: Uuid) -> Result<Vec<Attempt>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT seq, started_at, finished_at, outcome, exit_code,
                    stdout, stderr, stdout_len, stderr_len, error
             FROM attempts WHERE task_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                Ok(Attempt {
                    task_id,
                    seq: row.get::<_, i64>(0)? as u32,
                    started_at: from_ts(row.get::<_, i64>(1)?),
                    finished_at: row.get::<_, Option<i64>>(2)?.map(from_ts),
                    outcome: row
                        .get::<_, Option<String>>(3)?
                        .as_deref()
                        .and_then(OutcomeKind::parse),
                    exit_code: row.get(4)?,
                    stdout: row.get(5)?,
                    stderr: row.get(6)?,
                    stdout_len: row.get::<_, i64>(7)? as u64,
                    stderr_len: row.get::<_, i64>(8)? as u64,
                    error: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== Cancellation =====

    /// Request job cancellation: no further dispatch, waiting tasks move to
    /// cancelled. In-flight attempts keep running; their true outcomes are
    /// still recorded when they land.
    pub fn cancel_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE jobs SET cancel_requested = 1 WHERE id = ?1",
            params![job_id.to_string()],
        )?;
        if updated == 0 {
            return Err(FleetError::JobNotFound(job_id));
        }
        tx.execute(
            "UPDATE tasks SET status = 'cancelled', next_eligible_at = NULL
             WHERE job_id = ?1 AND status IN ('pending', 'retrying')",
            params![job_id.to_string()],
        )?;
        Self::recompute_job_status(&tx, job_id, now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        flag.map(|f| f != 0).ok_or(FleetError::JobNotFound(job_id))
    }

    // ===== Recovery =====

    /// Scan for tasks the previous process died while executing and make
    /// them dispatchable again. Returns the affected job ids.
    ///
    /// A dispatched task with an open attempt means the process was killed
    /// mid-run. When `count_interrupted` is set the open attempt is closed
    /// as `ConnectionLost` (remote state is unknown) and keeps its slot in
    /// the budget; otherwise the row is discarded and the retry is free.
    pub fn recover(&self, count_interrupted: bool, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let stranded: Vec<(String, String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, job_id, attempt_count FROM tasks WHERE status = 'dispatched'",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut affected: Vec<Uuid> = Vec::new();
        for (task_id, job_id, attempt_count) in stranded {
            let job_uuid = parse_uuid(&job_id)?;
            let job = Self::read_job_locked(&tx, job_uuid)?;

            let open: Option<bool> = tx
                .query_row(
                    "SELECT finished_at IS NULL FROM attempts WHERE task_id = ?1 AND seq = ?2",
                    params![task_id, attempt_count],
                    |row| row.get(0),
                )
                .optional()?;

            let (status, new_count, last_outcome, last_error) = match open {
                Some(true) if count_interrupted => {
                    tx.execute(
                        "UPDATE attempts SET finished_at = ?3, outcome = ?4, error = ?5
                         WHERE task_id = ?1 AND seq = ?2",
                        params![
                            task_id,
                            attempt_count,
                            ts(now),
                            OutcomeKind::ConnectionLost.as_str(),
                            "interrupted by process restart",
                        ],
                    )?;
                    let status = next_task_status(
                        OutcomeKind::ConnectionLost,
                        attempt_count as u32,
                        &job.retry,
                        job.cancel_requested,
                    );
                    (
                        status,
                        attempt_count,
                        Some(OutcomeKind::ConnectionLost),
                        Some("interrupted by process restart".to_string()),
                    )
                }
                Some(true) => {
                    // Orphaned attempt does not consume budget: drop the row
                    // and rewind the counter.
                    tx.execute(
                        "DELETE FROM attempts WHERE task_id = ?1 AND seq = ?2",
                        params![task_id, attempt_count],
                    )?;
                    let status = if job.cancel_requested {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Retrying
                    };
                    (status, attempt_count - 1, None, None)
                }
                Some(false) => {
                    // Outcome landed but the crash beat the task update.
                    // Should be impossible given transactional writes, but
                    // re-derive rather than strand the task. The attempt's
                    // own outcome and error carry over unchanged.
                    let (outcome, error): (Option<String>, Option<String>) = tx.query_row(
                        "SELECT outcome, error FROM attempts WHERE task_id = ?1 AND seq = ?2",
                        params![task_id, attempt_count],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    let kind = outcome
                        .as_deref()
                        .and_then(OutcomeKind::parse)
                        .unwrap_or(OutcomeKind::ConnectionLost);
                    let status = next_task_status(
                        kind,
                        attempt_count as u32,
                        &job.retry,
                        job.cancel_requested,
                    );
                    (status, attempt_count, Some(kind), error)
                }
                None => {
                    let status = if job.cancel_requested {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Retrying
                    };
                    (status, attempt_count, None, None)
                }
            };

            let next_eligible = if status == TaskStatus::Retrying {
                Some(ts(now))
            } else {
                None
            };
            tx.execute(
                "UPDATE tasks SET status = ?2, attempt_count = ?3, last_outcome = ?4,
                        last_error = ?5, next_eligible_at = ?6
                 WHERE id = ?1",
                params![
                    task_id,
                    status.as_str(),
                    new_count,
                    last_outcome.map(|k| k.as_str()),
                    last_error,
                    next_eligible,
                ],
            )?;

            if !affected.contains(&job_uuid) {
                affected.push(job_uuid);
            }
        }

        for job_id in &affected {
            Self::recompute_job_status(&tx, *job_id, now)?;
            tracing::info!(job_id = %job_id, "Recovered interrupted tasks");
        }
        tx.commit()?;
        Ok(affected)
    }

    // ===== Internals =====

    /// Rewrite the job's aggregate status from its task statuses. Runs
    /// inside every transition transaction.
    fn recompute_job_status(tx: &Transaction<'_>, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let statuses: Vec<TaskStatus> = {
            let mut stmt = tx.prepare("SELECT status FROM tasks WHERE job_id = ?1")?;
            let rows = stmt
                .query_map(params![job_id.to_string()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|s| parse_task_status(s))
                .collect::<Result<Vec<_>>>()?
        };

        let aggregate = aggregate_status(&statuses);
        if aggregate.is_terminal() {
            tx.execute(
                "UPDATE jobs SET status = ?2,
                        completed_at = COALESCE(completed_at, ?3)
                 WHERE id = ?1",
                params![job_id.to_string(), aggregate.as_str(), ts(now)],
            )?;
        } else {
            // A job revived by recovery is no longer complete.
            tx.execute(
                "UPDATE jobs SET status = ?2, completed_at = NULL WHERE id = ?1",
                params![job_id.to_string(), aggregate.as_str()],
            )?;
        }
        Ok(())
    }
}
