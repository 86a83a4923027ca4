//! Runs one command on one host using a pooled session.
//!
//! The SSH library's calls block, so each attempt executes on a blocking
//! worker; the scheduler's bounded worker set supplies the parallelism.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CaptureConfig;
use crate::error::FleetError;
use crate::scheduler::job::{AttemptOutcome, OutcomeKind};
use crate::session::transport::{ExecError, ExecOutput};
use crate::session::SessionPool;

/// Truncate raw output at the inline bound, keeping the true length.
fn capture(bytes: Vec<u8>, max_inline: usize) -> (String, u64) {
    let len = bytes.len() as u64;
    let cut = if bytes.len() > max_inline {
        &bytes[..max_inline]
    } else {
        &bytes[..]
    };
    (String::from_utf8_lossy(cut).into_owned(), len)
}

pub struct TaskExecutor {
    pool: std::sync::Arc<SessionPool>,
    capture: CaptureConfig,
}

impl TaskExecutor {
    pub fn new(pool: std::sync::Arc<SessionPool>, capture: CaptureConfig) -> Self {
        Self { pool, capture }
    }

    /// Execute `command` on `host_id` and classify the result.
    ///
    /// Any outcome other than a clean command completion (zero or non-zero
    /// exit) marks the session unhealthy before release, so a broken
    /// connection is never handed to the next attempt.
    pub async fn run(
        &self,
        host_id: &str,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        // Cancellation is cooperative: checked before the remote command
        // starts. Once it is running we wait for its true outcome.
        if cancel.is_cancelled() {
            return AttemptOutcome::failure(
                OutcomeKind::ConnectFailed,
                "cancelled before dispatch".to_string(),
            );
        }

        let handle = match self.pool.acquire(host_id, cancel).await {
            Ok(handle) => handle,
            Err(e) => return Self::classify_acquire_error(e),
        };

        let (host, mut session) = handle.into_parts();
        let command = command.to_string();
        let exec = tokio::task::spawn_blocking(move || {
            let result = session.exec(&command, timeout);
            (session, result)
        })
        .await;

        let (session, result) = match exec {
            Ok(pair) => pair,
            Err(e) => {
                // The blocking worker panicked; the session is gone with it.
                tracing::error!(host = %host, error = %e, "Attempt worker panicked");
                return AttemptOutcome::failure(
                    OutcomeKind::ConnectionLost,
                    format!("execution worker failed: {e}"),
                );
            }
        };

        let (outcome, healthy) = self.classify_exec(result);
        self.pool
            .release(crate::session::SessionHandle::from_parts(host, session), healthy);
        outcome
    }

    /// Connectivity probe: runs a trivial command and reports reachability.
    pub async fn probe(
        &self,
        host_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        self.run(host_id, "true", timeout, cancel).await
    }

    fn classify_acquire_error(err: FleetError) -> AttemptOutcome {
        let kind = if err.is_fatal_auth() {
            OutcomeKind::AuthRejected
        } else {
            OutcomeKind::ConnectFailed
        };
        AttemptOutcome::failure(kind, err.to_string())
    }

    fn classify_exec(
        &self,
        result: std::result::Result<ExecOutput, ExecError>,
    ) -> (AttemptOutcome, bool) {
        match result {
            Ok(output) => {
                let ExecOutput {
                    exit_code,
                    stdout,
                    stderr,
                } = output;
                let (stdout, stdout_len) = capture(stdout, self.capture.max_inline_bytes);
                let (stderr, stderr_len) = capture(stderr, self.capture.max_inline_bytes);
                let (kind, error) = if exit_code == 0 {
                    (OutcomeKind::Succeeded, None)
                } else {
                    (
                        OutcomeKind::NonZeroExit,
                        Some(format!("exit code {exit_code}")),
                    )
                };
                (
                    AttemptOutcome {
                        kind,
                        exit_code: Some(exit_code),
                        stdout,
                        stderr,
                        stdout_len,
                        stderr_len,
                        error,
                    },
                    true,
                )
            }
            Err(ExecError::TimedOut) => (
                AttemptOutcome::failure(OutcomeKind::TimedOut, "command timed out".to_string()),
                false,
            ),
            Err(ExecError::ConnectionLost(detail)) => (
                AttemptOutcome::failure(OutcomeKind::ConnectionLost, detail),
                false,
            ),
        }
    }
}
