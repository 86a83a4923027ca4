//! Job lifecycle: data model, backoff policy, and the dispatch loop.

pub mod backoff;
pub mod job;
pub mod runner;

pub use job::{Job, JobStatus, OutcomeKind, Task, TaskStatus};
pub use runner::{JobScheduler, JobSpec};
