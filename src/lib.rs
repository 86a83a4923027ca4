//! Fleet command execution over SSH with durable job state.
//!
//! A job applies one command to a set of hosts under one policy. Each
//! (job, host) pair becomes a task; each execution try of a task is an
//! attempt, recorded durably so a restarted process resumes in-flight work
//! without losing or duplicating execution.

pub mod config;
pub mod error;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod summary;
