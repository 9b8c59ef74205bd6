// src/engine/mod.rs

//! Graph execution engine for corefarm.
//!
//! This module ties together:
//! - the per-build execution instance (status table, ready-queue)
//! - the stall watchdog
//! - the per-task execution state machine
//! - the graph executor that spawns one concurrent execution per ready task
//!   and reports the final job result
//!
//! The scheduling semantics live in the synchronous [`crate::dag::Scheduler`];
//! [`instance`] wraps it for concurrent use and [`executor`] is the async
//! shell around it.

use std::time::Duration;

/// Tuning knobs for one graph execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Cancel the build if no task is seeded or finished for this long.
    pub stall_threshold: Duration,
    pub stall_check_interval: Duration,
    /// How long a describing task waits for a local core before computing
    /// its descriptor without one.
    pub fast_local_core_timeout: Duration,
    /// Output substrings whose lines are not forwarded to the client.
    pub ignore_lines: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            stall_threshold: Duration::from_secs(10 * 60),
            stall_check_interval: Duration::from_secs(30),
            fast_local_core_timeout: Duration::from_millis(250),
            ignore_lines: Vec::new(),
        }
    }
}

pub mod executor;
pub mod instance;
pub mod queue;
pub mod responses;
pub mod task_runner;
pub mod watchdog;

pub use executor::GraphExecutor;
pub use instance::{FinishOutcome, GraphExecutionInstance, SchedulingBehaviour};
pub use queue::ReadyQueue;
pub use responses::{
    JobCompletionStatus, JobResponse, OutputStream, ResponseSink, TaskCompletionStatus,
};
