// src/dag/scheduler_step.rs

//! Step-by-step result types for the scheduler.

use crate::types::TaskName;

/// Structured result of a single scheduler "step" (seeding or finishing a
/// task).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Tasks that moved to `Scheduled` as a result of this step.
    pub newly_scheduled: Vec<TaskName>,
    /// Tasks that moved to `CancelledDueToUpstreamFailures` in this step.
    pub newly_cancelled: Vec<TaskName>,
    /// Whether every task is now terminal.
    pub all_terminal: bool,
}
