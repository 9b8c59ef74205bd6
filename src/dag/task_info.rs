// src/dag/task_info.rs

//! Per-execution state of a single task.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{GraphTaskStatus, TaskName};

/// Mutable bookkeeping for one task inside one graph execution.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub name: TaskName,
    /// Direct dependencies, copied from the graph for quick checks.
    pub deps: Vec<TaskName>,
    status: GraphTaskStatus,
    status_since: Instant,
    time_in_status: BTreeMap<GraphTaskStatus, Duration>,
}

impl TaskState {
    pub fn new(name: TaskName, deps: Vec<TaskName>) -> Self {
        Self {
            name,
            deps,
            status: GraphTaskStatus::Pending,
            status_since: Instant::now(),
            time_in_status: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> GraphTaskStatus {
        self.status
    }

    /// Move to `status`, accumulating the time spent in the previous one.
    ///
    /// Callers are responsible for checking that the move is legal.
    pub(crate) fn set_status(&mut self, status: GraphTaskStatus) {
        let now = Instant::now();
        let spent = now.saturating_duration_since(self.status_since);
        *self.time_in_status.entry(self.status).or_default() += spent;
        self.status = status;
        self.status_since = now;
    }

    /// Time accumulated per status so far (the current status is included up
    /// to now).
    pub fn timings(&self) -> BTreeMap<GraphTaskStatus, Duration> {
        let mut timings = self.time_in_status.clone();
        if !self.status.is_terminal() {
            *timings.entry(self.status).or_default() +=
                Instant::now().saturating_duration_since(self.status_since);
        }
        timings
    }
}

/// Whether a running task may move from `from` to `to`.
///
/// Statuses only move forward. The one exception is the restart loop of the
/// task runner, which may go back from `ExecutingTaskDescriptor` to
/// `WaitingForCore` when it needs a fresh core.
pub fn is_legal_transition(from: GraphTaskStatus, to: GraphTaskStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if from == GraphTaskStatus::ExecutingTaskDescriptor && to == GraphTaskStatus::WaitingForCore {
        return true;
    }
    to > from
}
