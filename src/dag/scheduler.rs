use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dag::graph::Graph;
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::{ReadOnlyStateManager, StateManager};
use crate::dag::task_info::{TaskState, is_legal_transition};
use crate::errors::{EngineError, Result};
use crate::types::{GraphTaskStatus, TaskName};

/// Counts of tasks per status, used for end-of-job reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStatistics {
    pub total: usize,
    pub by_status: BTreeMap<GraphTaskStatus, usize>,
}

impl GraphStatistics {
    pub fn count(&self, status: GraphTaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Scheduler holds the immutable graph plus the mutable status table of one
/// graph execution.
///
/// It is responsible for:
/// - seeding the tasks that have no dependencies
/// - moving dependents to `Scheduled` once all their dependencies succeeded
/// - cancelling the transitive dependents of a failed task
/// - rejecting status moves that would go backwards
///
/// It is synchronous and performs no IO; the execution instance wraps it in
/// a mutex so each step is atomic.
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<Graph>,
    tasks: HashMap<TaskName, TaskState>,
}

impl Scheduler {
    pub fn new(graph: Arc<Graph>) -> Self {
        let tasks = graph
            .tasks()
            .map(|task| {
                (
                    task.name.clone(),
                    TaskState::new(task.name.clone(), task.dependencies.clone()),
                )
            })
            .collect();

        Self { graph, tasks }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Schedule every task without dependencies.
    ///
    /// Fails for an empty graph, and for a non-empty graph where nothing can
    /// be scheduled.
    pub fn seed(&mut self) -> Result<SchedulerStep> {
        if self.tasks.is_empty() {
            return Err(EngineError::EmptyGraph);
        }

        let mut manager = StateManager::new(self.graph.dependencies(), &mut self.tasks);
        let newly_scheduled = manager.schedule_roots();

        if newly_scheduled.is_empty() {
            return Err(EngineError::NoEntryPoint(self.tasks.len()));
        }

        info!(roots = newly_scheduled.len(), total = self.tasks.len(), "scheduler seeded");

        Ok(SchedulerStep {
            newly_scheduled,
            newly_cancelled: Vec::new(),
            all_terminal: false,
        })
    }

    /// Move a running task to an intermediate status.
    ///
    /// Returns `false` (and leaves the status alone) for an illegal move.
    pub fn advance(&mut self, task: &str, status: GraphTaskStatus) -> Result<bool> {
        let state = self
            .tasks
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.to_string()))?;

        let from = state.status();
        if from == status {
            return Ok(true);
        }
        if from == GraphTaskStatus::Pending || !is_legal_transition(from, status) {
            warn!(task = %task, from = %from, to = %status, "ignoring illegal status transition");
            return Ok(false);
        }

        state.set_status(status);
        Ok(true)
    }

    /// Record the terminal status of a task and schedule or cancel its
    /// dependents.
    ///
    /// `status` must be `CompletedSuccessfully` or `CompletedUnsuccessfully`.
    /// Finishing a task that is already terminal is a no-op.
    pub fn finish(&mut self, task: &str, status: GraphTaskStatus) -> Result<SchedulerStep> {
        if !matches!(
            status,
            GraphTaskStatus::CompletedSuccessfully | GraphTaskStatus::CompletedUnsuccessfully
        ) {
            return Err(EngineError::Other(anyhow::anyhow!(
                "task '{task}' cannot finish with status {status}"
            )));
        }

        let state = self
            .tasks
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.to_string()))?;

        let from = state.status();
        if from.is_terminal() {
            warn!(task = %task, status = %from, "task finished twice; ignoring");
            return Ok(SchedulerStep {
                all_terminal: self.all_terminal(),
                ..SchedulerStep::default()
            });
        }
        if from == GraphTaskStatus::Pending {
            return Err(EngineError::Other(anyhow::anyhow!(
                "task '{task}' finished without ever being scheduled"
            )));
        }

        state.set_status(status);

        let mut manager = StateManager::new(self.graph.dependencies(), &mut self.tasks);
        let (newly_scheduled, newly_cancelled) = match status {
            GraphTaskStatus::CompletedSuccessfully => {
                debug!(task = %task, "task completed successfully");
                (manager.schedule_ready_dependents(task), Vec::new())
            }
            _ => {
                let cancelled = manager.cancel_dependents(task);
                warn!(
                    task = %task,
                    cancelled = cancelled.len(),
                    "task failed; cancelling downstream tasks"
                );
                (Vec::new(), cancelled)
            }
        };
        let all_terminal = manager.all_tasks_terminal();

        Ok(SchedulerStep {
            newly_scheduled,
            newly_cancelled,
            all_terminal,
        })
    }

    pub fn status_of(&self, task: &str) -> Option<GraphTaskStatus> {
        self.tasks.get(task).map(|state| state.status())
    }

    /// Whether every dependency of `task` completed successfully.
    ///
    /// Returns `None` if the task is unknown.
    pub fn deps_satisfied(&self, task: &str) -> Option<bool> {
        let state = self.tasks.get(task)?;
        Some(ReadOnlyStateManager::new(&self.tasks).deps_satisfied_for(state))
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|state| state.status().is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks
            .values()
            .all(|state| state.status() == GraphTaskStatus::CompletedSuccessfully)
    }

    pub fn timings_of(&self, task: &str) -> BTreeMap<GraphTaskStatus, Duration> {
        self.tasks
            .get(task)
            .map(|state| state.timings())
            .unwrap_or_default()
    }

    /// Tasks that have been scheduled but not yet finished, sorted by name.
    pub fn unfinished(&self) -> Vec<(TaskName, GraphTaskStatus)> {
        let mut unfinished: Vec<_> = self
            .tasks
            .values()
            .filter(|state| {
                let status = state.status();
                status == GraphTaskStatus::Scheduled || status.is_in_flight()
            })
            .map(|state| (state.name.clone(), state.status()))
            .collect();
        unfinished.sort();
        unfinished
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut by_status = BTreeMap::new();
        for state in self.tasks.values() {
            *by_status.entry(state.status()).or_insert(0) += 1;
        }
        GraphStatistics {
            total: self.tasks.len(),
            by_status,
        }
    }
}
