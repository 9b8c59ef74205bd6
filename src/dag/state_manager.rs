// src/dag/state_manager.rs

//! Status transitions for the tasks of one graph execution.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::dag::graph::TaskDependencies;
use crate::dag::task_info::TaskState;
use crate::types::{GraphTaskStatus, TaskName};

/// Applies scheduling transitions to the status table.
pub struct StateManager<'a> {
    dependencies: &'a TaskDependencies,
    tasks: &'a mut HashMap<TaskName, TaskState>,
}

impl<'a> StateManager<'a> {
    pub fn new(
        dependencies: &'a TaskDependencies,
        tasks: &'a mut HashMap<TaskName, TaskState>,
    ) -> Self {
        Self {
            dependencies,
            tasks,
        }
    }

    /// Mark every `Pending` task without dependencies as `Scheduled`.
    pub fn schedule_roots(&mut self) -> Vec<TaskName> {
        let roots: Vec<TaskName> = self
            .tasks
            .values()
            .filter(|state| state.status() == GraphTaskStatus::Pending && state.deps.is_empty())
            .map(|state| state.name.clone())
            .collect();

        for name in &roots {
            if let Some(state) = self.tasks.get_mut(name) {
                state.set_status(GraphTaskStatus::Scheduled);
                debug!(task = %name, "root task scheduled");
            }
        }

        roots
    }

    /// Schedule every direct dependent of `finished` that is still `Pending`
    /// and whose dependencies have now all completed successfully.
    pub fn schedule_ready_dependents(&mut self, finished: &str) -> Vec<TaskName> {
        let dependencies = self.dependencies;
        let mut scheduled = Vec::new();

        // Check and transition one dependent at a time, so a dependent listed
        // twice is only scheduled on its first visit.
        for name in dependencies.what_depends_on_target(finished) {
            let ready = self.tasks.get(name.as_str()).is_some_and(|state| {
                state.status() == GraphTaskStatus::Pending
                    && ReadOnlyStateManager::new(&*self.tasks).deps_satisfied_for(state)
            });
            if !ready {
                continue;
            }
            if let Some(state) = self.tasks.get_mut(name.as_str()) {
                state.set_status(GraphTaskStatus::Scheduled);
                debug!(task = %name, after = %finished, "dependencies satisfied; task scheduled");
                scheduled.push(name.clone());
            }
        }

        scheduled
    }

    /// Mark every transitive dependent of `failed` that is still `Pending` as
    /// `CancelledDueToUpstreamFailures`.
    pub fn cancel_dependents(&mut self, failed: &str) -> Vec<TaskName> {
        let mut stack: Vec<TaskName> = self.dependencies.what_depends_on_target(failed).to_vec();
        let mut visited: HashSet<TaskName> = HashSet::new();
        let mut cancelled = Vec::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }

            match self.tasks.get_mut(&name) {
                Some(state) if state.status() == GraphTaskStatus::Pending => {
                    state.set_status(GraphTaskStatus::CancelledDueToUpstreamFailures);
                    debug!(task = %name, upstream = %failed, "cancelled due to upstream failure");
                    cancelled.push(name.clone());
                    stack.extend(self.dependencies.what_depends_on_target(&name).iter().cloned());
                }
                Some(_) => {
                    // Already terminal or cancelled through another path.
                }
                None => warn!(task = %name, "dependent missing from status table"),
            }
        }

        cancelled
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|state| state.status().is_terminal())
    }
}

/// Read-only view for checking dependency satisfaction.
pub struct ReadOnlyStateManager<'a> {
    tasks: &'a HashMap<TaskName, TaskState>,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(tasks: &'a HashMap<TaskName, TaskState>) -> Self {
        Self { tasks }
    }

    /// Whether every dependency of `state` completed successfully.
    pub fn deps_satisfied_for(&self, state: &TaskState) -> bool {
        state.deps.iter().all(|dep| match self.tasks.get(dep) {
            Some(dep_state) => dep_state.status() == GraphTaskStatus::CompletedSuccessfully,
            None => {
                warn!(task = %state.name, dep = %dep, "dependency missing from status table");
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::task::{Task, TaskKind, TaskSpec};

    #[test]
    fn dependent_listed_twice_is_scheduled_once() {
        let a = Task::new("a", TaskSpec::default(), TaskKind::Describing);
        let mut b = Task::new("b", TaskSpec::default(), TaskKind::Describing);
        b.dependencies = vec!["a".into(), "a".into()];
        let dependencies = TaskDependencies::from_tasks([&a, &b].into_iter());
        assert_eq!(dependencies.what_depends_on_target("a"), ["b", "b"]);

        let mut tasks: HashMap<TaskName, TaskState> = [&a, &b]
            .into_iter()
            .map(|t| (t.name.clone(), TaskState::new(t.name.clone(), t.dependencies.clone())))
            .collect();

        let mut manager = StateManager::new(&dependencies, &mut tasks);
        assert_eq!(manager.schedule_roots(), ["a"]);
        if let Some(state) = manager.tasks.get_mut("a") {
            state.set_status(GraphTaskStatus::CompletedSuccessfully);
        }
        assert_eq!(manager.schedule_ready_dependents("a"), ["b"]);
        assert_eq!(tasks["b"].status(), GraphTaskStatus::Scheduled);
    }
}
