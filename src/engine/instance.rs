// src/engine/instance.rs

//! Per-build execution state.
//!
//! A [`GraphExecutionInstance`] wraps the synchronous [`Scheduler`] in a
//! mutex so that every "finish a task and schedule what became ready" step is
//! atomic, and owns the ready-queue the executor consumes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{Graph, GraphStatistics, Scheduler};
use crate::engine::queue::ReadyQueue;
use crate::errors::Result;
use crate::types::{GraphTaskStatus, TaskName};

/// What to do with dependents that become ready when a task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingBehaviour {
    /// Push every newly ready task onto the ready-queue.
    Enqueue,
    /// Hand the first newly ready task back to the caller to run directly;
    /// queue the rest.
    ContinueInline,
}

/// Result of [`GraphExecutionInstance::finish_task`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishOutcome {
    /// Task the caller should run next itself (only with `ContinueInline`).
    pub inline_next: Option<TaskName>,
    /// Pending tasks cancelled because this one failed.
    pub cancelled: Vec<TaskName>,
    pub all_terminal: bool,
}

pub struct GraphExecutionInstance {
    scheduler: Mutex<Scheduler>,
    queue: ReadyQueue,
    started: Instant,
    last_progress: Mutex<Instant>,
    cancel: CancellationToken,
    failure: Mutex<Option<String>>,
}

impl std::fmt::Debug for GraphExecutionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutionInstance")
            .field("queue", &self.queue)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl GraphExecutionInstance {
    /// `caller` is the client's cancellation token; the instance runs under
    /// a child of it so internal cancellation never propagates upwards.
    pub fn new(graph: Arc<Graph>, caller: &CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            scheduler: Mutex::new(Scheduler::new(graph)),
            queue: ReadyQueue::new(),
            started: now,
            last_progress: Mutex::new(now),
            cancel: caller.child_token(),
            failure: Mutex::new(None),
        }
    }

    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn graph(&self) -> Arc<Graph> {
        Arc::clone(self.scheduler().graph())
    }

    /// Build-wide token: fires on caller cancellation or internal
    /// cancellation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Schedule and enqueue every task without dependencies.
    pub fn seed(&self) -> Result<Vec<TaskName>> {
        let mut scheduler = self.scheduler();
        let step = scheduler.seed()?;
        for task in &step.newly_scheduled {
            self.queue.push(task.clone());
        }
        drop(scheduler);
        self.touch();
        Ok(step.newly_scheduled)
    }

    /// Move a running task to an intermediate status; illegal moves are
    /// ignored and reported as `false`.
    pub fn advance(&self, task: &str, status: GraphTaskStatus) -> bool {
        match self.scheduler().advance(task, status) {
            Ok(moved) => moved,
            Err(e) => {
                warn!(task = %task, error = %e, "cannot advance task");
                false
            }
        }
    }

    /// Record the outcome of a task and propagate it downstream.
    ///
    /// Runs under the instance mutex, so two tasks finishing concurrently can
    /// never both schedule the same dependent. Terminates the ready-queue
    /// once every task is terminal.
    pub fn finish_task(
        &self,
        task: &str,
        succeeded: bool,
        behaviour: SchedulingBehaviour,
    ) -> Result<FinishOutcome> {
        let status = if succeeded {
            GraphTaskStatus::CompletedSuccessfully
        } else {
            GraphTaskStatus::CompletedUnsuccessfully
        };

        let mut scheduler = self.scheduler();
        let step = scheduler.finish(task, status)?;

        let mut ready = step.newly_scheduled.into_iter();
        let inline_next = match behaviour {
            SchedulingBehaviour::ContinueInline => ready.next(),
            SchedulingBehaviour::Enqueue => None,
        };
        for next in ready {
            self.queue.push(next);
        }

        if step.all_terminal && self.queue.terminate() {
            info!("all tasks terminal; ready-queue terminated");
        }
        drop(scheduler);
        self.touch();

        debug!(task = %task, ?inline_next, cancelled = step.newly_cancelled.len(), "task finished");
        Ok(FinishOutcome {
            inline_next,
            cancelled: step.newly_cancelled,
            all_terminal: step.all_terminal,
        })
    }

    /// Cancel the whole build from inside. The first message is kept.
    ///
    /// Returns `true` if this call supplied the message.
    pub fn cancel_with(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let first = {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(message.clone());
                true
            } else {
                false
            }
        };
        if first {
            warn!(reason = %message, "cancelling build");
        }
        self.cancel.cancel();
        first
    }

    /// Cause of internal cancellation, if the build was cancelled from inside.
    pub fn failure_message(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn since_last_progress(&self) -> Duration {
        self.last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn status_of(&self, task: &str) -> Option<GraphTaskStatus> {
        self.scheduler().status_of(task)
    }

    pub fn all_terminal(&self) -> bool {
        self.scheduler().all_terminal()
    }

    pub fn all_succeeded(&self) -> bool {
        self.scheduler().all_succeeded()
    }

    pub fn unfinished(&self) -> Vec<(TaskName, GraphTaskStatus)> {
        self.scheduler().unfinished()
    }

    pub fn timings_of(&self, task: &str) -> BTreeMap<GraphTaskStatus, Duration> {
        self.scheduler().timings_of(task)
    }

    pub fn statistics(&self) -> GraphStatistics {
        self.scheduler().statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Task, TaskKind, TaskSpec};

    fn task(name: &str, deps: &[&str]) -> Task {
        deps.iter().fold(
            Task::new(name, TaskSpec::default(), TaskKind::FastExecutable),
            |t, d| t.after(*d),
        )
    }

    fn instance(tasks: Vec<Task>) -> GraphExecutionInstance {
        let graph = Arc::new(Graph::new(tasks).unwrap());
        GraphExecutionInstance::new(graph, &CancellationToken::new())
    }

    #[test]
    fn continue_inline_returns_first_ready_dependent() {
        let inst = instance(vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])]);
        assert_eq!(inst.seed().unwrap(), vec!["a".to_string()]);
        assert_eq!(inst.queue().len(), 1);

        let outcome = inst
            .finish_task("a", true, SchedulingBehaviour::ContinueInline)
            .unwrap();
        assert!(outcome.inline_next.is_some());
        // "a" is still in the queue from seeding, plus the other dependent.
        assert_eq!(inst.queue().len(), 2);
    }

    #[test]
    fn queue_terminates_when_everything_is_terminal() {
        let inst = instance(vec![task("a", &[]), task("b", &["a"])]);
        inst.seed().unwrap();

        let outcome = inst.finish_task("a", false, SchedulingBehaviour::Enqueue).unwrap();
        assert_eq!(outcome.cancelled, vec!["b".to_string()]);
        assert!(outcome.all_terminal);
        assert!(inst.queue().is_terminated());
        assert_eq!(
            inst.status_of("b"),
            Some(GraphTaskStatus::CancelledDueToUpstreamFailures)
        );
    }

    #[test]
    fn first_cancellation_message_wins() {
        let caller = CancellationToken::new();
        let graph = Arc::new(Graph::new(vec![task("a", &[])]).unwrap());
        let inst = GraphExecutionInstance::new(graph, &caller);

        assert!(inst.cancel_with("stalled"));
        assert!(!inst.cancel_with("later"));
        assert_eq!(inst.failure_message().as_deref(), Some("stalled"));
        assert!(inst.cancellation().is_cancelled());
        assert!(!caller.is_cancelled());
    }

    #[test]
    fn caller_cancellation_reaches_instance() {
        let caller = CancellationToken::new();
        let graph = Arc::new(Graph::new(vec![task("a", &[])]).unwrap());
        let inst = GraphExecutionInstance::new(graph, &caller);

        caller.cancel();
        assert!(inst.cancellation().is_cancelled());
        assert_eq!(inst.failure_message(), None);
    }
}
