// src/engine/executor.rs

//! Drives one graph execution from seeding to the final job result.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::blob::BlobSynchroniser;
use crate::dag::{Graph, TaskDescriptorFactory};
use crate::engine::EngineOptions;
use crate::engine::instance::{GraphExecutionInstance, SchedulingBehaviour};
use crate::engine::responses::{JobCompletionStatus, JobResponse, ResponseSink};
use crate::engine::task_runner::{TaskContext, run_task};
use crate::engine::watchdog::run_stall_watchdog;
use crate::errors::{EngineError, Result};
use crate::exec::AutoRecoveryPolicy;
use crate::pool::WorkerPool;
use crate::types::TaskName;

const NOT_STARTED_REASON: &str = "build cancelled before the task started";

/// Executes task graphs against a worker pool.
pub struct GraphExecutor {
    pool: Arc<WorkerPool>,
    descriptors: Arc<dyn TaskDescriptorFactory>,
    blobs: Arc<dyn BlobSynchroniser>,
    recovery: AutoRecoveryPolicy,
    options: EngineOptions,
}

impl GraphExecutor {
    pub fn new(
        pool: Arc<WorkerPool>,
        descriptors: Arc<dyn TaskDescriptorFactory>,
        blobs: Arc<dyn BlobSynchroniser>,
    ) -> Self {
        Self {
            pool,
            descriptors,
            blobs,
            recovery: AutoRecoveryPolicy::default(),
            options: EngineOptions::default(),
        }
    }

    pub fn with_recovery(mut self, recovery: AutoRecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `graph` to completion, streaming progress to `responses`.
    ///
    /// Fails before anything is sent for an empty graph or one without an
    /// entry point. Otherwise the last response is always `JobComplete`,
    /// whose status is also returned.
    pub async fn execute(
        &self,
        graph: Arc<Graph>,
        responses: ResponseSink,
        caller: CancellationToken,
    ) -> Result<JobCompletionStatus> {
        if graph.is_empty() {
            return Err(EngineError::EmptyGraph);
        }

        let instance = Arc::new(GraphExecutionInstance::new(Arc::clone(&graph), &caller));
        let roots = instance.seed()?;
        info!(tasks = graph.len(), roots = roots.len(), "starting graph execution");
        responses.send(JobResponse::JobParsed {
            total_tasks: graph.len(),
        });

        let watchdog = tokio::spawn(run_stall_watchdog(
            Arc::clone(&instance),
            self.options.stall_threshold,
            self.options.stall_check_interval,
        ));

        let ctx = Arc::new(TaskContext {
            instance: Arc::clone(&instance),
            pool: Arc::clone(&self.pool),
            descriptors: Arc::clone(&self.descriptors),
            blobs: Arc::clone(&self.blobs),
            recovery: self.recovery.clone(),
            options: self.options.clone(),
            responses: responses.clone(),
        });

        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                next = instance.queue().dequeue(instance.cancellation()) => match next {
                    Ok(Some(task)) => {
                        debug!(task = %task, "dequeued ready task");
                        running.spawn(run_chain(Arc::clone(&ctx), task));
                    }
                    Ok(None) => {
                        debug!("ready-queue terminated");
                        break;
                    }
                    Err(_) => {
                        info!("graph execution cancelled; waiting for running tasks");
                        break;
                    }
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "task execution aborted");
                        instance.cancel_with(format!("task execution aborted: {e}"));
                    }
                }
            }
        }

        // Every in-flight task reports before the job result does.
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task execution aborted while draining");
            }
        }
        watchdog.abort();

        // Ready tasks nobody picked up before cancellation still get their
        // started/completed pair, and so do their pending dependents.
        for name in instance.queue().drain() {
            if let Some(task) = graph.task(&name) {
                ctx.abandon(task, NOT_STARTED_REASON);
            }
        }

        let (status, exception_message) = if caller.is_cancelled() {
            (JobCompletionStatus::Cancelled, None)
        } else if let Some(message) = instance.failure_message() {
            (JobCompletionStatus::Failure, Some(message))
        } else if instance.all_succeeded() {
            (JobCompletionStatus::Success, None)
        } else {
            (JobCompletionStatus::Failure, None)
        };

        let statistics = instance.statistics();
        info!(?status, elapsed_ms = instance.elapsed().as_millis() as u64, "graph execution complete");
        responses.send(JobResponse::JobComplete {
            status,
            total_seconds: instance.elapsed().as_secs_f64(),
            exception_message,
            statistics,
        });

        Ok(status)
    }
}

/// Run `first`, then keep running whichever dependent its completion made
/// ready, without a round trip through the ready-queue.
async fn run_chain(ctx: Arc<TaskContext>, first: TaskName) {
    let graph = ctx.instance.graph();
    let mut next = Some(first);

    while let Some(name) = next.take() {
        let Some(task) = graph.task(&name) else {
            ctx.instance.cancel_with(format!("ready task '{name}' is not part of the graph"));
            return;
        };

        let succeeded = run_task(&ctx, task).await;

        match ctx
            .instance
            .finish_task(&name, succeeded, SchedulingBehaviour::ContinueInline)
        {
            Ok(outcome) => {
                for cancelled in &outcome.cancelled {
                    if let Some(task) = graph.task(cancelled) {
                        ctx.report_upstream_cancelled(task);
                    }
                }
                next = outcome.inline_next;
            }
            Err(e) => {
                ctx.instance
                    .cancel_with(format!("failed to record completion of '{name}': {e}"));
                return;
            }
        }

        if ctx.instance.cancellation().is_cancelled() {
            if let Some(skipped) = next.take() {
                debug!(task = %skipped, "build cancelled; not starting inline task");
                if let Some(task) = graph.task(&skipped) {
                    ctx.abandon(task, NOT_STARTED_REASON);
                }
            }
        }
    }
}
