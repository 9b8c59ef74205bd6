// src/engine/task_runner.rs

//! Per-task execution state machine.
//!
//! One call to [`run_task`] walks a single task through
//! `Starting → WaitingForFastLocalCore → ComputingTaskDescriptor →
//! WaitingForCore → ExecutingTaskDescriptor`, streams its output to the
//! client, restarts it on transient failures and always finishes with exactly
//! one `TaskCompleted` notice.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::{BlobSynchroniser, InputBlobHashes, ToolHash};
use crate::dag::{RemoteTaskDescriptor, StorageLayer, Task, TaskDescriptor, TaskDescriptorFactory, TaskKind};
use crate::engine::EngineOptions;
use crate::engine::instance::{GraphExecutionInstance, SchedulingBehaviour};
use crate::engine::responses::{JobResponse, OutputStream, ResponseSink, TaskCompletionStatus};
use crate::errors::{EngineError, Result};
use crate::exec::{AutoRecoveryPolicy, ExecuteTaskRequest, ProcessResponse};
use crate::pool::{WorkerCore, WorkerCoreInfo, WorkerCoreRequest, WorkerPool};
use crate::types::{CorePreference, GraphTaskStatus, TaskPhase};

/// Collaborators shared by every task of one graph execution.
pub struct TaskContext {
    pub instance: Arc<GraphExecutionInstance>,
    pub pool: Arc<WorkerPool>,
    pub descriptors: Arc<dyn TaskDescriptorFactory>,
    pub blobs: Arc<dyn BlobSynchroniser>,
    pub recovery: AutoRecoveryPolicy,
    pub options: EngineOptions,
    pub responses: ResponseSink,
}

impl TaskContext {
    /// Notices for a task that was cancelled before it ever started because
    /// something upstream failed.
    pub fn report_upstream_cancelled(&self, task: &Task) {
        self.report_not_started(task, "cancelled due to upstream failures");
    }

    /// Notices for a task that never ran: a `TaskStarted` without a worker
    /// followed by a cancelled `TaskCompleted`.
    pub fn report_not_started(&self, task: &Task, reason: &str) {
        self.responses.send(JobResponse::TaskStarted {
            task: task.name.clone(),
            caption: task.caption.clone(),
            worker: None,
        });
        self.responses.send(JobResponse::TaskCompleted {
            task: task.name.clone(),
            status: TaskCompletionStatus::Cancelled,
            exit_code: None,
            exception_message: Some(reason.to_string()),
            total_seconds: 0.0,
            status_seconds: seconds_by_status(&self.instance, &task.name),
        });
    }

    /// Give up on a scheduled task that will never run: record it as
    /// unsuccessful, report it, and report every dependent that gets
    /// cancelled as a result.
    pub fn abandon(&self, task: &Task, reason: &str) {
        let cancelled = match self
            .instance
            .finish_task(&task.name, false, SchedulingBehaviour::Enqueue)
        {
            Ok(outcome) => outcome.cancelled,
            Err(e) => {
                warn!(task = %task.name, error = %e, "failed to record abandoned task");
                Vec::new()
            }
        };

        self.report_not_started(task, reason);
        let graph = self.instance.graph();
        for name in &cancelled {
            if let Some(dependent) = graph.task(name) {
                self.report_upstream_cancelled(dependent);
            }
        }
    }
}

fn seconds_by_status(
    instance: &GraphExecutionInstance,
    task: &str,
) -> BTreeMap<GraphTaskStatus, f64> {
    instance
        .timings_of(task)
        .into_iter()
        .map(|(status, spent)| (status, spent.as_secs_f64()))
        .collect()
}

/// Run one task to completion and report it.
///
/// Returns whether the task completed successfully. Unexpected errors cancel
/// the whole graph.
pub async fn run_task(ctx: &TaskContext, task: &Arc<Task>) -> bool {
    let mut run = TaskRun::new(ctx, task);
    let outcome = run.execute().await;

    let cancelled = ctx.instance.cancellation().is_cancelled();
    let (status, exit_code, exception_message) = match outcome {
        Ok(0) => (TaskCompletionStatus::Success, Some(0), None),
        Ok(code) => (TaskCompletionStatus::Failure, Some(code), None),
        Err(e) if e.is_cancellation() || cancelled => (TaskCompletionStatus::Cancelled, None, None),
        Err(e) => (TaskCompletionStatus::Exception, None, Some(e.to_string())),
    };

    match status {
        TaskCompletionStatus::Success => info!(task = %task.name, "task succeeded"),
        TaskCompletionStatus::Failure => {
            warn!(task = %task.name, exit_code = ?exit_code, "task failed")
        }
        TaskCompletionStatus::Cancelled => info!(task = %task.name, "task cancelled"),
        TaskCompletionStatus::Exception => {
            let message = exception_message.as_deref().unwrap_or_default();
            warn!(task = %task.name, error = %message, "task raised an unexpected error");
            ctx.instance
                .cancel_with(format!("task '{}' failed unexpectedly: {message}", task.name));
        }
    }

    run.ensure_started(None);
    ctx.responses.send(JobResponse::TaskCompleted {
        task: task.name.clone(),
        status,
        exit_code,
        exception_message,
        total_seconds: run.started_at.elapsed().as_secs_f64(),
        status_seconds: seconds_by_status(&ctx.instance, &task.name),
    });

    status == TaskCompletionStatus::Success
}

/// Tracks the reporting-only execution phase of a task.
#[derive(Debug)]
struct PhaseTracker {
    current: TaskPhase,
    since: Instant,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: TaskPhase::Initial,
            since: Instant::now(),
        }
    }

    /// Move to `phase`; `metadata` describes the phase being left.
    fn transition(
        &mut self,
        task: &str,
        phase: TaskPhase,
        metadata: BTreeMap<String, String>,
    ) -> JobResponse {
        let now = Instant::now();
        let previous = std::mem::replace(&mut self.current, phase);
        let elapsed = now.saturating_duration_since(self.since);
        self.since = now;
        debug!(task = %task, ?previous, ?phase, elapsed_ms = elapsed.as_millis() as u64, "task phase change");
        JobResponse::TaskPhaseChange {
            task: task.to_string(),
            phase,
            previous_phase: previous,
            previous_phase_seconds: elapsed.as_secs_f64(),
            metadata,
        }
    }
}

/// Hashes needed before a task can run on a remote core.
struct RemotePreparation {
    tool: ToolHash,
    inputs: Option<InputBlobHashes>,
}

struct TaskRun<'a> {
    ctx: &'a TaskContext,
    task: &'a Arc<Task>,
    cancel: CancellationToken,
    phases: PhaseTracker,
    started: bool,
    started_at: Instant,
}

impl<'a> TaskRun<'a> {
    fn new(ctx: &'a TaskContext, task: &'a Arc<Task>) -> Self {
        Self {
            ctx,
            task,
            cancel: ctx.instance.cancellation().clone(),
            phases: PhaseTracker::new(),
            started: false,
            started_at: Instant::now(),
        }
    }

    fn advance(&self, status: GraphTaskStatus) {
        self.ctx.instance.advance(&self.task.name, status);
    }

    fn send(&self, response: JobResponse) {
        self.ctx.responses.send(response);
    }

    fn phase(&mut self, phase: TaskPhase, metadata: BTreeMap<String, String>) {
        let response = self.phases.transition(&self.task.name, phase, metadata);
        self.send(response);
    }

    /// Emit `TaskStarted` once.
    fn ensure_started(&mut self, worker: Option<WorkerCoreInfo>) {
        if self.started {
            return;
        }
        self.started = true;
        self.send(JobResponse::TaskStarted {
            task: self.task.name.clone(),
            caption: self.task.caption.clone(),
            worker,
        });
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    async fn execute(&mut self) -> Result<i32> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.advance(GraphTaskStatus::Starting);

        let local_core = match &self.task.kind {
            TaskKind::Describing => {
                self.advance(GraphTaskStatus::WaitingForFastLocalCore);
                self.try_fast_local_core().await?
            }
            TaskKind::FastExecutable | TaskKind::Executable(_) => None,
        };

        self.advance(GraphTaskStatus::ComputingTaskDescriptor);
        let descriptor = self.descriptor(local_core.is_some()).await?;

        self.execute_descriptor(&descriptor, local_core).await
    }

    /// Grab a local core if one frees up within the fast-local timeout.
    async fn try_fast_local_core(&self) -> Result<Option<WorkerCoreRequest>> {
        let mut request = self
            .ctx
            .pool
            .reserve_core(CorePreference::RequireLocal, self.cancel.child_token());

        let waited = tokio::time::timeout(
            self.ctx.options.fast_local_core_timeout,
            request.wait_for_core(),
        )
        .await
        .map(|res| res.map(|core| core.info().clone()));

        match waited {
            Ok(Ok(info)) => {
                debug!(task = %self.task.name, core = %info, "got fast local core");
                Ok(Some(request))
            }
            Ok(Err(_)) if self.cancel.is_cancelled() => Err(EngineError::Cancelled),
            Ok(Err(e)) => {
                debug!(task = %self.task.name, error = %e, "no fast local core available");
                Ok(None)
            }
            Err(_elapsed) => {
                debug!(task = %self.task.name, "fast local core timed out");
                Ok(None)
            }
        }
    }

    async fn descriptor(&self, can_run_locally: bool) -> Result<TaskDescriptor> {
        if let Some(descriptor) = self.task.cached_descriptor() {
            return Ok(descriptor.clone());
        }

        self.send(JobResponse::TaskPreparing {
            task: self.task.name.clone(),
        });
        let computed = self
            .cancellable(self.ctx.descriptors.create_descriptor_for_task_spec(
                &self.task.spec,
                can_run_locally,
                self.cancel.clone(),
            ))
            .await?;
        let descriptor = self.task.cache_descriptor(computed).clone();
        self.send(JobResponse::TaskPrepared {
            task: self.task.name.clone(),
        });
        Ok(descriptor)
    }

    /// Hash the tool and inputs concurrently, before any remote core is
    /// reserved.
    async fn prepare_remote(&self, remote: &RemoteTaskDescriptor) -> Result<RemotePreparation> {
        let blobs = &self.ctx.blobs;
        let hash_inputs = async {
            match remote.storage_layer {
                StorageLayer::TransferringBlobs => blobs
                    .hash_input_blobs(&remote.inputs, self.cancel.clone())
                    .await
                    .map(Some),
                StorageLayer::Shared => Ok(None),
            }
        };
        let (tool, inputs) = self
            .cancellable(async {
                tokio::try_join!(blobs.hash_tool(&remote.tool, self.cancel.clone()), hash_inputs)
            })
            .await?;
        Ok(RemotePreparation { tool, inputs })
    }

    async fn execute_descriptor(
        &mut self,
        descriptor: &TaskDescriptor,
        mut local_core: Option<WorkerCoreRequest>,
    ) -> Result<i32> {
        let (preference, preparation) = match descriptor {
            TaskDescriptor::Local(_) | TaskDescriptor::Copy(_) => (CorePreference::RequireLocal, None),
            TaskDescriptor::Remote(remote)
                if local_core.is_some() && remote.use_fast_local_execution =>
            {
                (CorePreference::RequireLocal, None)
            }
            TaskDescriptor::Remote(remote) => {
                // Release the fast local core so it can serve local-only work
                // while this task waits for remote capacity.
                local_core = None;
                (CorePreference::PreferRemote, Some(self.prepare_remote(remote).await?))
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut request = match local_core.take() {
                Some(request) => request,
                None => {
                    self.advance(GraphTaskStatus::WaitingForCore);
                    self.ctx.pool.reserve_core(preference, self.cancel.child_token())
                }
            };
            let core = request.wait_for_core().await?;

            self.advance(GraphTaskStatus::ExecutingTaskDescriptor);
            self.ensure_started(Some(core.info().clone()));
            info!(task = %self.task.name, core = %core.info(), attempt, "executing task");

            let result = self.execute_on_core(core, descriptor, preparation.as_ref()).await;

            let should_restart = match &result {
                Ok(code) if self.ctx.recovery.is_transient_exit(*code) => {
                    warn!(task = %self.task.name, exit_code = code, attempt, "transient exit code; restarting task");
                    true
                }
                Err(EngineError::Disconnected) => {
                    core.mark_dead();
                    warn!(task = %self.task.name, core = %core.info(), attempt, "worker disconnected; restarting task on a fresh core");
                    true
                }
                _ => false,
            };

            if !should_restart || self.cancel.is_cancelled() {
                return result;
            }
        }
    }

    async fn execute_on_core(
        &mut self,
        core: &mut WorkerCore,
        descriptor: &TaskDescriptor,
        preparation: Option<&RemotePreparation>,
    ) -> Result<i32> {
        let remote = match descriptor {
            TaskDescriptor::Remote(remote) if !core.is_local() => remote,
            TaskDescriptor::Remote(remote) => {
                let local = TaskDescriptor::Local(remote.to_local());
                self.phase(TaskPhase::TaskExecution, BTreeMap::new());
                return self.stream(core, self.request_for(local)).await;
            }
            TaskDescriptor::Local(_) | TaskDescriptor::Copy(_) => {
                self.phase(TaskPhase::TaskExecution, BTreeMap::new());
                return self.stream(core, self.request_for(descriptor.clone())).await;
            }
        };

        let preparation = preparation.ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!(
                "remote core reserved for task '{}' without preparing its tool",
                self.task.name
            ))
        })?;
        let blobs = Arc::clone(&self.ctx.blobs);
        let info = core.info().clone();

        self.phase(TaskPhase::RemoteToolSynchronisation, BTreeMap::new());
        let digest = self
            .cancellable(blobs.synchronise_tool_and_get_digest(&info, &preparation.tool, self.cancel.clone()))
            .await?;
        let mut metadata = BTreeMap::from([("tool_digest".to_string(), format!("{digest:016x}"))]);

        if let Some(inputs) = &preparation.inputs {
            self.phase(TaskPhase::RemoteInputBlobSynchronisation, metadata);
            let stats = self
                .cancellable(blobs.synchronise_input_blobs(&info, inputs, self.cancel.clone()))
                .await?;
            metadata = stats.metadata();
        }

        self.phase(TaskPhase::TaskExecution, metadata);
        let mut request = self.request_for(TaskDescriptor::Remote(remote.clone()));
        request.tool_digest = Some(digest);
        let exit_code = self.stream(core, request).await?;

        if remote.storage_layer == StorageLayer::TransferringBlobs && exit_code == 0 {
            self.phase(
                TaskPhase::RemoteOutputBlobSynchronisation,
                BTreeMap::from([("exit_code".to_string(), exit_code.to_string())]),
            );
            let stats = self
                .cancellable(blobs.synchronise_output_blobs(&info, &remote.outputs, self.cancel.clone()))
                .await?;
            debug!(task = %self.task.name, ?stats, "output blobs synchronised");
        }

        Ok(exit_code)
    }

    fn request_for(&self, descriptor: TaskDescriptor) -> ExecuteTaskRequest {
        let mut request = ExecuteTaskRequest::new(descriptor);
        request.auto_recover = self.ctx.recovery.patterns_for(&request.descriptor);
        request.ignore_lines = self.ctx.options.ignore_lines.clone();
        request
    }

    /// Send `request` and forward the response stream until the exit code.
    async fn stream(&self, core: &mut WorkerCore, request: ExecuteTaskRequest) -> Result<i32> {
        if let Err(e) = self.cancellable(core.send_execute(request)).await {
            if core.is_local() || e.is_cancellation() {
                return Err(e);
            }
            debug!(task = %self.task.name, error = %e, "sending execute request failed");
            return Err(EngineError::Disconnected);
        }

        loop {
            let response = self.cancellable(core.next_response()).await?;
            match response {
                Some(ProcessResponse::StandardOutputLine(line)) => self.send(JobResponse::TaskOutput {
                    task: self.task.name.clone(),
                    stream: OutputStream::Stdout,
                    line,
                }),
                Some(ProcessResponse::StandardErrorLine(line)) => self.send(JobResponse::TaskOutput {
                    task: self.task.name.clone(),
                    stream: OutputStream::Stderr,
                    line,
                }),
                Some(ProcessResponse::ExitCode(code)) => return Ok(code),
                None => return Err(EngineError::Disconnected),
            }
        }
    }
}
