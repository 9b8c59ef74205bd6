// src/exec/manager.rs

//! Worker-side execution manager.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{RemoteTaskDescriptor, TaskDescriptor};
use crate::errors::{EngineError, Result};
use crate::exec::copy::execute_copy;
use crate::exec::process::{ProcessExecutor, ProcessSpec};
use crate::exec::protocol::{ExecuteTaskRequest, ProcessResponse, ResponseSequence};
use crate::exec::recovery::{STATUS_DLL_INIT_FAILED, TransientExitPredicate, transient_exit_codes};

const ATTEMPT_CHANNEL_CAPACITY: usize = 64;

/// Why an attempt is being thrown away and run again.
#[derive(Debug)]
enum RestartReason {
    OutputMatched(String),
    TransientExitCode(i32),
}

/// Dispatches execute requests to the local-process, copy or remote executor
/// and applies output-based auto-recovery and transient exit-code retries.
///
/// Guarantees towards the caller's sink: at most one exit code, nothing after
/// it, and nothing at all from attempts that were restarted after their
/// recovery trigger.
pub struct ExecutionManager {
    processes: Arc<dyn ProcessExecutor>,
    tool_cache_dir: PathBuf,
    transient_exit: TransientExitPredicate,
}

impl ExecutionManager {
    pub fn new(processes: Arc<dyn ProcessExecutor>, tool_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            processes,
            tool_cache_dir: tool_cache_dir.into(),
            transient_exit: transient_exit_codes(vec![STATUS_DLL_INIT_FAILED]),
        }
    }

    pub fn with_transient_exit(mut self, transient_exit: TransientExitPredicate) -> Self {
        self.transient_exit = transient_exit;
        self
    }

    /// Execute `request`, forwarding responses to `sink`.
    ///
    /// Restarts are invisible to the caller: lines produced before a restart
    /// trigger are forwarded, the trigger line and everything after it in
    /// that attempt are dropped.
    pub async fn execute(
        &self,
        request: &ExecuteTaskRequest,
        sink: mpsc::Sender<ProcessResponse>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut attempt_number: u32 = 0;

        loop {
            attempt_number += 1;
            let attempt = cancel.child_token();
            let (tx, rx) = mpsc::channel(ATTEMPT_CHANNEL_CAPACITY);

            let producer = self.dispatch(request, tx, attempt.clone());
            let consumer = async {
                let consumed = self.consume_attempt(request, rx, &sink, &attempt).await;
                if consumed.is_err() {
                    attempt.cancel();
                }
                consumed
            };
            let (produced, consumed) = tokio::join!(producer, consumer);

            let (exit_code, restart) = consumed?;

            if let Some(reason) = restart {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                info!(attempt = attempt_number, ?reason, "auto-recovery triggered; restarting execution");
                continue;
            }

            if let Err(e) = produced {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                return Err(e);
            }

            return match exit_code {
                Some(code) => {
                    debug!(attempt = attempt_number, exit_code = code, "execution finished");
                    Ok(())
                }
                None if cancel.is_cancelled() => Err(EngineError::Cancelled),
                None => Err(EngineError::ProtocolViolation(
                    "response stream ended without an exit code".to_string(),
                )),
            };
        }
    }

    async fn dispatch(
        &self,
        request: &ExecuteTaskRequest,
        tx: mpsc::Sender<ProcessResponse>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match &request.descriptor {
            TaskDescriptor::Local(local) => {
                self.processes.execute(ProcessSpec::from(local), tx, cancel).await
            }
            TaskDescriptor::Copy(copy) => execute_copy(copy, tx, cancel).await,
            TaskDescriptor::Remote(remote) => {
                let spec = self.resolve_remote_tool(remote, request.tool_digest)?;
                self.processes.execute(spec, tx, cancel).await
            }
        }
    }

    /// Locate a synchronised tool inside the tool cache.
    ///
    /// Tools live at `<tool_cache_dir>/<digest as 16 hex digits>/<file name>`.
    pub fn resolve_remote_tool(
        &self,
        remote: &RemoteTaskDescriptor,
        tool_digest: Option<u64>,
    ) -> Result<ProcessSpec> {
        let digest = tool_digest.ok_or_else(|| {
            EngineError::ProtocolViolation("remote descriptor sent without a tool digest".to_string())
        })?;
        let file_name = remote.tool.file_name().ok_or_else(|| {
            EngineError::ConfigError(format!("tool path {:?} has no file name", remote.tool))
        })?;

        Ok(ProcessSpec {
            path: self
                .tool_cache_dir
                .join(format!("{digest:016x}"))
                .join(file_name),
            arguments: remote.arguments.clone(),
            working_directory: remote.working_directory.clone(),
            environment: remote.environment.clone(),
        })
    }

    async fn consume_attempt(
        &self,
        request: &ExecuteTaskRequest,
        mut rx: mpsc::Receiver<ProcessResponse>,
        sink: &mpsc::Sender<ProcessResponse>,
        attempt: &CancellationToken,
    ) -> Result<(Option<i32>, Option<RestartReason>)> {
        let mut sequence = ResponseSequence::new();
        let mut restart: Option<RestartReason> = None;

        while let Some(response) = rx.recv().await {
            if restart.is_some() {
                // Drain whatever the cancelled attempt still produces.
                continue;
            }
            sequence.observe(&response)?;

            match &response {
                ProcessResponse::StandardOutputLine(line)
                | ProcessResponse::StandardErrorLine(line) => {
                    if let Some(pattern) = request
                        .auto_recover
                        .iter()
                        .find(|p| line.contains(p.as_str()))
                    {
                        warn!(pattern = %pattern, "output matched auto-recovery pattern");
                        restart = Some(RestartReason::OutputMatched(pattern.clone()));
                        attempt.cancel();
                        continue;
                    }
                    if request.ignore_lines.iter().any(|p| line.contains(p.as_str())) {
                        continue;
                    }
                }
                ProcessResponse::ExitCode(code) => {
                    if (self.transient_exit)(*code) {
                        warn!(exit_code = code, "process exited with a transient exit code");
                        restart = Some(RestartReason::TransientExitCode(*code));
                        continue;
                    }
                }
            }

            if sink.send(response).await.is_err() {
                debug!("response sink closed; abandoning execution");
                return Err(EngineError::Cancelled);
            }
        }

        Ok((sequence.exit_code(), restart))
    }
}
