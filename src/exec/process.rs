// src/exec/process.rs

//! Process execution primitive.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::LocalTaskDescriptor;
use crate::errors::{EngineError, Result};
use crate::exec::protocol::ProcessResponse;
use crate::types::BoxFuture;

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
}

impl From<&LocalTaskDescriptor> for ProcessSpec {
    fn from(local: &LocalTaskDescriptor) -> Self {
        Self {
            path: local.path.clone(),
            arguments: local.arguments.clone(),
            working_directory: local.working_directory.clone(),
            environment: local.environment.clone(),
        }
    }
}

/// Runs a process and streams its output.
///
/// Implementations send zero or more output lines followed by exactly one
/// [`ProcessResponse::ExitCode`]. When `cancel` fires the process is stopped
/// and no exit code is sent.
pub trait ProcessExecutor: Send + Sync {
    fn execute(
        &self,
        spec: ProcessSpec,
        output: mpsc::Sender<ProcessResponse>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Production executor backed by `tokio::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn execute(
        &self,
        spec: ProcessSpec,
        output: mpsc::Sender<ProcessResponse>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(run_process(spec, output, cancel))
    }
}

async fn run_process(
    spec: ProcessSpec,
    output: mpsc::Sender<ProcessResponse>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        path = %spec.path.display(),
        args = ?spec.arguments,
        "starting process"
    );

    let mut cmd = Command::new(&spec.path);
    cmd.args(&spec.arguments)
        .envs(&spec.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !spec.working_directory.as_os_str().is_empty() {
        cmd.current_dir(&spec.working_directory);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process {:?}", spec.path))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_pump = stdout.map(|stdout| {
        tokio::spawn(pump_lines(stdout, output.clone(), ProcessResponse::StandardOutputLine))
    });
    let stderr_pump = stderr.map(|stderr| {
        tokio::spawn(pump_lines(stderr, output.clone(), ProcessResponse::StandardErrorLine))
    });

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res
                .with_context(|| format!("waiting for process {:?}", spec.path))?;

            // Drain the pipes before reporting the exit code so output is
            // never delivered after it.
            for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
                if let Err(e) = pump.await {
                    warn!(error = %e, "output pump task failed");
                }
            }

            let code = status.code().unwrap_or(-1);
            debug!(path = %spec.path.display(), exit_code = code, "process exited");

            output
                .send(ProcessResponse::ExitCode(code))
                .await
                .map_err(|_| EngineError::Other(anyhow::anyhow!("process output receiver dropped")))?;
            Ok(())
        }

        _ = cancel.cancelled() => {
            info!(path = %spec.path.display(), "cancellation requested; killing process");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill child process on cancellation");
            }
            for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
                pump.abort();
            }
            Ok(())
        }
    }
}

/// Forward every line of `pipe` until EOF.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream,
/// so the child never sees its pipe closed early.
async fn pump_lines<R>(
    pipe: R,
    tx: mpsc::Sender<ProcessResponse>,
    wrap: fn(String) -> ProcessResponse,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(wrap(line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read process output");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            path: "sh".into(),
            arguments: vec!["-c".into(), script.into()],
            working_directory: PathBuf::new(),
            environment: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn streams_lines_then_exit_code() {
        let (tx, mut rx) = mpsc::channel(16);
        TokioProcessExecutor
            .execute(sh("echo out; echo err 1>&2; exit 3"), tx, CancellationToken::new())
            .await
            .unwrap();

        let mut responses = Vec::new();
        while let Some(r) = rx.recv().await {
            responses.push(r);
        }
        assert_eq!(responses.last(), Some(&ProcessResponse::ExitCode(3)));
        assert!(responses.contains(&ProcessResponse::StandardOutputLine("out".into())));
        assert!(responses.contains(&ProcessResponse::StandardErrorLine("err".into())));
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_the_stream() {
        let (tx, mut rx) = mpsc::channel(1024);
        let script = "printf 'bad \\377 byte\\n'; head -c 300000 /dev/zero | tr '\\0' x; echo; echo done; exit 0";
        let run = tokio::spawn(run_process(sh(script), tx, CancellationToken::new()));

        let mut responses = Vec::new();
        while let Some(r) = rx.recv().await {
            responses.push(r);
        }
        run.await.unwrap().unwrap();

        assert_eq!(
            responses.first(),
            Some(&ProcessResponse::StandardOutputLine("bad \u{fffd} byte".into()))
        );
        assert!(responses.iter().any(|r| matches!(
            r,
            ProcessResponse::StandardOutputLine(line) if line.len() == 300_000
        )));
        assert!(responses.contains(&ProcessResponse::StandardOutputLine("done".into())));
        assert_eq!(responses.last(), Some(&ProcessResponse::ExitCode(0)));
    }

    #[tokio::test]
    async fn cancellation_kills_without_exit_code() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        TokioProcessExecutor
            .execute(sh("sleep 30"), tx, cancel)
            .await
            .unwrap();

        while let Some(r) = rx.recv().await {
            assert!(!matches!(r, ProcessResponse::ExitCode(_)));
        }
    }
}
