// src/exec/copy.rs

//! File-copy executor for `Copy` descriptors.

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dag::CopyTaskDescriptor;
use crate::errors::{EngineError, Result};
use crate::exec::protocol::ProcessResponse;

/// Copy `from` to `to`, creating parent directories as needed, and report the
/// result through the same response stream a process would use.
///
/// Copy failures are reported as exit code 1 with the error on stderr rather
/// than as an engine error; a bad path is a task failure, not an engine fault.
pub async fn execute_copy(
    descriptor: &CopyTaskDescriptor,
    output: mpsc::Sender<ProcessResponse>,
    cancel: CancellationToken,
) -> Result<()> {
    let result = tokio::select! {
        res = copy_file(descriptor) => res,
        _ = cancel.cancelled() => return Ok(()),
    };

    let responses = match result {
        Ok(bytes) => {
            debug!(from = %descriptor.from.display(), to = %descriptor.to.display(), bytes, "copied file");
            vec![ProcessResponse::ExitCode(0)]
        }
        Err(e) => {
            warn!(from = %descriptor.from.display(), error = %e, "copy failed");
            vec![
                ProcessResponse::StandardErrorLine(format!("{e:#}")),
                ProcessResponse::ExitCode(1),
            ]
        }
    };

    for response in responses {
        output
            .send(response)
            .await
            .map_err(|_| EngineError::Other(anyhow::anyhow!("copy output receiver dropped")))?;
    }
    Ok(())
}

async fn copy_file(descriptor: &CopyTaskDescriptor) -> anyhow::Result<u64> {
    if let Some(parent) = descriptor.to.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {:?}", parent))?;
        }
    }
    let bytes = tokio::fs::copy(&descriptor.from, &descriptor.to)
        .await
        .with_context(|| format!("copying {:?} to {:?}", descriptor.from, descriptor.to))?;
    Ok(bytes)
}
