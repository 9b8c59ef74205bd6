// src/exec/protocol.rs

//! Messages exchanged with a worker core, plus the ordering rules for the
//! process response stream.

use serde::Serialize;

use crate::dag::TaskDescriptor;
use crate::errors::{EngineError, Result};
use crate::pool::WorkerCoreInfo;

/// Ask a worker core to run one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecuteTaskRequest {
    pub descriptor: TaskDescriptor,
    /// Content digest of the synchronised tool; set for remote descriptors
    /// once the tool is present on the worker.
    pub tool_digest: Option<u64>,
    /// Output substrings that trigger a silent restart of the process.
    pub auto_recover: Vec<String>,
    /// Output substrings whose lines are dropped instead of forwarded.
    pub ignore_lines: Vec<String>,
}

impl ExecuteTaskRequest {
    pub fn new(descriptor: TaskDescriptor) -> Self {
        Self {
            descriptor,
            tool_digest: None,
            auto_recover: Vec::new(),
            ignore_lines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResponse {
    StandardOutputLine(String),
    StandardErrorLine(String),
    ExitCode(i32),
}

/// Requests sent over a raw worker stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreRequest {
    ReserveCore,
    ExecuteTask(ExecuteTaskRequest),
}

/// Responses received over a raw worker stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreResponse {
    ReserveCore(WorkerCoreInfo),
    Process(ProcessResponse),
}

/// Enforces "exactly one exit code, and nothing after it" on a response
/// stream.
#[derive(Debug, Default)]
pub struct ResponseSequence {
    exit_code: Option<i32>,
}

impl ResponseSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next response, rejecting anything that follows an exit code.
    pub fn observe(&mut self, response: &ProcessResponse) -> Result<()> {
        if let Some(code) = self.exit_code {
            return Err(EngineError::ProtocolViolation(format!(
                "received {response:?} after exit code {code}"
            )));
        }
        if let ProcessResponse::ExitCode(code) = response {
            self.exit_code = Some(*code);
        }
        Ok(())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}
