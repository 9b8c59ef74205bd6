// src/engine/responses.rs

//! Messages streamed back to the client while a job runs.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::dag::GraphStatistics;
use crate::pool::WorkerCoreInfo;
use crate::types::{GraphTaskStatus, TaskName, TaskPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCompletionStatus {
    Success,
    Failure,
    Cancelled,
    /// The task hit an unexpected error; the whole job is being cancelled.
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCompletionStatus {
    Success,
    Failure,
    Cancelled,
}

/// One event in a job's response stream.
///
/// For every task that leaves `Pending`, the stream carries exactly one
/// `TaskStarted` followed (eventually) by exactly one `TaskCompleted`. The
/// last message is always `JobComplete`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResponse {
    JobParsed {
        total_tasks: usize,
    },
    TaskPreparing {
        task: TaskName,
    },
    TaskPrepared {
        task: TaskName,
    },
    TaskStarted {
        task: TaskName,
        caption: String,
        /// `None` when the task never got as far as reserving a core.
        worker: Option<WorkerCoreInfo>,
    },
    TaskOutput {
        task: TaskName,
        stream: OutputStream,
        line: String,
    },
    TaskPhaseChange {
        task: TaskName,
        phase: TaskPhase,
        previous_phase: TaskPhase,
        previous_phase_seconds: f64,
        metadata: BTreeMap<String, String>,
    },
    TaskCompleted {
        task: TaskName,
        status: TaskCompletionStatus,
        exit_code: Option<i32>,
        exception_message: Option<String>,
        total_seconds: f64,
        status_seconds: BTreeMap<GraphTaskStatus, f64>,
    },
    JobComplete {
        status: JobCompletionStatus,
        total_seconds: f64,
        exception_message: Option<String>,
        statistics: GraphStatistics,
    },
}

impl JobResponse {
    /// The task this response concerns, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            JobResponse::TaskPreparing { task }
            | JobResponse::TaskPrepared { task }
            | JobResponse::TaskStarted { task, .. }
            | JobResponse::TaskOutput { task, .. }
            | JobResponse::TaskPhaseChange { task, .. }
            | JobResponse::TaskCompleted { task, .. } => Some(task),
            JobResponse::JobParsed { .. } | JobResponse::JobComplete { .. } => None,
        }
    }
}

/// Sending half of a job's response stream.
///
/// A client that stopped listening does not stop the job; responses sent
/// after the receiver is gone are dropped.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    tx: mpsc::UnboundedSender<JobResponse>,
}

impl ResponseSink {
    pub fn new(tx: mpsc::UnboundedSender<JobResponse>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, response: JobResponse) {
        if self.tx.send(response).is_err() {
            trace!("job response receiver dropped");
        }
    }
}
