// src/exec/mod.rs

//! Worker-side execution layer.
//!
//! This module is responsible for actually running resolved task descriptors
//! on whichever machine owns the reserved core, and for streaming the
//! process output back over the response protocol.
//!
//! - [`protocol`] defines execute requests, process responses and the
//!   ordering rules for the response stream.
//! - [`process`] provides the `ProcessExecutor` trait and the production
//!   `TokioProcessExecutor`.
//! - [`copy`] implements the file-copy executor.
//! - [`recovery`] holds the auto-recovery policy (output patterns and
//!   transient exit codes).
//! - [`manager`] contains the `ExecutionManager`, which dispatches requests
//!   and transparently restarts transiently failing processes.

pub mod copy;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod recovery;

pub use manager::ExecutionManager;
pub use process::{ProcessExecutor, ProcessSpec, TokioProcessExecutor};
pub use protocol::{CoreRequest, CoreResponse, ExecuteTaskRequest, ProcessResponse, ResponseSequence};
pub use recovery::{AutoRecoveryPolicy, AutoRecoveryRule, TransientExitPredicate};
