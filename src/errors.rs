// src/errors.rs

//! Crate-wide error type and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cycle detected in task graph: {0}")]
    DagCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("graph contains no tasks")]
    EmptyGraph,

    #[error("graph has {0} tasks but none of them can be scheduled first")]
    NoEntryPoint(usize),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("worker core unavailable: {0}")]
    CoreUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker disconnected before sending an exit code")]
    Disconnected,

    #[error("{0}")]
    Stalled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error represents a cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, EngineError>;
