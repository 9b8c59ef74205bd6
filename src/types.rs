use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

/// Canonical task name type used throughout the engine.
pub type TaskName = String;

/// Boxed future returned by the pluggable collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Status of a task inside one graph execution.
///
/// The variants are declared in lifecycle order. Once a task reaches one of
/// the three terminal statuses it never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum GraphTaskStatus {
    Pending,
    Scheduled,
    Starting,
    WaitingForFastLocalCore,
    ComputingTaskDescriptor,
    WaitingForCore,
    ExecutingTaskDescriptor,
    CompletedSuccessfully,
    CompletedUnsuccessfully,
    CancelledDueToUpstreamFailures,
}

impl GraphTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GraphTaskStatus::CompletedSuccessfully
                | GraphTaskStatus::CompletedUnsuccessfully
                | GraphTaskStatus::CancelledDueToUpstreamFailures
        )
    }

    /// Statuses a running task moves through between `Scheduled` and its
    /// terminal status.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            GraphTaskStatus::Starting
                | GraphTaskStatus::WaitingForFastLocalCore
                | GraphTaskStatus::ComputingTaskDescriptor
                | GraphTaskStatus::WaitingForCore
                | GraphTaskStatus::ExecutingTaskDescriptor
        )
    }
}

impl fmt::Display for GraphTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Sub-stage of a single task's execution, reported to clients for progress
/// display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskPhase {
    Initial,
    RemoteToolSynchronisation,
    RemoteInputBlobSynchronisation,
    TaskExecution,
    RemoteOutputBlobSynchronisation,
}

/// Where a reserved core is allowed to come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePreference {
    /// Only a core on this machine will do.
    RequireLocal,
    /// Use a remote core if one is free, otherwise accept a local one.
    PreferRemote,
}

/// Where a provider's cores live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreLocation {
    Local,
    Remote,
}
