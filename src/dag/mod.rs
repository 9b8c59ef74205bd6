// src/dag/mod.rs

//! Build graph representation and scheduling.
//!
//! - [`graph`] holds the immutable task graph and its dependency index.
//! - [`task`] defines task nodes and their kinds.
//! - [`descriptor`] defines resolved task descriptors and the factory trait.
//! - [`scheduler`] contains the per-execution status state machine.
//! - [`task_info`] holds per-task status bookkeeping.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] applies status transitions to the status table.

pub mod descriptor;
pub mod graph;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task;
pub mod task_info;

pub use descriptor::{
    CopyTaskDescriptor, LocalTaskDescriptor, RemoteTaskDescriptor, SpecDescriptorFactory,
    StorageLayer, TaskDescriptor, TaskDescriptorFactory,
};
pub use graph::{Graph, TaskDependencies};
pub use scheduler::{GraphStatistics, Scheduler};
pub use scheduler_step::SchedulerStep;
pub use task::{Task, TaskKind, TaskSpec};
pub use task_info::TaskState;
