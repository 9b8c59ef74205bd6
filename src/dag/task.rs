// src/dag/task.rs

//! Task nodes of the build graph.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::dag::descriptor::TaskDescriptor;
use crate::types::TaskName;

/// How the descriptor of a task is obtained.
///
/// This is a closed set; the task runner matches on it exhaustively so a new
/// kind cannot be added without revisiting every dispatch site.
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// The descriptor has to be computed by the descriptor factory once the
    /// runner knows whether a local core is in hand.
    Describing,
    /// The descriptor is cheap to compute and the task always runs locally.
    FastExecutable,
    /// The descriptor was already resolved by an upstream describing step.
    Executable(TaskDescriptor),
}

/// Everything a descriptor factory needs to know about a task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub tool: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Whether the task may leave this machine at all.
    pub remotable: bool,
    /// For copy tasks: `(from, to)`.
    pub copy: Option<(PathBuf, PathBuf)>,
}

/// A node in the build graph.
#[derive(Debug)]
pub struct Task {
    pub name: TaskName,
    pub caption: String,
    pub spec: TaskSpec,
    pub kind: TaskKind,
    /// Direct dependencies (names of tasks that must succeed first).
    pub dependencies: Vec<TaskName>,
    descriptor: OnceLock<TaskDescriptor>,
}

impl Task {
    pub fn new(name: impl Into<TaskName>, spec: TaskSpec, kind: TaskKind) -> Self {
        let name = name.into();
        Self {
            caption: name.clone(),
            name,
            spec,
            kind,
            dependencies: Vec::new(),
            descriptor: OnceLock::new(),
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    /// Add a dependency. Repeating one has no effect.
    pub fn after(mut self, dependency: impl Into<TaskName>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// The descriptor computed for this task, if any.
    pub fn cached_descriptor(&self) -> Option<&TaskDescriptor> {
        match &self.kind {
            TaskKind::Executable(descriptor) => Some(descriptor),
            TaskKind::Describing | TaskKind::FastExecutable => self.descriptor.get(),
        }
    }

    /// Cache a freshly computed descriptor. The first descriptor wins; later
    /// calls return the cached one.
    pub fn cache_descriptor(&self, descriptor: TaskDescriptor) -> &TaskDescriptor {
        self.descriptor.get_or_init(|| descriptor)
    }
}
