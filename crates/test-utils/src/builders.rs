#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use corefarm::config::{ConfigFile, RawConfigFile, RawConfigSection, TaskConfig, TaskKindConfig};
use corefarm::dag::{Graph, Task, TaskKind, TaskSpec};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: RawConfigSection {
                    local_cores: Some(2),
                    ..RawConfigSection::default()
                },
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn with_local_cores(mut self, cores: usize) -> Self {
        self.config.config.local_cores = Some(cores);
        self
    }

    pub fn with_stall_threshold(mut self, threshold: &str) -> Self {
        self.config.config.stall_threshold = threshold.to_string();
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(tool: &str) -> Self {
        Self {
            task: TaskConfig {
                tool: Some(PathBuf::from(tool)),
                ..TaskConfig::default()
            },
        }
    }

    pub fn copy(from: &str, to: &str) -> Self {
        Self {
            task: TaskConfig {
                kind: TaskKindConfig::Fast,
                copy_from: Some(PathBuf::from(from)),
                copy_to: Some(PathBuf::from(to)),
                ..TaskConfig::default()
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.task.args.push(arg.to_string());
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn kind(mut self, kind: TaskKindConfig) -> Self {
        self.task.kind = kind;
        self
    }

    pub fn remotable(mut self, val: bool) -> Self {
        self.task.remotable = val;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Builder for a graph of tasks that bypasses job files.
///
/// Every task runs the tool named after the task, so scripted executors can
/// key their behaviour on the task name.
#[derive(Default)]
pub struct GraphBuilder {
    tasks: Vec<Task>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A task that always runs locally.
    pub fn local(self, name: &str, deps: &[&str]) -> Self {
        self.push(name, deps, false, TaskKind::FastExecutable)
    }

    /// A describing task whose descriptor allows remote execution.
    pub fn remotable(self, name: &str, deps: &[&str]) -> Self {
        self.push(name, deps, true, TaskKind::Describing)
    }

    /// A describing task that must run locally.
    pub fn describing(self, name: &str, deps: &[&str]) -> Self {
        self.push(name, deps, false, TaskKind::Describing)
    }

    fn push(mut self, name: &str, deps: &[&str], remotable: bool, kind: TaskKind) -> Self {
        let spec = TaskSpec {
            tool: PathBuf::from(name),
            remotable,
            ..TaskSpec::default()
        };
        let task = deps
            .iter()
            .fold(Task::new(name, spec, kind), |task, dep| task.after(*dep));
        self.tasks.push(task);
        self
    }

    pub fn build(self) -> Arc<Graph> {
        Arc::new(Graph::new(self.tasks).expect("Failed to build valid graph from builder"))
    }
}
