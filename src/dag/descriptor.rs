// src/dag/descriptor.rs

//! Resolved, executable descriptions of work.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::dag::task::TaskSpec;
use crate::errors::{EngineError, Result};
use crate::types::BoxFuture;

/// Run a process on the machine that owns the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTaskDescriptor {
    pub path: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
}

/// Copy a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyTaskDescriptor {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// How a remote worker obtains the task's input and output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StorageLayer {
    /// Inputs are pushed to and outputs pulled from the worker.
    TransferringBlobs,
    /// The worker sees the same filesystem; nothing is transferred.
    Shared,
}

/// Run a tool on whichever core is reserved, possibly on another machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTaskDescriptor {
    pub tool: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub storage_layer: StorageLayer,
    /// Whether a local core may run this descriptor directly when one is
    /// already in hand.
    pub use_fast_local_execution: bool,
}

impl RemoteTaskDescriptor {
    /// The equivalent local process, used when the task lands on a local core.
    pub fn to_local(&self) -> LocalTaskDescriptor {
        LocalTaskDescriptor {
            path: self.tool.clone(),
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum TaskDescriptor {
    Local(LocalTaskDescriptor),
    Copy(CopyTaskDescriptor),
    Remote(RemoteTaskDescriptor),
}

impl TaskDescriptor {
    /// Executable path used for auto-recovery matching, if the descriptor
    /// runs a tool at all.
    pub fn tool_path(&self) -> Option<&PathBuf> {
        match self {
            TaskDescriptor::Local(local) => Some(&local.path),
            TaskDescriptor::Remote(remote) => Some(&remote.tool),
            TaskDescriptor::Copy(_) => None,
        }
    }
}

/// Computes a [`TaskDescriptor`] from a task spec.
///
/// `can_run_locally` tells the factory whether a local core is already
/// reserved for the task.
pub trait TaskDescriptorFactory: Send + Sync {
    fn create_descriptor_for_task_spec<'a>(
        &'a self,
        spec: &'a TaskSpec,
        can_run_locally: bool,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<TaskDescriptor>>;
}

/// Descriptor factory driven purely by the fields of [`TaskSpec`].
///
/// - specs with `copy` set become [`TaskDescriptor::Copy`]
/// - remotable specs become [`TaskDescriptor::Remote`] with blob transfer
///   and fast local execution enabled
/// - everything else becomes [`TaskDescriptor::Local`]
#[derive(Debug, Clone, Default)]
pub struct SpecDescriptorFactory;

impl SpecDescriptorFactory {
    pub fn describe(spec: &TaskSpec) -> Result<TaskDescriptor> {
        if let Some((from, to)) = &spec.copy {
            return Ok(TaskDescriptor::Copy(CopyTaskDescriptor {
                from: from.clone(),
                to: to.clone(),
            }));
        }

        if spec.tool.as_os_str().is_empty() {
            return Err(EngineError::ConfigError(
                "task spec has neither a tool nor a copy source".to_string(),
            ));
        }

        if spec.remotable {
            Ok(TaskDescriptor::Remote(RemoteTaskDescriptor {
                tool: spec.tool.clone(),
                arguments: spec.arguments.clone(),
                working_directory: spec.working_directory.clone(),
                environment: spec.environment.clone(),
                inputs: spec.inputs.clone(),
                outputs: spec.outputs.clone(),
                storage_layer: StorageLayer::TransferringBlobs,
                use_fast_local_execution: true,
            }))
        } else {
            Ok(TaskDescriptor::Local(LocalTaskDescriptor {
                path: spec.tool.clone(),
                arguments: spec.arguments.clone(),
                working_directory: spec.working_directory.clone(),
                environment: spec.environment.clone(),
            }))
        }
    }
}

impl TaskDescriptorFactory for SpecDescriptorFactory {
    fn create_descriptor_for_task_spec<'a>(
        &'a self,
        spec: &'a TaskSpec,
        _can_run_locally: bool,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<TaskDescriptor>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            Self::describe(spec)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_spec_becomes_copy_descriptor() {
        let spec = TaskSpec {
            copy: Some(("a.o".into(), "out/a.o".into())),
            ..TaskSpec::default()
        };
        let descriptor = SpecDescriptorFactory::describe(&spec).unwrap();
        assert!(matches!(descriptor, TaskDescriptor::Copy(_)));
        assert!(descriptor.tool_path().is_none());
    }

    #[test]
    fn remotable_spec_becomes_remote_descriptor() {
        let spec = TaskSpec {
            tool: "cc".into(),
            arguments: vec!["-c".into(), "a.c".into()],
            remotable: true,
            ..TaskSpec::default()
        };
        match SpecDescriptorFactory::describe(&spec).unwrap() {
            TaskDescriptor::Remote(remote) => {
                assert!(remote.use_fast_local_execution);
                assert_eq!(remote.storage_layer, StorageLayer::TransferringBlobs);
                assert_eq!(remote.to_local().path, PathBuf::from("cc"));
            }
            other => panic!("expected remote descriptor, got {other:?}"),
        }
    }

    #[test]
    fn spec_without_tool_is_rejected() {
        let err = SpecDescriptorFactory::describe(&TaskSpec::default()).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }
}
