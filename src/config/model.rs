// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::{Graph, SpecDescriptorFactory, Task, TaskKind, TaskSpec};
use crate::engine::EngineOptions;
use crate::errors::Result;
use crate::exec::recovery::{
    AutoRecoveryPolicy, AutoRecoveryRule, STATUS_DLL_INIT_FAILED, transient_exit_codes,
};

/// Job file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// local_cores = 8
/// stall_threshold = "10m"
///
/// [[config.auto_recover]]
/// tool = "^cl\\.exe$"
/// output = ["error C1001"]
///
/// [task.compile]
/// tool = "cc"
/// args = ["-c", "a.c", "-o", "a.o"]
/// remotable = true
///
/// [task.stage]
/// kind = "fast"
/// copy_from = "a.o"
/// copy_to = "out/a.o"
/// after = ["compile"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: RawConfigSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// `[config]` section as written; durations are still strings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigSection {
    /// Defaults to the machine's available parallelism.
    #[serde(default)]
    pub local_cores: Option<usize>,

    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: String,

    #[serde(default = "default_stall_check_interval")]
    pub stall_check_interval: String,

    #[serde(default = "default_fast_local_core_timeout")]
    pub fast_local_core_timeout: String,

    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,

    #[serde(default = "default_tool_cache_dir")]
    pub tool_cache_dir: PathBuf,

    /// Output lines containing any of these are not shown.
    #[serde(default)]
    pub ignore_lines: Vec<String>,

    #[serde(default)]
    pub auto_recover: Vec<AutoRecoverConfig>,
}

fn default_stall_threshold() -> String {
    "10m".to_string()
}

fn default_stall_check_interval() -> String {
    "30s".to_string()
}

fn default_fast_local_core_timeout() -> String {
    "250ms".to_string()
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![STATUS_DLL_INIT_FAILED]
}

fn default_tool_cache_dir() -> PathBuf {
    PathBuf::from(".corefarm/tools")
}

impl Default for RawConfigSection {
    fn default() -> Self {
        Self {
            local_cores: None,
            stall_threshold: default_stall_threshold(),
            stall_check_interval: default_stall_check_interval(),
            fast_local_core_timeout: default_fast_local_core_timeout(),
            transient_exit_codes: default_transient_exit_codes(),
            tool_cache_dir: default_tool_cache_dir(),
            ignore_lines: Vec::new(),
            auto_recover: Vec::new(),
        }
    }
}

/// One `[[config.auto_recover]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoRecoverConfig {
    /// Regex matched against the tool's file name.
    pub tool: String,
    pub output: Vec<String>,
}

/// `kind = "..."` of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKindConfig {
    /// Descriptor computed at run time, after the fast-local-core race.
    #[default]
    Describing,
    /// Cheap descriptor, always runs locally.
    Fast,
    /// Descriptor resolved while loading the job.
    Executable,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub caption: Option<String>,

    #[serde(default)]
    pub kind: TaskKindConfig,

    #[serde(default)]
    pub tool: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Relative to the job file's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    #[serde(default)]
    pub outputs: Vec<PathBuf>,

    #[serde(default)]
    pub remotable: bool,

    /// Names of tasks that must succeed first.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub copy_from: Option<PathBuf>,

    #[serde(default)]
    pub copy_to: Option<PathBuf>,
}

/// Validated `[config]` section.
#[derive(Debug, Clone)]
pub struct ConfigSection {
    pub local_cores: usize,
    pub stall_threshold: Duration,
    pub stall_check_interval: Duration,
    pub fast_local_core_timeout: Duration,
    pub transient_exit_codes: Vec<i32>,
    pub tool_cache_dir: PathBuf,
    pub ignore_lines: Vec<String>,
    pub auto_recover: Vec<AutoRecoveryRule>,
}

/// Validated job file.
///
/// Constructed through `TryFrom<RawConfigFile>`, which guarantees at least
/// one task, known dependencies, no cycles and well-formed settings.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub task: BTreeMap<String, TaskConfig>,
    /// Directory relative paths in the job are resolved against.
    pub root_dir: PathBuf,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(config: ConfigSection, task: BTreeMap<String, TaskConfig>) -> Self {
        Self {
            config,
            task,
            root_dir: PathBuf::new(),
        }
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            stall_threshold: self.config.stall_threshold,
            stall_check_interval: self.config.stall_check_interval,
            fast_local_core_timeout: self.config.fast_local_core_timeout,
            ignore_lines: self.config.ignore_lines.clone(),
        }
    }

    pub fn recovery_policy(&self) -> AutoRecoveryPolicy {
        AutoRecoveryPolicy::new(
            self.config.auto_recover.clone(),
            transient_exit_codes(self.config.transient_exit_codes.clone()),
        )
    }

    pub fn tool_cache_dir(&self) -> PathBuf {
        self.root_dir.join(&self.config.tool_cache_dir)
    }

    /// The task spec for `[task.<name>]`, with paths resolved.
    pub fn task_spec(&self, task: &TaskConfig) -> TaskSpec {
        let working_directory = match &task.cwd {
            Some(cwd) => self.root_dir.join(cwd),
            None => self.root_dir.clone(),
        };
        let resolve = |p: &PathBuf| working_directory.join(p);

        TaskSpec {
            tool: task.tool.clone().unwrap_or_default(),
            arguments: task.args.clone(),
            environment: task.env.clone(),
            inputs: task.inputs.iter().map(resolve).collect(),
            outputs: task.outputs.iter().map(resolve).collect(),
            remotable: task.remotable,
            copy: match (&task.copy_from, &task.copy_to) {
                (Some(from), Some(to)) => Some((resolve(from), resolve(to))),
                _ => None,
            },
            working_directory,
        }
    }

    /// Build the immutable task graph for this job.
    pub fn build_graph(&self) -> Result<Arc<Graph>> {
        let mut tasks = Vec::with_capacity(self.task.len());
        for (name, cfg) in &self.task {
            let spec = self.task_spec(cfg);
            let kind = match cfg.kind {
                TaskKindConfig::Describing => TaskKind::Describing,
                TaskKindConfig::Fast => TaskKind::FastExecutable,
                TaskKindConfig::Executable => {
                    TaskKind::Executable(SpecDescriptorFactory::describe(&spec)?)
                }
            };
            let task = cfg.after.iter().fold(
                Task::new(name.clone(), spec, kind)
                    .with_caption(cfg.caption.clone().unwrap_or_else(|| name.clone())),
                |task, dep| task.after(dep.clone()),
            );
            tasks.push(task);
        }
        Ok(Arc::new(Graph::new(tasks)?))
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    let secs_per_unit = match unit.as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => {
            return Err(format!(
                "unsupported duration unit '{}'; expected ms, s, m, or h",
                unit
            ));
        }
    };

    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration(" 2h "), Ok(Duration::from_secs(7200)));
    }

    #[test]
    fn oversized_duration_is_an_error() {
        let err = parse_duration("9999999999999999h").unwrap_err();
        assert!(err.contains("too large"));
        assert!(parse_duration("99999999999999999999s").is_err());
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
