// src/config/validate.rs

use regex::Regex;

use crate::config::model::{ConfigFile, ConfigSection, RawConfigFile, RawConfigSection, parse_duration};
use crate::dag::graph::check_dependencies;
use crate::errors::{EngineError, Result};
use crate::exec::recovery::AutoRecoveryRule;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = EngineError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        let config = validate_global_config(&raw.config)?;
        validate_tasks(&raw)?;
        check_dependencies(
            raw.task
                .iter()
                .map(|(name, task)| (name.as_str(), task.after.as_slice())),
        )?;
        Ok(ConfigFile::new_unchecked(config, raw.task))
    }
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(EngineError::ConfigError(
            "job must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn duration(field: &str, value: &str) -> Result<std::time::Duration> {
    parse_duration(value)
        .map_err(|e| EngineError::ConfigError(format!("[config].{field}: {e}")))
}

fn validate_global_config(raw: &RawConfigSection) -> Result<ConfigSection> {
    let local_cores = match raw.local_cores {
        Some(0) => {
            return Err(EngineError::ConfigError(
                "[config].local_cores must be >= 1 (got 0)".to_string(),
            ));
        }
        Some(n) => n,
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    };

    let stall_threshold = duration("stall_threshold", &raw.stall_threshold)?;
    let stall_check_interval = duration("stall_check_interval", &raw.stall_check_interval)?;
    let fast_local_core_timeout =
        duration("fast_local_core_timeout", &raw.fast_local_core_timeout)?;

    if stall_check_interval.is_zero() {
        return Err(EngineError::ConfigError(
            "[config].stall_check_interval must be greater than zero".to_string(),
        ));
    }

    let auto_recover = raw
        .auto_recover
        .iter()
        .map(|rule| {
            let tool = Regex::new(&rule.tool).map_err(|e| {
                EngineError::ConfigError(format!(
                    "[config.auto_recover] invalid tool regex '{}': {e}",
                    rule.tool
                ))
            })?;
            if rule.output.is_empty() {
                return Err(EngineError::ConfigError(format!(
                    "[config.auto_recover] rule for '{}' has no output patterns",
                    rule.tool
                )));
            }
            Ok(AutoRecoveryRule {
                tool,
                output: rule.output.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ConfigSection {
        local_cores,
        stall_threshold,
        stall_check_interval,
        fast_local_core_timeout,
        transient_exit_codes: raw.transient_exit_codes.clone(),
        tool_cache_dir: raw.tool_cache_dir.clone(),
        ignore_lines: raw.ignore_lines.clone(),
        auto_recover,
    })
}

fn validate_tasks(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        let is_copy = match (&task.copy_from, &task.copy_to) {
            (Some(_), Some(_)) => true,
            (None, None) => false,
            _ => {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' must set both `copy_from` and `copy_to`, or neither",
                    name
                )));
            }
        };
        match (&task.tool, is_copy) {
            (Some(_), true) => {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' cannot have both a `tool` and a copy",
                    name
                )));
            }
            (None, false) => {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' needs either a `tool` or `copy_from`/`copy_to`",
                    name
                )));
            }
            (Some(tool), false) if tool.as_os_str().is_empty() => {
                return Err(EngineError::ConfigError(format!(
                    "task '{}' has an empty `tool`",
                    name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
