// src/exec/recovery.rs

//! Auto-recovery policy: which failures are transient and get retried.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::dag::TaskDescriptor;

/// Exit code of a process that failed to initialise on Windows
/// (`STATUS_DLL_INIT_FAILED`); retried by default.
pub const STATUS_DLL_INIT_FAILED: i32 = -1073741502;

/// Decides whether a process exit code is a transient failure.
pub type TransientExitPredicate = Arc<dyn Fn(i32) -> bool + Send + Sync>;

/// Predicate matching exactly the given exit codes.
pub fn transient_exit_codes(codes: Vec<i32>) -> TransientExitPredicate {
    Arc::new(move |code| codes.contains(&code))
}

/// Output substrings that indicate a known-flaky tool hit a transient error.
#[derive(Debug, Clone)]
pub struct AutoRecoveryRule {
    /// Matched against the file name of the tool being executed.
    pub tool: Regex,
    pub output: Vec<String>,
}

/// Collection of auto-recovery rules plus the transient exit predicate.
#[derive(Clone)]
pub struct AutoRecoveryPolicy {
    rules: Vec<AutoRecoveryRule>,
    transient_exit: TransientExitPredicate,
}

impl fmt::Debug for AutoRecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoRecoveryPolicy")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Default for AutoRecoveryPolicy {
    fn default() -> Self {
        Self::new(Vec::new(), transient_exit_codes(vec![STATUS_DLL_INIT_FAILED]))
    }
}

impl AutoRecoveryPolicy {
    pub fn new(rules: Vec<AutoRecoveryRule>, transient_exit: TransientExitPredicate) -> Self {
        Self {
            rules,
            transient_exit,
        }
    }

    /// Recovery substrings to send along with `descriptor`.
    pub fn patterns_for(&self, descriptor: &TaskDescriptor) -> Vec<String> {
        let Some(file_name) = descriptor
            .tool_path()
            .and_then(|p| Path::new(p).file_name())
            .and_then(|n| n.to_str())
        else {
            return Vec::new();
        };

        self.rules
            .iter()
            .filter(|rule| rule.tool.is_match(file_name))
            .flat_map(|rule| rule.output.iter().cloned())
            .collect()
    }

    pub fn is_transient_exit(&self, code: i32) -> bool {
        (self.transient_exit)(code)
    }

    pub fn transient_exit(&self) -> TransientExitPredicate {
        Arc::clone(&self.transient_exit)
    }
}
