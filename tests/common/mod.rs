#![allow(dead_code)]

pub use corefarm_test_utils::builders;
pub use corefarm_test_utils::fakes;
pub use corefarm_test_utils::{drain_responses, init_tracing, with_timeout};

use corefarm::engine::{JobResponse, TaskCompletionStatus};

/// Completion status reported for `task`, if it completed.
pub fn completion_of(responses: &[JobResponse], task: &str) -> Option<TaskCompletionStatus> {
    responses.iter().find_map(|r| match r {
        JobResponse::TaskCompleted { task: t, status, .. } if t == task => Some(*status),
        _ => None,
    })
}

/// Output lines forwarded for `task`, in order.
pub fn output_of(responses: &[JobResponse], task: &str) -> Vec<String> {
    responses
        .iter()
        .filter_map(|r| match r {
            JobResponse::TaskOutput { task: t, line, .. } if t == task => Some(line.clone()),
            _ => None,
        })
        .collect()
}

/// Number of responses of the given kind for `task`.
pub fn count_for(responses: &[JobResponse], task: &str, kind: fn(&JobResponse) -> bool) -> usize {
    responses
        .iter()
        .filter(|r| r.task() == Some(task) && kind(r))
        .count()
}

pub fn is_started(r: &JobResponse) -> bool {
    matches!(r, JobResponse::TaskStarted { .. })
}

pub fn is_completed(r: &JobResponse) -> bool {
    matches!(r, JobResponse::TaskCompleted { .. })
}
