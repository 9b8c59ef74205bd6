// src/engine/watchdog.rs

//! Stall detection for a running build.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::engine::instance::GraphExecutionInstance;
use crate::errors::EngineError;

/// Periodically check the instance for progress and cancel it if nothing
/// has been seeded or finished for `threshold`.
///
/// Returns when the build is cancelled (for whatever reason) or the
/// ready-queue has been terminated.
pub async fn run_stall_watchdog(
    instance: Arc<GraphExecutionInstance>,
    threshold: Duration,
    check_interval: Duration,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = instance.cancellation().cancelled() => return,
            _ = ticker.tick() => {}
        }

        if instance.queue().is_terminated() {
            return;
        }

        let idle = instance.since_last_progress();
        if idle < threshold {
            debug!(idle_ms = idle.as_millis() as u64, "build is making progress");
            continue;
        }

        let unfinished = instance
            .unfinished()
            .into_iter()
            .map(|(task, status)| format!("{task} ({status})"))
            .collect::<Vec<_>>()
            .join(", ");
        let message = EngineError::Stalled(format!(
            "build stalled: no task finished for {}s; unfinished tasks: [{unfinished}]",
            idle.as_secs()
        ))
        .to_string();
        error!(idle_secs = idle.as_secs(), "{message}");
        instance.cancel_with(message);
        return;
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::dag::{Graph, Task, TaskKind, TaskSpec};

    fn instance() -> Arc<GraphExecutionInstance> {
        let task = Task::new("a", TaskSpec::default(), TaskKind::FastExecutable);
        let graph = Arc::new(Graph::new([task]).unwrap());
        Arc::new(GraphExecutionInstance::new(graph, &CancellationToken::new()))
    }

    #[tokio::test]
    async fn idle_build_is_cancelled_with_unfinished_tasks() {
        let inst = instance();
        inst.seed().unwrap();

        run_stall_watchdog(
            Arc::clone(&inst),
            Duration::from_millis(30),
            Duration::from_millis(10),
        )
        .await;

        assert!(inst.cancellation().is_cancelled());
        let message = inst.failure_message().unwrap();
        assert!(message.contains("a (Scheduled)"), "{message}");
    }

    #[tokio::test]
    async fn returns_quietly_once_the_build_is_cancelled() {
        let inst = instance();
        inst.seed().unwrap();
        inst.cancellation().cancel();

        run_stall_watchdog(
            Arc::clone(&inst),
            Duration::from_secs(600),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(inst.failure_message(), None);
    }
}
