// tests/scheduler_properties.rs

mod common;

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;

use corefarm::config::ConfigFile;
use corefarm::dag::Scheduler;
use corefarm::engine::{GraphExecutionInstance, SchedulingBehaviour};
use corefarm::types::GraphTaskStatus;

use tokio_util::sync::CancellationToken;

use crate::common::builders::{ConfigFileBuilder, GraphBuilder, TaskConfigBuilder};

// Acyclic by construction: task N may only depend on tasks 0..N-1.
fn dag_config_strategy(max_tasks: usize) -> impl Strategy<Value = ConfigFile> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        let deps_strat = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_tasks),
            num_tasks,
        );

        deps_strat.prop_map(move |raw_deps| {
            let mut builder = ConfigFileBuilder::new();
            for (i, potential_deps) in raw_deps.into_iter().enumerate() {
                let name = format!("task_{:02}", i);
                let mut task_builder = TaskConfigBuilder::new(&name);

                // Repeats are kept: a dependency listed twice must
                // still schedule its dependent once.
                let valid_deps: Vec<usize> = if i > 0 {
                    potential_deps.into_iter().map(|d| d % i).collect()
                } else {
                    Vec::new()
                };
                for dep_idx in valid_deps {
                    task_builder = task_builder.after(&format!("task_{:02}", dep_idx));
                }
                builder = builder.with_task(&name, task_builder.build());
            }
            builder.build()
        })
    })
}

proptest! {
    #[test]
    fn every_execution_terminates_with_consistent_statuses(
        cfg in dag_config_strategy(12),
        failing_indices in proptest::collection::vec(0..12usize, 0..4),
        pick_order in proptest::collection::vec(any::<usize>(), 0..64),
    ) {
        let graph = cfg.build_graph().unwrap();
        let names: Vec<String> = graph.task_names().map(str::to_string).collect();
        let failing: HashSet<String> = failing_indices
            .iter()
            .filter(|&&i| i < names.len())
            .map(|&i| names[i].clone())
            .collect();

        let mut scheduler = Scheduler::new(graph.clone());
        let mut ready: Vec<String> = scheduler.seed().unwrap().newly_scheduled;
        let mut ever_scheduled: BTreeSet<String> = ready.iter().cloned().collect();
        let mut picks = pick_order.into_iter();
        let mut steps = 0;

        while !ready.is_empty() {
            steps += 1;
            prop_assert!(steps <= names.len(), "more completions than tasks");

            let idx = picks.next().unwrap_or(0) % ready.len();
            let task = ready.swap_remove(idx);

            // A task only ever becomes ready once all its dependencies succeeded.
            for dep in graph.dependencies().what_target_depends_on(&task) {
                prop_assert_eq!(
                    scheduler.status_of(dep),
                    Some(GraphTaskStatus::CompletedSuccessfully)
                );
            }

            let outcome = if failing.contains(&task) {
                GraphTaskStatus::CompletedUnsuccessfully
            } else {
                GraphTaskStatus::CompletedSuccessfully
            };
            let step = scheduler.finish(&task, outcome).unwrap();

            for scheduled in step.newly_scheduled {
                prop_assert!(ever_scheduled.insert(scheduled.clone()), "{} scheduled twice", scheduled);
                ready.push(scheduled);
            }
            for cancelled in &step.newly_cancelled {
                prop_assert!(!ever_scheduled.contains(cancelled));
            }
        }

        prop_assert!(scheduler.all_terminal());

        for name in &names {
            let status = scheduler.status_of(name).unwrap();
            let deps = graph.dependencies().what_target_depends_on(name);
            let blocked = deps
                .iter()
                .any(|d| scheduler.status_of(d) != Some(GraphTaskStatus::CompletedSuccessfully));
            if blocked {
                prop_assert_eq!(status, GraphTaskStatus::CancelledDueToUpstreamFailures);
            } else if failing.contains(name) {
                prop_assert_eq!(status, GraphTaskStatus::CompletedUnsuccessfully);
            } else {
                prop_assert_eq!(status, GraphTaskStatus::CompletedSuccessfully);
            }
        }

        let stats = scheduler.statistics();
        prop_assert_eq!(stats.total, names.len());
        prop_assert_eq!(scheduler.all_succeeded(), failing.iter().all(|f| !names.contains(f)));
    }
}

#[test]
fn concurrent_parent_completions_schedule_the_join_once() {
    for _ in 0..200 {
        let graph = GraphBuilder::new()
            .local("left", &[])
            .local("right", &[])
            .local("join", &["left", "right"])
            .build();
        let instance = Arc::new(GraphExecutionInstance::new(graph, &CancellationToken::new()));
        instance.seed().unwrap();
        assert_eq!(instance.queue().drain().len(), 2);

        let barrier = Arc::new(Barrier::new(2));
        let finishers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|parent| {
                let instance = Arc::clone(&instance);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    instance
                        .finish_task(parent, true, SchedulingBehaviour::ContinueInline)
                        .unwrap()
                        .inline_next
                })
            })
            .collect();

        let inline: Vec<String> = finishers
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();
        let queued = instance.queue().drain();

        assert_eq!(inline.len() + queued.len(), 1);
        assert_eq!(inline.into_iter().chain(queued).collect::<Vec<_>>(), ["join"]);
        assert_eq!(instance.status_of("join"), Some(GraphTaskStatus::Scheduled));
    }
}
