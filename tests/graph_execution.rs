// tests/graph_execution.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use corefarm::dag::{Graph, SpecDescriptorFactory, Task, TaskKind, TaskSpec};
use corefarm::engine::task_runner::TaskContext;
use corefarm::engine::{
    EngineOptions, GraphExecutionInstance, GraphExecutor, JobCompletionStatus, JobResponse,
    ResponseSink, TaskCompletionStatus,
};
use corefarm::exec::AutoRecoveryPolicy;
use corefarm::errors::EngineError;
use corefarm::types::GraphTaskStatus;

use crate::common::builders::GraphBuilder;
use crate::common::fakes::{
    RecordingBlobSynchroniser, RecordingDescriptorFactory, ScriptedProcessExecutor, ScriptedRun,
    local_pool,
};
use crate::common::{
    completion_of, count_for, drain_responses, init_tracing, is_completed, is_started, output_of,
    with_timeout,
};

fn executor_for(exec: &Arc<ScriptedProcessExecutor>, cores: usize) -> GraphExecutor {
    GraphExecutor::new(
        local_pool(Arc::clone(exec), cores),
        Arc::new(SpecDescriptorFactory),
        RecordingBlobSynchroniser::new(),
    )
}

async fn run(
    executor: &GraphExecutor,
    graph: Arc<Graph>,
    cancel: CancellationToken,
) -> (JobCompletionStatus, Vec<JobResponse>) {
    let (sink, rx) = ResponseSink::channel();
    let status = with_timeout(executor.execute(graph, sink, cancel))
        .await
        .expect("graph execution failed");
    (status, drain_responses(rx))
}

fn position(responses: &[JobResponse], pred: impl Fn(&JobResponse) -> bool) -> usize {
    responses
        .iter()
        .position(pred)
        .expect("expected response not found")
}

#[tokio::test]
async fn fan_out_and_join_succeeds_in_dependency_order() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    exec.script("a", ScriptedRun::lines(&["compiling a", "done a"], 0));

    let graph = GraphBuilder::new()
        .local("gen", &[])
        .local("a", &["gen"])
        .local("b", &["gen"])
        .local("link", &["a", "b"])
        .build();

    let executor = executor_for(&exec, 2);
    let (status, responses) = run(&executor, graph, CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Success);
    assert_eq!(responses.first(), Some(&JobResponse::JobParsed { total_tasks: 4 }));
    match responses.last() {
        Some(JobResponse::JobComplete { status, statistics, .. }) => {
            assert_eq!(*status, JobCompletionStatus::Success);
            assert_eq!(statistics.count(GraphTaskStatus::CompletedSuccessfully), 4);
        }
        other => panic!("expected JobComplete last, got {other:?}"),
    }

    for task in ["gen", "a", "b", "link"] {
        assert_eq!(count_for(&responses, task, is_started), 1, "{task} started once");
        assert_eq!(count_for(&responses, task, is_completed), 1, "{task} completed once");
        assert_eq!(completion_of(&responses, task), Some(TaskCompletionStatus::Success));
    }
    assert_eq!(output_of(&responses, "a"), ["compiling a", "done a"]);

    let link_started = position(&responses, |r| is_started(r) && r.task() == Some("link"));
    for dep in ["a", "b"] {
        let dep_completed = position(&responses, |r| is_completed(r) && r.task() == Some(dep));
        assert!(dep_completed < link_started, "{dep} must complete before link starts");
    }

    let programs = exec.executed_programs();
    assert_eq!(programs.first().map(String::as_str), Some("gen"));
    assert_eq!(programs.last().map(String::as_str), Some("link"));
}

#[tokio::test]
async fn failure_cancels_transitive_dependents_only() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    exec.script("a", ScriptedRun::lines(&["error: boom"], 2));

    let graph = GraphBuilder::new()
        .local("a", &[])
        .local("b", &["a"])
        .local("c", &["b"])
        .local("d", &[])
        .build();

    let executor = executor_for(&exec, 2);
    let (status, responses) = run(&executor, graph, CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Failure);
    assert_eq!(completion_of(&responses, "a"), Some(TaskCompletionStatus::Failure));
    assert_eq!(completion_of(&responses, "d"), Some(TaskCompletionStatus::Success));

    for task in ["b", "c"] {
        assert_eq!(completion_of(&responses, task), Some(TaskCompletionStatus::Cancelled));
        assert_eq!(count_for(&responses, task, is_started), 1);
        let started_without_worker = responses.iter().any(|r| {
            matches!(r, JobResponse::TaskStarted { task: t, worker: None, .. } if t == task)
        });
        assert!(started_without_worker, "{task} never got a worker");
    }

    let a_exit = responses.iter().find_map(|r| match r {
        JobResponse::TaskCompleted { task, exit_code, .. } if task == "a" => *exit_code,
        _ => None,
    });
    assert_eq!(a_exit, Some(2));

    let programs = exec.executed_programs();
    assert!(!programs.contains(&"b".to_string()));
    assert!(!programs.contains(&"c".to_string()));

    match responses.last() {
        Some(JobResponse::JobComplete { exception_message, statistics, .. }) => {
            assert!(exception_message.is_none());
            assert_eq!(statistics.count(GraphTaskStatus::CancelledDueToUpstreamFailures), 2);
        }
        other => panic!("expected JobComplete last, got {other:?}"),
    }
}

#[tokio::test]
async fn never_runs_more_tasks_than_cores() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let mut graph = GraphBuilder::new();
    for i in 0..6 {
        let name = format!("t{i}");
        exec.script(&name, ScriptedRun::exit(0).with_delay(Duration::from_millis(30)));
        graph = graph.local(&name, &[]);
    }

    let executor = executor_for(&exec, 2);
    let (status, responses) = run(&executor, graph.build(), CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Success);
    assert_eq!(exec.executed().len(), 6);
    assert!(exec.max_running() <= 2, "ran {} at once", exec.max_running());

    for response in &responses {
        if let JobResponse::TaskStarted { worker: Some(worker), .. } = response {
            assert!(worker.core_number < 2);
        }
    }
}

#[tokio::test]
async fn caller_cancellation_cancels_running_tasks() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    exec.script("forever", ScriptedRun::hang(&["still going"]));

    let graph = GraphBuilder::new()
        .local("forever", &[])
        .local("after", &["forever"])
        .build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let executor = executor_for(&exec, 1);
    let (status, responses) = run(&executor, graph, cancel).await;

    assert_eq!(status, JobCompletionStatus::Cancelled);
    assert_eq!(completion_of(&responses, "forever"), Some(TaskCompletionStatus::Cancelled));
    assert_eq!(completion_of(&responses, "after"), Some(TaskCompletionStatus::Cancelled));
    assert_eq!(exec.executed_programs(), ["forever"]);
    assert!(matches!(
        responses.last(),
        Some(JobResponse::JobComplete { status: JobCompletionStatus::Cancelled, .. })
    ));
}

#[tokio::test]
async fn empty_graph_is_rejected_before_any_response() {
    let exec = ScriptedProcessExecutor::new();
    let executor = executor_for(&exec, 1);
    let (sink, rx) = ResponseSink::channel();

    let graph = Arc::new(Graph::new(Vec::new()).unwrap());
    let err = executor
        .execute(graph, sink, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::EmptyGraph));
    assert!(drain_responses(rx).is_empty());
}

#[tokio::test]
async fn describing_task_runs_on_fast_local_core() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let descriptors = RecordingDescriptorFactory::new();
    let blobs = RecordingBlobSynchroniser::new();
    let executor = GraphExecutor::new(
        local_pool(Arc::clone(&exec), 1),
        descriptors.clone(),
        blobs.clone(),
    );

    let graph = GraphBuilder::new().remotable("compile", &[]).build();
    let (status, responses) = run(&executor, graph, CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Success);
    assert_eq!(descriptors.hint_for("compile"), Some(true));
    assert_eq!(exec.executed_programs(), ["compile"]);
    assert!(blobs.calls().is_empty(), "local execution must not touch blobs");

    let preparing = position(&responses, |r| matches!(r, JobResponse::TaskPreparing { .. }));
    let prepared = position(&responses, |r| matches!(r, JobResponse::TaskPrepared { .. }));
    assert!(preparing < prepared);
}

#[tokio::test]
async fn unexpected_error_cancels_the_whole_graph() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    exec.script("slow", ScriptedRun::hang(&[]));

    // No tool and no copy: the descriptor factory rejects it.
    let broken = Task::new("broken", TaskSpec::default(), TaskKind::Describing);
    let slow = Task::new(
        "slow",
        TaskSpec {
            tool: "slow".into(),
            ..TaskSpec::default()
        },
        TaskKind::FastExecutable,
    );
    let graph = Arc::new(Graph::new([broken, slow]).unwrap());

    let executor = executor_for(&exec, 2);
    let (status, responses) = run(&executor, graph, CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Failure);
    assert_eq!(completion_of(&responses, "broken"), Some(TaskCompletionStatus::Exception));
    assert_eq!(completion_of(&responses, "slow"), Some(TaskCompletionStatus::Cancelled));
    match responses.last() {
        Some(JobResponse::JobComplete { exception_message: Some(message), .. }) => {
            assert!(message.contains("broken"), "unexpected message: {message}");
        }
        other => panic!("expected JobComplete with a message, got {other:?}"),
    }
}

#[tokio::test]
async fn copy_task_copies_the_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let from = dir.path().join("a.o");
    let to = dir.path().join("out").join("a.o");
    std::fs::write(&from, b"object").unwrap();

    let stage = Task::new(
        "stage",
        TaskSpec {
            copy: Some((from.clone(), to.clone())),
            ..TaskSpec::default()
        },
        TaskKind::FastExecutable,
    );
    let graph = Arc::new(Graph::new([stage]).unwrap());

    let exec = ScriptedProcessExecutor::new();
    let executor = executor_for(&exec, 1);
    let (status, _) = run(&executor, graph, CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Success);
    assert_eq!(std::fs::read(&to).unwrap(), b"object");
    assert!(exec.executed().is_empty());
}

#[tokio::test]
async fn repeated_dependency_runs_the_dependent_once() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let graph = GraphBuilder::new().local("a", &[]).local("b", &["a", "a"]).build();

    let executor = executor_for(&exec, 2);
    let (status, responses) = run(&executor, graph, CancellationToken::new()).await;

    assert_eq!(status, JobCompletionStatus::Success);
    assert_eq!(exec.executed_programs(), ["a", "b"]);
    assert_eq!(count_for(&responses, "b", is_started), 1);
    assert_eq!(count_for(&responses, "b", is_completed), 1);
}

#[tokio::test]
async fn abandoned_ready_task_reports_itself_and_its_pending_dependents() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let graph = GraphBuilder::new()
        .local("c", &[])
        .local("d", &["c"])
        .local("e", &["d"])
        .build();

    let instance = Arc::new(GraphExecutionInstance::new(
        Arc::clone(&graph),
        &CancellationToken::new(),
    ));
    instance.seed().unwrap();
    instance.cancel_with("stalled");

    let (sink, rx) = ResponseSink::channel();
    let ctx = TaskContext {
        instance: Arc::clone(&instance),
        pool: local_pool(Arc::clone(&exec), 1),
        descriptors: Arc::new(SpecDescriptorFactory),
        blobs: RecordingBlobSynchroniser::new(),
        recovery: AutoRecoveryPolicy::default(),
        options: EngineOptions::default(),
        responses: sink,
    };

    for name in instance.queue().drain() {
        ctx.abandon(graph.task(&name).unwrap(), "build cancelled before the task started");
    }
    drop(ctx);
    let responses = drain_responses(rx);

    for task in ["c", "d", "e"] {
        assert_eq!(count_for(&responses, task, is_started), 1, "{task}");
        assert_eq!(count_for(&responses, task, is_completed), 1, "{task}");
        assert_eq!(completion_of(&responses, task), Some(TaskCompletionStatus::Cancelled));
    }
    assert_eq!(instance.status_of("c"), Some(GraphTaskStatus::CompletedUnsuccessfully));
    assert_eq!(
        instance.status_of("e"),
        Some(GraphTaskStatus::CancelledDueToUpstreamFailures)
    );
    assert!(instance.all_terminal());
    assert!(instance.queue().is_terminated());
    assert!(exec.executed_programs().is_empty());
}
