// tests/worker_pool.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use corefarm::dag::{LocalTaskDescriptor, TaskDescriptor};
use corefarm::errors::EngineError;
use corefarm::exec::{ExecuteTaskRequest, ExecutionManager, ProcessExecutor, ProcessResponse};
use corefarm::pool::{
    LocalWorkerCoreProvider, RemoteWorkerCoreProvider, WorkerCore, WorkerCoreProvider, WorkerPool,
};
use corefarm::types::{CoreLocation, CorePreference};

use crate::common::fakes::{FakeTransport, RemoteScript, ScriptedProcessExecutor, ScriptedRun};
use crate::common::{init_tracing, with_timeout};

fn local_provider(exec: &Arc<ScriptedProcessExecutor>, cores: usize) -> Arc<LocalWorkerCoreProvider> {
    let manager = Arc::new(ExecutionManager::new(Arc::clone(exec) as Arc<dyn ProcessExecutor>, std::env::temp_dir()));
    Arc::new(LocalWorkerCoreProvider::new("local", cores, manager))
}

fn remote_provider(transport: &FakeTransport, cores: usize) -> Arc<RemoteWorkerCoreProvider> {
    Arc::new(RemoteWorkerCoreProvider::new(
        "remote",
        cores,
        Arc::new(transport.clone()),
    ))
}

async fn reserve(pool: &WorkerPool, preference: CorePreference) -> WorkerCore {
    with_timeout(pool.reserve_core(preference, CancellationToken::new()).into_core())
        .await
        .expect("core reservation failed")
}

async fn collect_until_exit(core: &mut WorkerCore) -> Vec<ProcessResponse> {
    let mut responses = Vec::new();
    while let Some(response) = with_timeout(core.next_response()).await.unwrap() {
        let done = matches!(response, ProcessResponse::ExitCode(_));
        responses.push(response);
        if done {
            break;
        }
    }
    responses
}

#[tokio::test]
async fn prefer_remote_uses_free_remote_capacity() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let transport = FakeTransport::new("build-01");
    let pool = WorkerPool::new();
    pool.add_provider(local_provider(&exec, 1));
    pool.add_provider(remote_provider(&transport, 1));

    let core = reserve(&pool, CorePreference::PreferRemote).await;

    assert_eq!(core.location(), CoreLocation::Remote);
    assert_eq!(core.info().machine_name, "build-01");
    assert_eq!(transport.reservations(), 1);
    assert_eq!(pool.statistics().fulfilled_remote, 1);
}

#[tokio::test]
async fn prefer_remote_falls_back_to_local_when_remote_is_full() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let transport = FakeTransport::new("build-01");
    let pool = WorkerPool::new();
    pool.add_provider(local_provider(&exec, 1));
    pool.add_provider(remote_provider(&transport, 1));

    let _remote = reserve(&pool, CorePreference::PreferRemote).await;
    let fallback = reserve(&pool, CorePreference::PreferRemote).await;

    assert_eq!(fallback.location(), CoreLocation::Local);
    let stats = pool.statistics();
    assert_eq!(stats.fulfilled_local, 1);
    assert_eq!(stats.fulfilled_remote, 1);
}

#[tokio::test]
async fn require_local_without_local_provider_fails_immediately() {
    let transport = FakeTransport::new("build-01");
    let pool = WorkerPool::new();
    pool.add_provider(remote_provider(&transport, 4));

    let mut request = pool.reserve_core(CorePreference::RequireLocal, CancellationToken::new());
    let err = with_timeout(request.wait_for_core()).await.unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(transport.reservations(), 0);
}

#[tokio::test]
async fn waiting_request_is_fulfilled_once_a_core_is_released() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let pool = WorkerPool::new();
    pool.add_provider(local_provider(&exec, 1));

    let held = reserve(&pool, CorePreference::RequireLocal).await;
    let mut waiting = pool.reserve_core(CorePreference::RequireLocal, CancellationToken::new());

    let early = tokio::time::timeout(Duration::from_millis(50), waiting.wait_for_core()).await;
    assert!(early.is_err(), "only one core exists");
    assert!(!waiting.is_fulfilled());
    assert_eq!(pool.statistics().unfulfilled_local, 1);

    let held_number = held.info().core_number;
    drop(held);

    let core = with_timeout(waiting.wait_for_core()).await.unwrap();
    assert_eq!(core.info().core_number, held_number);
    assert!(waiting.is_fulfilled());
    assert_eq!(pool.statistics().unfulfilled_local, 0);
}

#[tokio::test]
async fn cancelled_request_reports_cancellation() {
    let exec = ScriptedProcessExecutor::new();
    let pool = WorkerPool::new();
    pool.add_provider(local_provider(&exec, 1));
    let _held = reserve(&pool, CorePreference::RequireLocal).await;

    let cancel = CancellationToken::new();
    let mut request = pool.reserve_core(CorePreference::RequireLocal, cancel.clone());
    cancel.cancel();

    let err = with_timeout(request.wait_for_core()).await.unwrap_err();
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn dropping_a_pending_request_does_not_leak_capacity() {
    let exec = ScriptedProcessExecutor::new();
    let provider = local_provider(&exec, 1);
    let pool = WorkerPool::new();
    pool.add_provider(provider.clone());

    let held = reserve(&pool, CorePreference::RequireLocal).await;
    let pending = pool.reserve_core(CorePreference::RequireLocal, CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(pending);
    drop(held);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(provider.available_cores(), 1);
}

#[tokio::test]
async fn refusing_remote_is_removed_and_reservation_moves_on() {
    init_tracing();
    let exec = ScriptedProcessExecutor::new();
    let transport = FakeTransport::new("build-01");
    transport.refuse_reservations();

    let pool = WorkerPool::new();
    let remote = remote_provider(&transport, 2);
    pool.add_provider(remote.clone());

    let mut request = pool.reserve_core(CorePreference::PreferRemote, CancellationToken::new());

    with_timeout(remote.disconnected().cancelled()).await;
    with_timeout(async {
        while pool.collection().get("remote").is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(remote.available_cores(), 0);
    assert!(!request.is_fulfilled());

    // A provider joining later serves the request that was still waiting.
    pool.add_provider(local_provider(&exec, 1));
    let core = with_timeout(request.wait_for_core()).await.unwrap();
    assert_eq!(core.location(), CoreLocation::Local);
}

#[tokio::test]
async fn collection_publishes_effective_changes_only() {
    let exec = ScriptedProcessExecutor::new();
    let pool = WorkerPool::new();
    let mut changes = pool.collection().subscribe();

    assert!(pool.add_provider(local_provider(&exec, 1)));
    assert!(!pool.add_provider(local_provider(&exec, 1)));
    assert!(pool.remove_provider("local"));
    assert!(!pool.remove_provider("local"));

    let added = changes.recv().await.unwrap();
    assert_eq!(added.added.len(), 1);
    assert_eq!(added.current.len(), 1);

    let removed = changes.recv().await.unwrap();
    assert_eq!(removed.removed.len(), 1);
    assert!(removed.current.is_empty());

    assert!(changes.try_recv().is_err());
    assert!(pool.collection().is_empty());
}

#[tokio::test]
async fn local_core_streams_execution_responses() {
    let exec = ScriptedProcessExecutor::new();
    exec.script("cc", ScriptedRun::lines(&["a.c"], 0));
    let pool = WorkerPool::new();
    pool.add_provider(local_provider(&exec, 1));

    let mut core = reserve(&pool, CorePreference::RequireLocal).await;
    let request = ExecuteTaskRequest::new(TaskDescriptor::Local(LocalTaskDescriptor {
        path: "cc".into(),
        arguments: Vec::new(),
        working_directory: Default::default(),
        environment: Default::default(),
    }));
    core.send_execute(request.clone()).await.unwrap();

    // One execution at a time per core.
    let busy = core.send_execute(request).await.unwrap_err();
    assert!(matches!(busy, EngineError::ProtocolViolation(_)));

    let responses = collect_until_exit(&mut core).await;
    assert_eq!(
        responses,
        [
            ProcessResponse::StandardOutputLine("a.c".into()),
            ProcessResponse::ExitCode(0)
        ]
    );
}

#[tokio::test]
async fn remote_core_reports_lost_connection() {
    let transport = FakeTransport::new("build-01");
    transport.script(RemoteScript::Disconnect(vec![ProcessResponse::StandardOutputLine(
        "partial".into(),
    )]));
    let pool = WorkerPool::new();
    pool.add_provider(remote_provider(&transport, 1));

    let mut core = reserve(&pool, CorePreference::PreferRemote).await;
    let request = ExecuteTaskRequest::new(TaskDescriptor::Local(LocalTaskDescriptor {
        path: "cc".into(),
        arguments: Vec::new(),
        working_directory: Default::default(),
        environment: Default::default(),
    }));
    core.send_execute(request).await.unwrap();

    assert_eq!(
        with_timeout(core.next_response()).await.unwrap(),
        Some(ProcessResponse::StandardOutputLine("partial".into()))
    );
    assert_eq!(with_timeout(core.next_response()).await.unwrap(), None);
    assert_eq!(transport.requests().len(), 1);
}
