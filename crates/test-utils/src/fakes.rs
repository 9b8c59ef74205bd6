use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corefarm::blob::{BlobSynchroniser, BlobTransferStats, InputBlobHashes, ToolHash};
use corefarm::dag::{SpecDescriptorFactory, TaskDescriptor, TaskDescriptorFactory, TaskSpec};
use corefarm::errors::{EngineError, Result};
use corefarm::exec::{
    CoreRequest, CoreResponse, ExecuteTaskRequest, ExecutionManager, ProcessExecutor,
    ProcessResponse, ProcessSpec,
};
use corefarm::pool::{DuplexStream, LocalWorkerCoreProvider, RemoteTransport, WorkerCoreInfo, WorkerPool};
use corefarm::types::BoxFuture;

/// What one scripted process run does.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub responses: Vec<ProcessResponse>,
    /// Sleep before emitting anything.
    pub delay: Duration,
    /// After the responses, wait for cancellation instead of returning.
    pub hang: bool,
}

impl ScriptedRun {
    pub fn exit(code: i32) -> Self {
        Self::lines(&[], code)
    }

    /// Stdout lines followed by an exit code.
    pub fn lines(lines: &[&str], code: i32) -> Self {
        let mut responses: Vec<ProcessResponse> = lines
            .iter()
            .map(|l| ProcessResponse::StandardOutputLine(l.to_string()))
            .collect();
        responses.push(ProcessResponse::ExitCode(code));
        Self {
            responses,
            ..Self::default()
        }
    }

    /// Responses exactly as given, without an implied exit code.
    pub fn raw(responses: Vec<ProcessResponse>) -> Self {
        Self {
            responses,
            ..Self::default()
        }
    }

    /// Emits `lines` and then never exits on its own.
    pub fn hang(lines: &[&str]) -> Self {
        Self {
            responses: lines
                .iter()
                .map(|l| ProcessResponse::StandardOutputLine(l.to_string()))
                .collect(),
            hang: true,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A process executor that replays scripted runs keyed by the file name of
/// the program, and records every spec it was asked to run.
///
/// Programs without a script left exit with code 0.
#[derive(Debug, Default)]
pub struct ScriptedProcessExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedRun>>>,
    executed: Mutex<Vec<ProcessSpec>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedProcessExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `run` for the next execution of `program`.
    pub fn script(&self, program: &str, run: ScriptedRun) {
        self.scripts
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(run);
    }

    pub fn executed(&self) -> Vec<ProcessSpec> {
        self.executed.lock().unwrap().clone()
    }

    /// File names of executed programs, in start order.
    pub fn executed_programs(&self) -> Vec<String> {
        self.executed()
            .iter()
            .map(|spec| program_name(&spec.path))
            .collect()
    }

    /// Highest number of runs that were in progress at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_run(&self, spec: &ProcessSpec) -> ScriptedRun {
        self.executed.lock().unwrap().push(spec.clone());
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&program_name(&spec.path))
            .and_then(|runs| runs.pop_front())
            .unwrap_or_else(|| ScriptedRun::exit(0))
    }

    async fn play(
        &self,
        run: ScriptedRun,
        output: mpsc::Sender<ProcessResponse>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !run.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(run.delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
        for response in run.responses {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if output.send(response).await.is_err() {
                return Err(EngineError::Other(anyhow::anyhow!("scripted output receiver dropped")));
            }
        }
        if run.hang {
            cancel.cancelled().await;
        }
        Ok(())
    }
}

fn program_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl ProcessExecutor for ScriptedProcessExecutor {
    fn execute(
        &self,
        spec: ProcessSpec,
        output: mpsc::Sender<ProcessResponse>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let run = self.next_run(&spec);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let res = self.play(run, output, cancel).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            res
        })
    }
}

/// A pool with one local provider of `cores` cores backed by `executor`.
///
/// Must be called from within a Tokio runtime.
pub fn local_pool(executor: Arc<ScriptedProcessExecutor>, cores: usize) -> Arc<WorkerPool> {
    let manager = Arc::new(ExecutionManager::new(executor, std::env::temp_dir()));
    let pool = Arc::new(WorkerPool::new());
    pool.add_provider(Arc::new(LocalWorkerCoreProvider::new("local", cores, manager)));
    pool
}

/// What a fake remote worker does with one execute request.
#[derive(Debug, Clone)]
pub enum RemoteScript {
    /// Send these responses, then keep the stream open.
    Respond(Vec<ProcessResponse>),
    /// Send these responses, then close the stream.
    Disconnect(Vec<ProcessResponse>),
}

#[derive(Debug, Default)]
struct TransportState {
    scripts: Mutex<VecDeque<RemoteScript>>,
    requests: Mutex<Vec<ExecuteTaskRequest>>,
    reservations: AtomicUsize,
    refuse: AtomicBool,
    next_assignment: AtomicU32,
}

/// In-memory transport to a fake remote worker.
///
/// Execute requests without a script left answer with exit code 0.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    machine_name: String,
    state: Arc<TransportState>,
}

impl FakeTransport {
    pub fn new(machine_name: &str) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            state: Arc::new(TransportState::default()),
        }
    }

    pub fn script(&self, script: RemoteScript) {
        self.state.scripts.lock().unwrap().push_back(script);
    }

    /// Answer every later reservation with something other than a core.
    pub fn refuse_reservations(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ExecuteTaskRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn reservations(&self) -> usize {
        self.state.reservations.load(Ordering::SeqCst)
    }
}

impl RemoteTransport for FakeTransport {
    fn open_stream(&self) -> BoxFuture<'_, Result<Box<dyn DuplexStream>>> {
        let stream = FakeStream {
            machine_name: self.machine_name.clone(),
            state: Arc::clone(&self.state),
            pending: VecDeque::new(),
            closed: false,
        };
        Box::pin(async move { Ok(Box::new(stream) as Box<dyn DuplexStream>) })
    }
}

struct FakeStream {
    machine_name: String,
    state: Arc<TransportState>,
    pending: VecDeque<CoreResponse>,
    closed: bool,
}

impl DuplexStream for FakeStream {
    fn send(&mut self, request: CoreRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(EngineError::Disconnected);
            }
            match request {
                CoreRequest::ReserveCore => {
                    if self.state.refuse.load(Ordering::SeqCst) {
                        self.pending
                            .push_back(CoreResponse::Process(ProcessResponse::ExitCode(1)));
                        return Ok(());
                    }
                    self.state.reservations.fetch_add(1, Ordering::SeqCst);
                    let assignment = self.state.next_assignment.fetch_add(1, Ordering::SeqCst);
                    self.pending.push_back(CoreResponse::ReserveCore(WorkerCoreInfo {
                        machine_name: self.machine_name.clone(),
                        core_number: 0,
                        assignment_id: u64::from(assignment) + 1,
                    }));
                }
                CoreRequest::ExecuteTask(request) => {
                    self.state.requests.lock().unwrap().push(request);
                    let script = self
                        .state
                        .scripts
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| RemoteScript::Respond(vec![ProcessResponse::ExitCode(0)]));
                    let (responses, close) = match script {
                        RemoteScript::Respond(r) => (r, false),
                        RemoteScript::Disconnect(r) => (r, true),
                    };
                    self.pending
                        .extend(responses.into_iter().map(CoreResponse::Process));
                    self.closed = close;
                }
            }
            Ok(())
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<CoreResponse>>> {
        Box::pin(async move {
            if let Some(response) = self.pending.pop_front() {
                return Ok(Some(response));
            }
            if self.closed {
                return Ok(None);
            }
            std::future::pending().await
        })
    }
}

/// Blob synchroniser that moves nothing and records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingBlobSynchroniser {
    calls: Mutex<Vec<String>>,
}

impl RecordingBlobSynchroniser {
    pub const DIGEST: u64 = 0x00c0_ffee;

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BlobSynchroniser for RecordingBlobSynchroniser {
    fn hash_tool<'a>(
        &'a self,
        tool: &'a Path,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<ToolHash>> {
        Box::pin(async move {
            self.record(format!("hash_tool {}", tool.display()));
            Ok(ToolHash {
                path: tool.to_path_buf(),
                hash: format!("{:064x}", Self::DIGEST),
                digest: Self::DIGEST,
                size: 0,
            })
        })
    }

    fn hash_input_blobs<'a>(
        &'a self,
        inputs: &'a [PathBuf],
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<InputBlobHashes>> {
        Box::pin(async move {
            self.record(format!("hash_inputs {}", inputs.len()));
            Ok(InputBlobHashes::default())
        })
    }

    fn synchronise_tool_and_get_digest<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        _tool: &'a ToolHash,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.record(format!("sync_tool {}", core.machine_name));
            Ok(Self::DIGEST)
        })
    }

    fn synchronise_input_blobs<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        _inputs: &'a InputBlobHashes,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<BlobTransferStats>> {
        Box::pin(async move {
            self.record(format!("sync_inputs {}", core.machine_name));
            Ok(BlobTransferStats::default())
        })
    }

    fn synchronise_output_blobs<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        _outputs: &'a [PathBuf],
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<BlobTransferStats>> {
        Box::pin(async move {
            self.record(format!("sync_outputs {}", core.machine_name));
            Ok(BlobTransferStats::default())
        })
    }
}

/// Descriptor factory that records the `can_run_locally` hint per tool and
/// otherwise describes specs from their fields.
#[derive(Debug, Default)]
pub struct RecordingDescriptorFactory {
    hints: Mutex<BTreeMap<String, bool>>,
}

impl RecordingDescriptorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `can_run_locally` as passed for the task running `tool`.
    pub fn hint_for(&self, tool: &str) -> Option<bool> {
        self.hints.lock().unwrap().get(tool).copied()
    }
}

impl TaskDescriptorFactory for RecordingDescriptorFactory {
    fn create_descriptor_for_task_spec<'a>(
        &'a self,
        spec: &'a TaskSpec,
        can_run_locally: bool,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<TaskDescriptor>> {
        Box::pin(async move {
            self.hints
                .lock()
                .unwrap()
                .insert(program_name(&spec.tool), can_run_locally);
            SpecDescriptorFactory::describe(spec)
        })
    }
}
