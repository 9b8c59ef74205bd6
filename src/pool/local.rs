// src/pool/local.rs

//! Worker cores on this machine.
//!
//! Each reserved local core gets an in-process connection that runs requests
//! through an [`ExecutionManager`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::exec::ExecutionManager;
use crate::exec::protocol::{ExecuteTaskRequest, ProcessResponse};
use crate::pool::core::{CoreConnection, CoreLease, WorkerCore, WorkerCoreInfo};
use crate::pool::provider::WorkerCoreProvider;
use crate::types::{BoxFuture, CoreLocation};

const RESPONSE_CHANNEL_CAPACITY: usize = 256;

/// Provider for a fixed number of cores on the current machine.
///
/// Core numbers are stable slots `0..cores`; a slot is only reused after the
/// core holding it has been dropped.
pub struct LocalWorkerCoreProvider {
    id: String,
    machine_name: String,
    capacity: Arc<Semaphore>,
    free_slots: Arc<Mutex<BTreeSet<u32>>>,
    next_assignment: AtomicU64,
    manager: Arc<ExecutionManager>,
    disconnected: CancellationToken,
}

impl LocalWorkerCoreProvider {
    pub fn new(id: impl Into<String>, cores: usize, manager: Arc<ExecutionManager>) -> Self {
        let cores = cores.max(1);
        Self {
            id: id.into(),
            machine_name: "localhost".to_string(),
            capacity: Arc::new(Semaphore::new(cores)),
            free_slots: Arc::new(Mutex::new((0..cores as u32).collect())),
            next_assignment: AtomicU64::new(1),
            manager,
            disconnected: CancellationToken::new(),
        }
    }

    async fn reserve(&self, cancel: CancellationToken) -> Result<WorkerCore> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.capacity).acquire_owned() => {
                permit.map_err(|_| EngineError::CoreUnavailable(format!("provider {} closed", self.id)))?
            }
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let slot = self
            .free_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_first()
            .ok_or_else(|| {
                EngineError::CoreUnavailable(format!("provider {} has no free core slot", self.id))
            })?;

        let info = WorkerCoreInfo {
            machine_name: self.machine_name.clone(),
            core_number: slot,
            assignment_id: self.next_assignment.fetch_add(1, Ordering::Relaxed),
        };
        debug!(provider = %self.id, core = %info, "reserved local core");

        let free_slots = Arc::clone(&self.free_slots);
        let lease = CoreLease::new(permit).on_release(move || {
            free_slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(slot);
        });

        let connection = LocalCoreConnection::new(Arc::clone(&self.manager));
        Ok(WorkerCore::new(
            info,
            CoreLocation::Local,
            Box::new(connection),
            lease,
        ))
    }
}

impl fmt::Debug for LocalWorkerCoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWorkerCoreProvider")
            .field("id", &self.id)
            .field("machine_name", &self.machine_name)
            .field("available", &self.capacity.available_permits())
            .finish_non_exhaustive()
    }
}

impl WorkerCoreProvider for LocalWorkerCoreProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> CoreLocation {
        CoreLocation::Local
    }

    fn available_cores(&self) -> usize {
        self.capacity.available_permits()
    }

    fn request_core(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<WorkerCore>> {
        Box::pin(self.reserve(cancel))
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }
}

/// In-process connection: each execute request runs on a spawned task that
/// drives the execution manager.
struct LocalCoreConnection {
    manager: Arc<ExecutionManager>,
    running: Option<RunningExecution>,
    shutdown: CancellationToken,
}

struct RunningExecution {
    responses: mpsc::Receiver<ProcessResponse>,
    handle: JoinHandle<Result<()>>,
}

impl LocalCoreConnection {
    fn new(manager: Arc<ExecutionManager>) -> Self {
        Self {
            manager,
            running: None,
            shutdown: CancellationToken::new(),
        }
    }

    fn start(&mut self, request: ExecuteTaskRequest) -> Result<()> {
        if self.running.is_some() {
            return Err(EngineError::ProtocolViolation(
                "execute request sent while another execution is in progress".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let manager = Arc::clone(&self.manager);
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(async move { manager.execute(&request, tx, cancel).await });

        self.running = Some(RunningExecution {
            responses: rx,
            handle,
        });
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<ProcessResponse>> {
        let Some(running) = self.running.as_mut() else {
            return Err(EngineError::ProtocolViolation(
                "no execution in progress on this core".to_string(),
            ));
        };

        if let Some(response) = running.responses.recv().await {
            return Ok(Some(response));
        }

        // Sender dropped: the manager has returned, surface its outcome.
        let Some(running) = self.running.take() else {
            return Ok(None);
        };
        match running.handle.await {
            Ok(Ok(())) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(join_err) => {
                warn!(error = %join_err, "local execution task failed");
                Err(EngineError::Other(anyhow::anyhow!(
                    "local execution task failed: {join_err}"
                )))
            }
        }
    }
}

impl CoreConnection for LocalCoreConnection {
    fn send_execute(&mut self, request: ExecuteTaskRequest) -> BoxFuture<'_, Result<()>> {
        let started = self.start(request);
        Box::pin(async move { started })
    }

    fn next_response(&mut self) -> BoxFuture<'_, Result<Option<ProcessResponse>>> {
        Box::pin(self.next())
    }
}

impl Drop for LocalCoreConnection {
    fn drop(&mut self) {
        // Kills any process still running for a released core.
        self.shutdown.cancel();
    }
}
