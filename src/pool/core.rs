// src/pool/core.rs

//! A single reserved unit of execution capacity.

use std::fmt;

use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::exec::protocol::{ExecuteTaskRequest, ProcessResponse};
use crate::types::{BoxFuture, CoreLocation};

/// Identity of a worker core, as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerCoreInfo {
    pub machine_name: String,
    pub core_number: u32,
    /// Unique per reservation, never reused within a provider.
    pub assignment_id: u64,
}

impl fmt::Display for WorkerCoreInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} (assignment {})",
            self.machine_name, self.core_number, self.assignment_id
        )
    }
}

/// Duplex request/response connection to a worker core.
///
/// One execute request is answered by a stream of responses ending with
/// exactly one exit code. `next_response` returning `Ok(None)` before the exit
/// code means the connection was lost.
pub trait CoreConnection: Send {
    fn send_execute(&mut self, request: ExecuteTaskRequest) -> BoxFuture<'_, Result<()>>;

    fn next_response(&mut self) -> BoxFuture<'_, Result<Option<ProcessResponse>>>;
}

/// Capacity held by a reserved core; released on drop.
pub struct CoreLease {
    permit: Option<OwnedSemaphorePermit>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CoreLease {
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
            on_release: None,
        }
    }

    /// A lease that holds nothing; used by fakes and one-off cores.
    pub fn detached() -> Self {
        Self {
            permit: None,
            on_release: None,
        }
    }

    /// Run `f` when the lease is released, before the permit is returned.
    pub fn on_release(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        if let Some(f) = self.on_release.take() {
            f();
        }
    }
}

impl fmt::Debug for CoreLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreLease")
            .field("holds_permit", &self.permit.is_some())
            .finish_non_exhaustive()
    }
}

/// A reserved worker core.
///
/// Exclusively owned by the task that reserved it; its capacity goes back to
/// the provider when the value is dropped.
pub struct WorkerCore {
    info: WorkerCoreInfo,
    location: CoreLocation,
    alive: bool,
    connection: Box<dyn CoreConnection>,
    lease: CoreLease,
}

impl WorkerCore {
    pub fn new(
        info: WorkerCoreInfo,
        location: CoreLocation,
        connection: Box<dyn CoreConnection>,
        lease: CoreLease,
    ) -> Self {
        Self {
            info,
            location,
            alive: true,
            connection,
            lease,
        }
    }

    pub fn info(&self) -> &WorkerCoreInfo {
        &self.info
    }

    pub fn location(&self) -> CoreLocation {
        self.location
    }

    pub fn is_local(&self) -> bool {
        self.location == CoreLocation::Local
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Flag the core as unusable after its connection dropped. A dead core
    /// refuses every later request.
    pub fn mark_dead(&mut self) {
        if self.alive {
            debug!(core = %self.info, "marking worker core dead");
        }
        self.alive = false;
    }

    pub async fn send_execute(&mut self, request: ExecuteTaskRequest) -> Result<()> {
        if !self.is_alive() {
            return Err(EngineError::Disconnected);
        }
        self.connection.send_execute(request).await
    }

    pub async fn next_response(&mut self) -> Result<Option<ProcessResponse>> {
        self.connection.next_response().await
    }
}

impl fmt::Debug for WorkerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCore")
            .field("info", &self.info)
            .field("location", &self.location)
            .field("alive", &self.alive)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dag::{CopyTaskDescriptor, TaskDescriptor};

    fn copy_request() -> ExecuteTaskRequest {
        ExecuteTaskRequest::new(TaskDescriptor::Copy(CopyTaskDescriptor {
            from: "a.o".into(),
            to: "out/a.o".into(),
        }))
    }

    struct CountingConnection(Arc<AtomicUsize>);

    impl CoreConnection for CountingConnection {
        fn send_execute(&mut self, _request: ExecuteTaskRequest) -> BoxFuture<'_, Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn next_response(&mut self) -> BoxFuture<'_, Result<Option<ProcessResponse>>> {
            Box::pin(async { Ok(None) })
        }
    }

    #[tokio::test]
    async fn dead_core_refuses_further_requests() {
        let sent = Arc::new(AtomicUsize::new(0));
        let info = WorkerCoreInfo {
            machine_name: "build-01".into(),
            core_number: 0,
            assignment_id: 1,
        };
        let mut core = WorkerCore::new(
            info,
            CoreLocation::Remote,
            Box::new(CountingConnection(Arc::clone(&sent))),
            CoreLease::detached(),
        );

        core.send_execute(copy_request()).await.unwrap();
        core.mark_dead();
        assert!(!core.is_alive());
        assert!(matches!(
            core.send_execute(copy_request()).await,
            Err(EngineError::Disconnected)
        ));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }
}
