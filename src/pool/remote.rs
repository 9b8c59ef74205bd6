// src/pool/remote.rs

//! Worker cores on another machine, reserved over a duplex RPC stream.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result};
use crate::exec::protocol::{CoreRequest, CoreResponse, ExecuteTaskRequest, ProcessResponse};
use crate::pool::core::{CoreConnection, CoreLease, WorkerCore};
use crate::pool::provider::WorkerCoreProvider;
use crate::types::{BoxFuture, CoreLocation};

/// One bidirectional request/response stream to a remote worker.
pub trait DuplexStream: Send {
    fn send(&mut self, request: CoreRequest) -> BoxFuture<'_, Result<()>>;

    /// Next response, or `Ok(None)` once the remote end closed the stream.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<CoreResponse>>>;
}

/// Opens streams to a remote worker.
pub trait RemoteTransport: Send + Sync {
    fn open_stream(&self) -> BoxFuture<'_, Result<Box<dyn DuplexStream>>>;
}

/// Provider backed by a remote worker advertising `cores` slots.
///
/// Every reservation opens a fresh stream, sends
/// [`CoreRequest::ReserveCore`] and expects
/// [`CoreResponse::ReserveCore`] back. Any other answer marks the provider
/// disconnected.
pub struct RemoteWorkerCoreProvider {
    id: String,
    transport: Arc<dyn RemoteTransport>,
    capacity: Arc<Semaphore>,
    disconnected: CancellationToken,
}

impl RemoteWorkerCoreProvider {
    pub fn new(id: impl Into<String>, cores: usize, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            id: id.into(),
            transport,
            capacity: Arc::new(Semaphore::new(cores)),
            disconnected: CancellationToken::new(),
        }
    }

    fn unavailable(&self, reason: impl fmt::Display) -> EngineError {
        warn!(provider = %self.id, %reason, "remote provider failed; marking disconnected");
        self.disconnected.cancel();
        EngineError::CoreUnavailable(format!("provider {}: {reason}", self.id))
    }

    async fn reserve(&self, cancel: CancellationToken) -> Result<WorkerCore> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.capacity).acquire_owned() => {
                permit.map_err(|_| EngineError::CoreUnavailable(format!("provider {} closed", self.id)))?
            }
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = self.disconnected.cancelled() => {
                return Err(EngineError::CoreUnavailable(format!("provider {} disconnected", self.id)));
            }
        };

        let handshake = async {
            let mut stream = self
                .transport
                .open_stream()
                .await
                .map_err(|e| self.unavailable(format!("opening stream failed: {e}")))?;
            stream
                .send(CoreRequest::ReserveCore)
                .await
                .map_err(|e| self.unavailable(format!("sending reservation failed: {e}")))?;
            match stream.recv().await {
                Ok(Some(CoreResponse::ReserveCore(info))) => Ok((stream, info)),
                Ok(Some(other)) => Err(self.unavailable(format!(
                    "unexpected reservation response {other:?}"
                ))),
                Ok(None) => Err(self.unavailable("stream closed during reservation")),
                Err(e) => Err(self.unavailable(format!("reservation failed: {e}"))),
            }
        };

        let (stream, info) = tokio::select! {
            res = handshake => res?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        info!(provider = %self.id, core = %info, "reserved remote core");
        Ok(WorkerCore::new(
            info,
            CoreLocation::Remote,
            Box::new(RemoteCoreConnection { stream }),
            CoreLease::new(permit),
        ))
    }
}

impl fmt::Debug for RemoteWorkerCoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWorkerCoreProvider")
            .field("id", &self.id)
            .field("available", &self.capacity.available_permits())
            .field("disconnected", &self.disconnected.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkerCoreProvider for RemoteWorkerCoreProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> CoreLocation {
        CoreLocation::Remote
    }

    fn available_cores(&self) -> usize {
        if self.disconnected.is_cancelled() {
            0
        } else {
            self.capacity.available_permits()
        }
    }

    fn request_core(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<WorkerCore>> {
        Box::pin(self.reserve(cancel))
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }
}

struct RemoteCoreConnection {
    stream: Box<dyn DuplexStream>,
}

impl CoreConnection for RemoteCoreConnection {
    fn send_execute(&mut self, request: ExecuteTaskRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.stream.send(CoreRequest::ExecuteTask(request)).await })
    }

    fn next_response(&mut self) -> BoxFuture<'_, Result<Option<ProcessResponse>>> {
        Box::pin(async move {
            match self.stream.recv().await? {
                Some(CoreResponse::Process(response)) => Ok(Some(response)),
                Some(CoreResponse::ReserveCore(info)) => {
                    debug!(core = %info, "reservation response on an execution stream");
                    Err(EngineError::ProtocolViolation(format!(
                        "unexpected reservation response for {info} during execution"
                    )))
                }
                None => Ok(None),
            }
        })
    }
}
