// src/pool/request.rs

//! A pending ask for a worker core.

use std::fmt;

use tokio::task::JoinHandle;

use crate::errors::{EngineError, Result};
use crate::pool::core::WorkerCore;
use crate::types::CorePreference;

enum RequestState {
    Pending(JoinHandle<Result<WorkerCore>>),
    Fulfilled(WorkerCore),
    Failed { cancelled: bool, message: String },
    Released,
}

/// Handle to a core reservation in progress.
///
/// The reservation is fulfilled at most once. Dropping the request releases
/// the core, whether it was already delivered or is still being reserved.
pub struct WorkerCoreRequest {
    preference: CorePreference,
    state: RequestState,
}

impl WorkerCoreRequest {
    pub(crate) fn pending(preference: CorePreference, handle: JoinHandle<Result<WorkerCore>>) -> Self {
        Self {
            preference,
            state: RequestState::Pending(handle),
        }
    }

    /// A request that has already failed; `wait_for_core` returns the error.
    pub(crate) fn failed(preference: CorePreference, error: EngineError) -> Self {
        Self {
            preference,
            state: Self::failed_state(error),
        }
    }

    fn failed_state(error: EngineError) -> RequestState {
        RequestState::Failed {
            cancelled: error.is_cancellation(),
            message: error.to_string(),
        }
    }

    pub fn preference(&self) -> CorePreference {
        self.preference
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.state, RequestState::Fulfilled(_))
    }

    /// Wait until a core is delivered.
    ///
    /// Safe to call again after the returned future was dropped mid-wait, and
    /// after completion (returns the same core or the same error).
    pub async fn wait_for_core(&mut self) -> Result<&mut WorkerCore> {
        if let RequestState::Pending(handle) = &mut self.state {
            let outcome = match handle.await {
                Ok(res) => res,
                Err(join_err) if join_err.is_cancelled() => Err(EngineError::Cancelled),
                Err(join_err) => Err(EngineError::Other(anyhow::anyhow!(
                    "core reservation task failed: {join_err}"
                ))),
            };
            self.state = match outcome {
                Ok(core) => RequestState::Fulfilled(core),
                Err(e) => Self::failed_state(e),
            };
        }

        match &mut self.state {
            RequestState::Fulfilled(core) => Ok(core),
            RequestState::Failed { cancelled: true, .. } => Err(EngineError::Cancelled),
            RequestState::Failed { message, .. } => Err(EngineError::CoreUnavailable(message.clone())),
            RequestState::Released => Err(EngineError::CoreUnavailable(
                "core was already taken from this request".to_string(),
            )),
            RequestState::Pending(_) => Err(EngineError::CoreUnavailable(
                "core reservation still pending".to_string(),
            )),
        }
    }

    /// Wait for the core and take ownership of it.
    pub async fn into_core(mut self) -> Result<WorkerCore> {
        self.wait_for_core().await?;
        match std::mem::replace(&mut self.state, RequestState::Released) {
            RequestState::Fulfilled(core) => Ok(core),
            _ => Err(EngineError::CoreUnavailable(
                "core reservation did not complete".to_string(),
            )),
        }
    }
}

impl Drop for WorkerCoreRequest {
    fn drop(&mut self) {
        if let RequestState::Pending(handle) = &self.state {
            handle.abort();
        }
    }
}

impl fmt::Debug for WorkerCoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            RequestState::Pending(_) => "pending",
            RequestState::Fulfilled(_) => "fulfilled",
            RequestState::Failed { .. } => "failed",
            RequestState::Released => "released",
        };
        f.debug_struct("WorkerCoreRequest")
            .field("preference", &self.preference)
            .field("state", &state)
            .finish()
    }
}
