// src/pool/worker_pool.rs

//! Arbitration of local and remote capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result};
use crate::pool::collection::WorkerCoreProviderCollection;
use crate::pool::core::WorkerCore;
use crate::pool::provider::WorkerCoreProvider;
use crate::pool::request::WorkerCoreRequest;
use crate::types::{CoreLocation, CorePreference};

/// Point-in-time counters for the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub unfulfilled_local: usize,
    pub unfulfilled_remotable: usize,
    pub fulfilled_local: usize,
    pub fulfilled_remote: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    unfulfilled_local: AtomicUsize,
    unfulfilled_remotable: AtomicUsize,
    fulfilled_local: AtomicUsize,
    fulfilled_remote: AtomicUsize,
}

impl PoolCounters {
    fn unfulfilled(&self, preference: CorePreference) -> &AtomicUsize {
        match preference {
            CorePreference::RequireLocal => &self.unfulfilled_local,
            CorePreference::PreferRemote => &self.unfulfilled_remotable,
        }
    }

    fn snapshot(&self) -> PoolStatistics {
        PoolStatistics {
            unfulfilled_local: self.unfulfilled_local.load(Ordering::Relaxed),
            unfulfilled_remotable: self.unfulfilled_remotable.load(Ordering::Relaxed),
            fulfilled_local: self.fulfilled_local.load(Ordering::Relaxed),
            fulfilled_remote: self.fulfilled_remote.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the unfulfilled counter honest even if the reservation task is
/// aborted.
struct UnfulfilledGuard {
    counters: Arc<PoolCounters>,
    preference: CorePreference,
}

impl UnfulfilledGuard {
    fn new(counters: Arc<PoolCounters>, preference: CorePreference) -> Self {
        counters.unfulfilled(preference).fetch_add(1, Ordering::Relaxed);
        Self {
            counters,
            preference,
        }
    }
}

impl Drop for UnfulfilledGuard {
    fn drop(&mut self) {
        self.counters
            .unfulfilled(self.preference)
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Owns the provider collection and hands out worker cores.
///
/// Background work (disconnect watchers, pending reservations) stops when the
/// pool is dropped. Must be used from within a Tokio runtime.
#[derive(Debug)]
pub struct WorkerPool {
    collection: Arc<WorkerCoreProviderCollection>,
    counters: Arc<PoolCounters>,
    shutdown: CancellationToken,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            collection: Arc::new(WorkerCoreProviderCollection::new()),
            counters: Arc::new(PoolCounters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn collection(&self) -> &Arc<WorkerCoreProviderCollection> {
        &self.collection
    }

    /// Register a provider and watch its disconnect signal.
    ///
    /// Returns `false` if a provider with the same id is already present.
    pub fn add_provider(&self, provider: Arc<dyn WorkerCoreProvider>) -> bool {
        if !self.collection.add(Arc::clone(&provider)) {
            return false;
        }

        let id = provider.id().to_string();
        let disconnected = provider.disconnected();
        let collection = Arc::clone(&self.collection);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = disconnected.cancelled() => {
                    info!(provider = %id, "provider disconnected; removing from pool");
                    collection.remove(&id);
                }
                _ = shutdown.cancelled() => {}
            }
        });

        info!(provider = provider.id(), location = ?provider.location(), "provider added to pool");
        true
    }

    pub fn remove_provider(&self, id: &str) -> bool {
        self.collection.remove(id)
    }

    /// Start reserving a core.
    ///
    /// The returned request fails with [`EngineError::Cancelled`] when
    /// `cancel` fires first, and immediately when `RequireLocal` is asked
    /// of a pool without any local provider.
    pub fn reserve_core(
        &self,
        preference: CorePreference,
        cancel: CancellationToken,
    ) -> WorkerCoreRequest {
        if preference == CorePreference::RequireLocal && !self.collection.has_local() {
            warn!("local core requested but no local provider is registered");
            return WorkerCoreRequest::failed(preference, EngineError::Cancelled);
        }

        let collection = Arc::clone(&self.collection);
        let counters = Arc::clone(&self.counters);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let _guard = UnfulfilledGuard::new(Arc::clone(&counters), preference);
            let core = tokio::select! {
                res = fulfil(&collection, preference, &cancel) => res?,
                _ = shutdown.cancelled() => return Err(EngineError::Cancelled),
            };
            let fulfilled = match core.location() {
                CoreLocation::Local => &counters.fulfilled_local,
                CoreLocation::Remote => &counters.fulfilled_remote,
            };
            fulfilled.fetch_add(1, Ordering::Relaxed);
            Ok(core)
        });

        WorkerCoreRequest::pending(preference, handle)
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.counters.snapshot()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Providers allowed to serve `preference` right now.
fn eligible_providers(
    collection: &WorkerCoreProviderCollection,
    preference: CorePreference,
) -> Vec<Arc<dyn WorkerCoreProvider>> {
    let providers = collection.snapshot();
    match preference {
        CorePreference::RequireLocal => providers
            .into_iter()
            .filter(|p| p.location() == CoreLocation::Local)
            .collect(),
        CorePreference::PreferRemote => {
            let free_remote: Vec<_> = providers
                .iter()
                .filter(|p| p.location() == CoreLocation::Remote && p.available_cores() > 0)
                .cloned()
                .collect();
            if free_remote.is_empty() {
                providers
            } else {
                free_remote
            }
        }
    }
}

enum RoundOutcome {
    Reserved(WorkerCore),
    CollectionChanged,
    AllFailed,
}

/// Race eligible providers until one delivers a core.
///
/// Each round races the providers eligible at its start; a collection change
/// abandons the round and starts a new one with the updated set.
async fn fulfil(
    collection: &WorkerCoreProviderCollection,
    preference: CorePreference,
    cancel: &CancellationToken,
) -> Result<WorkerCore> {
    let mut changes = collection.subscribe();

    loop {
        let candidates = eligible_providers(collection, preference);
        if candidates.is_empty() {
            if preference == CorePreference::RequireLocal {
                warn!("no local provider left to serve a local core request");
                return Err(EngineError::Cancelled);
            }
            debug!("no providers registered; waiting for the collection to change");
            tokio::select! {
                _ = changes.recv() => continue,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }

        let round = cancel.child_token();
        let mut racers = JoinSet::new();
        for provider in candidates {
            let token = round.clone();
            racers.spawn(async move {
                let res = provider.request_core(token).await;
                (provider.id().to_string(), res)
            });
        }

        let outcome = loop {
            tokio::select! {
                joined = racers.join_next() => match joined {
                    Some(Ok((_, Ok(core)))) => break RoundOutcome::Reserved(core),
                    Some(Ok((provider, Err(e)))) => {
                        debug!(%provider, error = %e, "provider could not deliver a core");
                    }
                    Some(Err(join_err)) => {
                        warn!(error = %join_err, "core reservation racer failed");
                    }
                    None => break RoundOutcome::AllFailed,
                },
                change = changes.recv() => match change {
                    Ok(_) | Err(RecvError::Lagged(_)) => break RoundOutcome::CollectionChanged,
                    Err(RecvError::Closed) => {}
                },
                _ = cancel.cancelled() => {
                    round.cancel();
                    return Err(EngineError::Cancelled);
                }
            }
        };

        // Losing racers are cancelled; any core they already reserved is
        // dropped with the join set and released.
        round.cancel();
        drop(racers);

        match outcome {
            RoundOutcome::Reserved(core) => {
                debug!(core = %core.info(), location = ?core.location(), "core reserved");
                return Ok(core);
            }
            RoundOutcome::CollectionChanged => {
                debug!("provider collection changed; re-driving reservation");
            }
            RoundOutcome::AllFailed => {
                if preference == CorePreference::RequireLocal && !collection.has_local() {
                    return Err(EngineError::Cancelled);
                }
                debug!("every provider failed this round; waiting for the collection to change");
                tokio::select! {
                    _ = changes.recv() => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
        }
    }
}
