// src/pool/collection.rs

//! Registry of worker-core providers with change notifications.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::pool::provider::WorkerCoreProvider;
use crate::types::CoreLocation;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Snapshot published after every effective add or remove.
#[derive(Debug, Clone)]
pub struct ProviderCollectionChange {
    pub current: Vec<Arc<dyn WorkerCoreProvider>>,
    pub added: Vec<Arc<dyn WorkerCoreProvider>>,
    pub removed: Vec<Arc<dyn WorkerCoreProvider>>,
}

/// Mutex-guarded map of providers keyed by id.
///
/// `add` and `remove` are idempotent. Notification failures (no subscribers,
/// lagging subscribers) never reach the mutating caller.
#[derive(Debug)]
pub struct WorkerCoreProviderCollection {
    providers: Mutex<BTreeMap<String, Arc<dyn WorkerCoreProvider>>>,
    changes: broadcast::Sender<ProviderCollectionChange>,
}

impl Default for WorkerCoreProviderCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerCoreProviderCollection {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            providers: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn WorkerCoreProvider>>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if a provider with the same id is already registered.
    pub fn add(&self, provider: Arc<dyn WorkerCoreProvider>) -> bool {
        let change = {
            let mut providers = self.lock();
            if providers.contains_key(provider.id()) {
                trace!(provider = provider.id(), "provider already registered");
                return false;
            }
            providers.insert(provider.id().to_string(), Arc::clone(&provider));
            ProviderCollectionChange {
                current: providers.values().cloned().collect(),
                added: vec![provider],
                removed: Vec::new(),
            }
        };
        self.publish(change);
        true
    }

    /// Returns `false` if no provider with this id was registered.
    pub fn remove(&self, id: &str) -> bool {
        let change = {
            let mut providers = self.lock();
            let Some(removed) = providers.remove(id) else {
                trace!(provider = id, "provider not registered");
                return false;
            };
            ProviderCollectionChange {
                current: providers.values().cloned().collect(),
                added: Vec::new(),
                removed: vec![removed],
            }
        };
        self.publish(change);
        true
    }

    fn publish(&self, change: ProviderCollectionChange) {
        debug!(
            current = change.current.len(),
            added = change.added.len(),
            removed = change.removed.len(),
            "provider collection changed"
        );
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderCollectionChange> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn WorkerCoreProvider>> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn WorkerCoreProvider>> {
        self.lock().get(id).cloned()
    }

    pub fn has_local(&self) -> bool {
        self.lock()
            .values()
            .any(|p| p.location() == CoreLocation::Local)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
