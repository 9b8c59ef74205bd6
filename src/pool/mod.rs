// src/pool/mod.rs

//! Worker-core allocation.
//!
//! - [`core`] defines reserved worker cores and their connections.
//! - [`provider`] defines the provider trait.
//! - [`local`] and [`remote`] are the two provider implementations.
//! - [`collection`] is the provider registry with change notifications.
//! - [`request`] is the handle for a reservation in progress.
//! - [`worker_pool`] arbitrates requests across providers.

pub mod collection;
pub mod core;
pub mod local;
pub mod provider;
pub mod remote;
pub mod request;
pub mod worker_pool;

pub use collection::{ProviderCollectionChange, WorkerCoreProviderCollection};
pub use self::core::{CoreConnection, CoreLease, WorkerCore, WorkerCoreInfo};
pub use local::LocalWorkerCoreProvider;
pub use provider::WorkerCoreProvider;
pub use remote::{DuplexStream, RemoteTransport, RemoteWorkerCoreProvider};
pub use request::WorkerCoreRequest;
pub use worker_pool::{PoolStatistics, WorkerPool};
