// src/pool/provider.rs

//! The provider abstraction: a named source of worker cores.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::pool::core::WorkerCore;
use crate::types::{BoxFuture, CoreLocation};

/// A source of worker cores (this machine, or one remote worker).
///
/// `request_core` resolves once a core is free and reserved for the caller,
/// or fails with [`EngineError::Cancelled`](crate::errors::EngineError) when
/// `cancel` fires first. Dropping the returned future before it resolves must
/// not leak capacity.
pub trait WorkerCoreProvider: Send + Sync + fmt::Debug {
    /// Stable identifier, unique within a provider collection.
    fn id(&self) -> &str;

    fn location(&self) -> CoreLocation;

    /// Cores that could be reserved right now without waiting.
    fn available_cores(&self) -> usize;

    fn request_core(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<WorkerCore>>;

    /// Fires once the provider is gone for good.
    fn disconnected(&self) -> CancellationToken;
}
