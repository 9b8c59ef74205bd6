// src/blob/mod.rs

//! Tool and blob synchronisation with remote workers.
//!
//! Tools and input files are content-addressed. Before a remote core runs a
//! task, the tool is pushed (once per digest) and, for the
//! `TransferringBlobs` storage layer, the inputs too; afterwards the outputs
//! are pulled back.
//!
//! - [`local`] contains `LocalBlobSynchroniser`, which hashes with `blake3`
//!   and stages tools into the local tool cache.

pub mod local;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::pool::WorkerCoreInfo;
use crate::types::BoxFuture;

pub use local::LocalBlobSynchroniser;

/// Content hash of a tool executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolHash {
    /// Resolved location of the tool on this machine.
    pub path: PathBuf,
    pub hash: String,
    /// Leading 64 bits of the hash; names the tool's directory in a worker's
    /// tool cache.
    pub digest: u64,
    pub size: u64,
}

/// Content hashes of a task's declared inputs, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputBlobHashes {
    pub blobs: Vec<(PathBuf, String)>,
    pub total_bytes: u64,
}

/// What a synchronisation step moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlobTransferStats {
    pub blobs: usize,
    pub blobs_transferred: usize,
    pub bytes_transferred: u64,
}

impl BlobTransferStats {
    /// Phase-change metadata describing this transfer.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("blobs".to_string(), self.blobs.to_string()),
            ("blobs_transferred".to_string(), self.blobs_transferred.to_string()),
            ("bytes_transferred".to_string(), self.bytes_transferred.to_string()),
        ])
    }
}

/// Content-addressed storage shared with remote workers.
pub trait BlobSynchroniser: Send + Sync {
    fn hash_tool<'a>(
        &'a self,
        tool: &'a Path,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<ToolHash>>;

    fn hash_input_blobs<'a>(
        &'a self,
        inputs: &'a [PathBuf],
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<InputBlobHashes>>;

    /// Make the tool available on `core` and return the digest under which
    /// the worker finds it.
    fn synchronise_tool_and_get_digest<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        tool: &'a ToolHash,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<u64>>;

    fn synchronise_input_blobs<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        inputs: &'a InputBlobHashes,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<BlobTransferStats>>;

    fn synchronise_output_blobs<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        outputs: &'a [PathBuf],
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<BlobTransferStats>>;
}
