// src/blob/local.rs

//! Synchroniser for workers that share this machine's filesystem.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use blake3::Hasher;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blob::{BlobSynchroniser, BlobTransferStats, InputBlobHashes, ToolHash};
use crate::errors::{EngineError, Result};
use crate::pool::WorkerCoreInfo;
use crate::types::BoxFuture;

/// Hashes with `blake3` and stages tools into a tool cache directory laid out
/// the way the execution manager resolves them
/// (`<cache>/<digest as 16 hex digits>/<file name>`).
///
/// Inputs and outputs already live on the shared filesystem, so blob
/// synchronisation transfers nothing.
#[derive(Debug, Clone)]
pub struct LocalBlobSynchroniser {
    tool_cache_dir: PathBuf,
}

impl LocalBlobSynchroniser {
    pub fn new(tool_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool_cache_dir: tool_cache_dir.into(),
        }
    }

    pub fn tool_cache_dir(&self) -> &Path {
        &self.tool_cache_dir
    }

    async fn hash_tool_impl(&self, tool: &Path, cancel: CancellationToken) -> Result<ToolHash> {
        let tool = tool.to_path_buf();
        let hashing = tokio::task::spawn_blocking(move || -> anyhow::Result<ToolHash> {
            let path = resolve_tool(&tool);
            let (hash, size) = hash_file(&path)?;
            let digest = digest_of(&hash);
            Ok(ToolHash {
                path,
                hash: hash.to_hex().to_string(),
                digest,
                size,
            })
        });

        let hashed = tokio::select! {
            res = hashing => res.context("tool hashing task failed")??,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        debug!(tool = %hashed.path.display(), digest = format!("{:016x}", hashed.digest), "hashed tool");
        Ok(hashed)
    }

    async fn hash_inputs_impl(
        &self,
        inputs: &[PathBuf],
        cancel: CancellationToken,
    ) -> Result<InputBlobHashes> {
        let inputs = inputs.to_vec();
        let hashing = tokio::task::spawn_blocking(move || -> anyhow::Result<InputBlobHashes> {
            let mut hashes = InputBlobHashes::default();
            for input in inputs {
                let (hash, size) = hash_file(&input)?;
                hashes.total_bytes += size;
                hashes.blobs.push((input, hash.to_hex().to_string()));
            }
            Ok(hashes)
        });

        let hashes = tokio::select! {
            res = hashing => res.context("input hashing task failed")??,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        debug!(blobs = hashes.blobs.len(), bytes = hashes.total_bytes, "hashed input blobs");
        Ok(hashes)
    }

    async fn stage_tool(&self, core: &WorkerCoreInfo, tool: &ToolHash) -> Result<u64> {
        let file_name = tool.path.file_name().ok_or_else(|| {
            EngineError::ConfigError(format!("tool path {:?} has no file name", tool.path))
        })?;
        let dir = self.tool_cache_dir.join(format!("{:016x}", tool.digest));
        let staged = dir.join(file_name);

        if tokio::fs::try_exists(&staged).await.unwrap_or(false) {
            debug!(core = %core, tool = %staged.display(), "tool already staged");
            return Ok(tool.digest);
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating tool cache directory {:?}", dir))?;
        tokio::fs::copy(&tool.path, &staged)
            .await
            .with_context(|| format!("staging tool {:?} into {:?}", tool.path, staged))?;
        debug!(core = %core, tool = %staged.display(), "staged tool");
        Ok(tool.digest)
    }
}

impl BlobSynchroniser for LocalBlobSynchroniser {
    fn hash_tool<'a>(
        &'a self,
        tool: &'a Path,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<ToolHash>> {
        Box::pin(self.hash_tool_impl(tool, cancel))
    }

    fn hash_input_blobs<'a>(
        &'a self,
        inputs: &'a [PathBuf],
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<InputBlobHashes>> {
        Box::pin(self.hash_inputs_impl(inputs, cancel))
    }

    fn synchronise_tool_and_get_digest<'a>(
        &'a self,
        core: &'a WorkerCoreInfo,
        tool: &'a ToolHash,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            tokio::select! {
                res = self.stage_tool(core, tool) => res,
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
            }
        })
    }

    fn synchronise_input_blobs<'a>(
        &'a self,
        _core: &'a WorkerCoreInfo,
        inputs: &'a InputBlobHashes,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<BlobTransferStats>> {
        Box::pin(async move {
            Ok(BlobTransferStats {
                blobs: inputs.blobs.len(),
                ..Default::default()
            })
        })
    }

    fn synchronise_output_blobs<'a>(
        &'a self,
        _core: &'a WorkerCoreInfo,
        outputs: &'a [PathBuf],
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<BlobTransferStats>> {
        Box::pin(async move {
            for output in outputs {
                if !tokio::fs::try_exists(output).await.unwrap_or(false) {
                    warn!(output = %output.display(), "declared output was not produced");
                }
            }
            Ok(BlobTransferStats {
                blobs: outputs.len(),
                ..Default::default()
            })
        })
    }
}

/// Bare tool names are looked up on `PATH`, like a shell would.
fn resolve_tool(tool: &Path) -> PathBuf {
    if tool.components().count() > 1 || tool.is_file() {
        return tool.to_path_buf();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(tool))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| tool.to_path_buf())
}

fn hash_file(path: &Path) -> anyhow::Result<(blake3::Hash, u64)> {
    let mut hasher = Hasher::new();
    let mut file =
        File::open(path).with_context(|| format!("opening file for hashing: {:?}", path))?;
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {:?}", path))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hasher.finalize(), size))
}

fn digest_of(hash: &blake3::Hash) -> u64 {
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(leading)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> WorkerCoreInfo {
        WorkerCoreInfo {
            machine_name: "localhost".into(),
            core_number: 0,
            assignment_id: 1,
        }
    }

    #[tokio::test]
    async fn identical_content_yields_identical_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a/tool");
        let b = dir.path().join("b/tool");
        std::fs::create_dir_all(a.parent().unwrap()).unwrap();
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&a, b"#!/bin/sh\n").unwrap();
        std::fs::write(&b, b"#!/bin/sh\n").unwrap();

        let sync = LocalBlobSynchroniser::new(dir.path().join("cache"));
        let ha = sync.hash_tool(&a, CancellationToken::new()).await.unwrap();
        let hb = sync.hash_tool(&b, CancellationToken::new()).await.unwrap();
        assert_eq!(ha.digest, hb.digest);
        assert_eq!(ha.size, 10);
    }

    #[tokio::test]
    async fn staging_places_tool_under_digest_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("compiler");
        std::fs::write(&tool, b"binary").unwrap();

        let sync = LocalBlobSynchroniser::new(dir.path().join("cache"));
        let hash = sync.hash_tool(&tool, CancellationToken::new()).await.unwrap();
        let digest = sync
            .synchronise_tool_and_get_digest(&core(), &hash, CancellationToken::new())
            .await
            .unwrap();

        let staged = dir
            .path()
            .join("cache")
            .join(format!("{digest:016x}"))
            .join("compiler");
        assert_eq!(std::fs::read(staged).unwrap(), b"binary");
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sync = LocalBlobSynchroniser::new(dir.path().join("cache"));
        let inputs = vec![dir.path().join("nope.c")];
        assert!(sync
            .hash_input_blobs(&inputs, CancellationToken::new())
            .await
            .is_err());
    }
}
