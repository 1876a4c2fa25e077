//! Download primitive: fetch a file's chunk list, pull and decrypt each
//! chunk, verify the whole-file content hash, then atomically replace the
//! local file.

use crate::chunker;
use crate::crypto;
use crate::error::{IntegrityError, SyncError};
use crate::transfers::{check_cancelled, with_network_wait, TransferContext};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, chunks_done: u64, total_chunks: u64);
}

pub struct NoopProgress;
impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _chunks_done: u64, _total_chunks: u64) {}
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub server_version: i64,
    pub content_hash: String,
    pub size: u64,
}

/// Downloads `remote_path` into `local_path`. On cancellation, the
/// in-progress temp file is removed and the existing local file (if any)
/// is left untouched.
pub async fn download_file(
    ctx: &TransferContext,
    remote_path: &str,
    local_path: &Path,
    token: &CancellationToken,
    progress: &dyn ProgressCallback,
) -> Result<DownloadOutcome, SyncError> {
    check_cancelled(token)?;

    let record = with_network_wait(ctx, || ctx.api.get_file(remote_path))
        .await?
        .ok_or_else(|| SyncError::NotFound(remote_path.to_string()))?;

    let mut chunk_refs = record.chunks.clone();
    chunk_refs.sort_by_key(|c| c.index);
    let total = chunk_refs.len() as u64;

    let mut pairs: Vec<(String, Vec<u8>)> = Vec::with_capacity(chunk_refs.len());
    for (done, chunk_ref) in chunk_refs.iter().enumerate() {
        check_cancelled(token)?;
        let encrypted = with_network_wait(ctx, || ctx.api.download_chunk(&chunk_ref.hash)).await?;
        let plaintext = crypto::decrypt(&encrypted, &ctx.data_key)?;
        pairs.push((chunk_ref.hash.clone(), plaintext));
        progress.on_progress(done as u64 + 1, total);
    }

    check_cancelled(token)?;
    let content = chunker::reassemble(&pairs)?;

    let actual_hash = crypto::hash(&content);
    if actual_hash != record.content_hash {
        return Err(IntegrityError::ContentHashMismatch {
            expected: record.content_hash.clone(),
            actual: actual_hash,
        }
        .into());
    }

    write_atomically(local_path, &content, token)?;

    Ok(DownloadOutcome {
        server_version: record.version,
        content_hash: record.content_hash,
        size: content.len() as u64,
    })
}

fn write_atomically(path: &Path, data: &[u8], token: &CancellationToken) -> Result<(), SyncError> {
    let parent = path.parent().ok_or_else(|| SyncError::Validation(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Fatal(format!("failed to create {}: {e}", parent.display())))?;

    let tmp_path = parent.join(format!(".{}.tmp-{}", file_name(path), Uuid::new_v4()));
    std::fs::write(&tmp_path, data)
        .map_err(|e| SyncError::Fatal(format!("failed to write {}: {e}", tmp_path.display())))?;

    if token.is_cancelled() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(SyncError::Cancelled);
    }

    std::fs::rename(&tmp_path, path).map_err(|e| SyncError::Fatal(format!("failed to finalize {}: {e}", path.display())))
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "download".to_string())
}
