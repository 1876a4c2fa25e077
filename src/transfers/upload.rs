//! Single unified upload path (sec 9 open question 2): chunk, dedup-check
//! each chunk against storage, upload the missing ones, then commit
//! metadata. Resumable via the upload-progress table.

use crate::api_client::ChunkRef;
use crate::chunker;
use crate::crypto::{self, ContentHasher};
use crate::error::SyncError;
use crate::state::UploadProgress;
use crate::transfers::{check_cancelled, with_network_wait, TransferContext};
use std::collections::HashSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Reports bytes uploaded so far against the total; invoked after each
/// chunk, including chunks skipped because they were already present.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, uploaded_bytes: u64, total_bytes: u64);
}

pub struct NoopProgress;
impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _uploaded_bytes: u64, _total_bytes: u64) {}
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub server_version: i64,
    pub content_hash: String,
    pub chunk_hashes: Vec<String>,
}

/// Uploads `local_path` to `remote_path`. `parent_version` is `None` for a
/// brand-new file (`POST /api/files`) and `Some(version)` for an update
/// (`PUT /api/files/{path}`, which may fail with [`SyncError::Conflict`]).
pub async fn upload_file(
    ctx: &TransferContext,
    local_path: &Path,
    remote_path: &str,
    parent_version: Option<i64>,
    token: &CancellationToken,
    progress: &dyn ProgressCallback,
) -> Result<UploadOutcome, SyncError> {
    check_cancelled(token)?;

    let chunks = chunker::chunk_file(local_path)
        .map_err(|e| SyncError::Fatal(format!("failed to read {}: {e}", local_path.display())))?;

    let mut hasher = ContentHasher::new();
    for chunk in &chunks {
        hasher.update(&chunk.data);
    }
    let content_hash = hasher.finalize();
    let chunk_hashes = chunker::chunk_hashes(&chunks);
    let total_size: u64 = chunks.iter().map(|c| c.length as u64).sum();

    let mut uploaded: HashSet<String> = ctx
        .state_db
        .get_upload_progress(remote_path)
        .map_err(|e| SyncError::Fatal(e.to_string()))?
        .filter(|p| p.matches(&chunk_hashes))
        .map(|p| p.uploaded_hashes.into_iter().collect())
        .unwrap_or_default();

    let mut uploaded_bytes: u64 = 0;

    for chunk in &chunks {
        check_cancelled(token)?;

        if !uploaded.contains(&chunk.hash) {
            let exists = with_network_wait(ctx, || ctx.api.chunk_exists(&chunk.hash)).await?;
            if !exists {
                check_cancelled(token)?;
                let encrypted = crypto::encrypt(&chunk.data, &ctx.data_key);
                with_network_wait(ctx, || ctx.api.upload_chunk(&chunk.hash, encrypted.clone())).await?;
            }
            uploaded.insert(chunk.hash.clone());
            persist_progress(ctx, remote_path, &chunk_hashes, &uploaded)?;
        }

        uploaded_bytes += chunk.length as u64;
        progress.on_progress(uploaded_bytes, total_size);
    }

    check_cancelled(token)?;

    let chunk_refs: Vec<ChunkRef> = chunk_hashes
        .iter()
        .enumerate()
        .map(|(index, hash)| ChunkRef { hash: hash.clone(), index })
        .collect();

    let record = match parent_version {
        Some(version) => {
            with_network_wait(ctx, || {
                ctx.api.update_file(remote_path, total_size as i64, &content_hash, version, &chunk_refs)
            })
            .await?
        }
        None => {
            with_network_wait(ctx, || ctx.api.create_file(remote_path, total_size as i64, &content_hash, &chunk_refs))
                .await?
        }
    };

    ctx.state_db
        .clear_upload_progress(remote_path)
        .map_err(|e| SyncError::Fatal(e.to_string()))?;

    Ok(UploadOutcome {
        server_version: record.version,
        content_hash,
        chunk_hashes,
    })
}

fn persist_progress(
    ctx: &TransferContext,
    path: &str,
    all_hashes: &[String],
    uploaded: &HashSet<String>,
) -> Result<(), SyncError> {
    let mut progress = UploadProgress::new(path, all_hashes.to_vec());
    progress.uploaded_hashes = all_hashes.iter().filter(|h| uploaded.contains(*h)).cloned().collect();
    ctx.state_db
        .save_upload_progress(&progress)
        .map_err(|e| SyncError::Fatal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClient;
    use crate::config::EngineConfig;
    use crate::state::StateDb;
    use std::sync::Arc;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_context(server: &MockServer) -> (tempfile::TempDir, TransferContext) {
        let dir = tempfile::tempdir().unwrap();
        let state_db = StateDb::with_path(dir.path().join("state.db")).unwrap();
        let config = EngineConfig { server_url: server.uri(), auth_token: "tok".into(), ..Default::default() };
        let api = ApiClient::new(&config).unwrap();
        (
            dir,
            TransferContext {
                api: Arc::new(api),
                state_db: Arc::new(state_db),
                data_key: crypto::generate_data_key(),
                backoff: crate::retry::BackoffConfig::default(),
            },
        )
    }

    #[tokio::test]
    async fn small_file_uploads_as_create() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD")).and(path_regex("^/api/storage/chunks/.*")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        Mock::given(method("PUT")).and(path_regex("^/api/storage/chunks/.*")).respond_with(ResponseTemplate::new(201)).mount(&server).await;
        Mock::given(method("POST")).and(path_regex("^/api/files$")).respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "path": "a.txt", "size": 5, "version": 1, "content_hash": "x", "chunks": []
            })),
        ).mount(&server).await;

        let (dir, ctx) = test_context(&server).await;
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let outcome = upload_file(&ctx, &file, "a.txt", None, &CancellationToken::new(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(outcome.server_version, 1);
        assert_eq!(outcome.chunk_hashes.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_cancelled_error() {
        let server = MockServer::start().await;
        let (dir, ctx) = test_context(&server).await;
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = upload_file(&ctx, &file, "a.txt", None, &token, &NoopProgress).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[tokio::test]
    async fn update_conflict_propagates_detected_version() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD")).and(path_regex("^/api/storage/chunks/.*")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        Mock::given(method("PUT")).and(path_regex("^/api/files/.*")).respond_with(
            ResponseTemplate::new(409).set_body_json(serde_json::json!({"current_version": 9})),
        ).mount(&server).await;

        let (dir, ctx) = test_context(&server).await;
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let err = upload_file(&ctx, &file, "a.txt", Some(3), &CancellationToken::new(), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { detected_version: 9 }));
    }
}
