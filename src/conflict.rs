//! Conflict resolver (sec 4.14): server wins, local work is preserved under
//! a renamed sibling before the server copy is pulled down.

use crate::crypto;
use crate::error::SyncError;
use crate::state::FileRecord;
use crate::transfers::{download, TransferContext};
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoConflict,
    AlreadySynced,
    Resolved,
    RetryNeeded,
    Abort,
}

/// Resolves a conflict between the local file at `local_path` and the
/// server's copy of `remote_path`. `machine_name` is the registered machine
/// name used in the conflict filename; callers fall back to a sanitized
/// hostname if the machine has none registered.
pub async fn resolve(
    ctx: &TransferContext,
    remote_path: &str,
    local_path: &Path,
    machine_name: &str,
) -> Result<Outcome, SyncError> {
    let server_record = match ctx.api.get_file(remote_path).await? {
        Some(record) => record,
        None => return Ok(Outcome::NoConflict),
    };

    let local_hash = match std::fs::read(local_path) {
        Ok(bytes) => Some(crypto::hash(&bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(SyncError::Fatal(format!("failed to read {}: {e}", local_path.display()))),
    };

    if local_hash.as_deref() == Some(server_record.content_hash.as_str()) {
        return Ok(Outcome::AlreadySynced);
    }

    let conflict_path = conflict_filename(local_path, machine_name);

    if local_hash.is_some() {
        std::fs::rename(local_path, &conflict_path)
            .map_err(|e| SyncError::Fatal(format!("failed to rename {} to {}: {e}", local_path.display(), conflict_path.display())))?;
    }

    // A concurrent local write landing between the hash check and the
    // rename would be silently overwritten below; since the rename is the
    // last local-side observation point, detect that race by re-checking
    // the source path reappeared with new content before downloading.
    if local_path.exists() {
        return Ok(Outcome::RetryNeeded);
    }

    let outcome = download::download_file(
        ctx,
        remote_path,
        local_path,
        &CancellationToken::new(),
        &download::NoopProgress,
    )
    .await;

    match outcome {
        Ok(downloaded) => {
            let mut record = FileRecord::new(remote_path);
            record.server_version = Some(downloaded.server_version);
            record.content_hash = Some(downloaded.content_hash);
            record.size = downloaded.size as i64;
            record.mtime = Local::now().timestamp();
            record.is_tracked = true;
            ctx.state_db
                .upsert_file_record(&record)
                .map_err(|e| SyncError::Fatal(e.to_string()))?;
            Ok(Outcome::Resolved)
        }
        Err(SyncError::Cancelled) => Ok(Outcome::RetryNeeded),
        Err(_) => Ok(Outcome::Abort),
    }
}

/// `<stem>.conflict-YYYYMMDD-HHMMSS-<machine>.<ext>`, in the same parent
/// directory as `original`.
fn conflict_filename(original: &Path, machine_name: &str) -> PathBuf {
    let parent = original.parent().unwrap_or_else(|| Path::new(""));
    let stem = original.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = original.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");

    parent.join(format!("{stem}.conflict-{timestamp}-{machine_name}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClient;
    use crate::config::EngineConfig;
    use crate::state::StateDb;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
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

    #[test]
    fn conflict_filename_inserts_timestamp_and_machine() {
        let name = conflict_filename(Path::new("/sync/notes.txt"), "laptop");
        let rendered = name.file_name().unwrap().to_string_lossy();
        assert!(rendered.starts_with("notes.conflict-"));
        assert!(rendered.ends_with("-laptop.txt"));
    }

    #[test]
    fn conflict_filename_handles_no_extension() {
        let name = conflict_filename(Path::new("/sync/README"), "laptop");
        let rendered = name.file_name().unwrap().to_string_lossy();
        assert!(rendered.starts_with("README.conflict-"));
        assert!(rendered.ends_with("-laptop"));
    }

    #[tokio::test]
    async fn matching_content_hash_is_already_synced() {
        let server = MockServer::start().await;
        let (dir, ctx) = test_context(&server).await;
        let local_path = dir.path().join("a.txt");
        std::fs::write(&local_path, b"same content").unwrap();
        let content_hash = crypto::hash(b"same content");

        Mock::given(method("GET")).and(path("/api/files/a.txt")).respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "a.txt", "size": 12, "version": 2, "content_hash": content_hash, "chunks": []
            })),
        ).mount(&server).await;

        let outcome = resolve(&ctx, "a.txt", &local_path, "laptop").await.unwrap();
        assert_eq!(outcome, Outcome::AlreadySynced);
        assert!(local_path.exists());
    }

    #[tokio::test]
    async fn missing_server_file_is_no_conflict() {
        let server = MockServer::start().await;
        let (dir, ctx) = test_context(&server).await;
        let local_path = dir.path().join("a.txt");
        std::fs::write(&local_path, b"local only").unwrap();

        Mock::given(method("GET")).and(path("/api/files/a.txt")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let outcome = resolve(&ctx, "a.txt", &local_path, "laptop").await.unwrap();
        assert_eq!(outcome, Outcome::NoConflict);
    }

    #[tokio::test]
    async fn divergent_content_renames_local_and_downloads_server() {
        let server = MockServer::start().await;
        let (dir, ctx) = test_context(&server).await;
        let local_path = dir.path().join("a.txt");
        std::fs::write(&local_path, b"local version").unwrap();

        let server_plaintext = b"server version".to_vec();
        let server_hash = crypto::hash(&server_plaintext);
        let chunk_hash = crypto::hash(&server_plaintext);
        let encrypted = crypto::encrypt(&server_plaintext, &ctx.data_key);

        Mock::given(method("GET")).and(path("/api/files/a.txt")).respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "a.txt", "size": server_plaintext.len(), "version": 5,
                "content_hash": server_hash, "chunks": [{"hash": chunk_hash, "index": 0}],
            })),
        ).mount(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("/api/storage/chunks/{chunk_hash}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encrypted))
            .mount(&server)
            .await;

        let outcome = resolve(&ctx, "a.txt", &local_path, "laptop").await.unwrap();
        assert_eq!(outcome, Outcome::Resolved);
        assert_eq!(std::fs::read(&local_path).unwrap(), server_plaintext);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
        assert!(entries.iter().any(|e| e.file_name().to_string_lossy().contains(".conflict-")));

        let record = ctx.state_db.get_file_record("a.txt").unwrap().unwrap();
        assert_eq!(record.server_version, Some(5));
    }
}
