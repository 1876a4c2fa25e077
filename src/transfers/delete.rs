//! Delete primitive (sec 4.12): local-originated deletions propagate to the
//! server; remote-originated deletions remove the local copy. Both mark the
//! path untracked in the state store. A missing target is success, not a
//! failure.

use crate::error::SyncError;
use crate::transfers::{check_cancelled, TransferContext};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// A file was deleted locally: tell the server, then untrack.
pub async fn delete_file(
    ctx: &TransferContext,
    remote_path: &str,
    token: &CancellationToken,
) -> Result<(), SyncError> {
    check_cancelled(token)?;

    match ctx.api.delete_file(remote_path).await {
        Ok(()) | Err(SyncError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    ctx.state_db.untrack_path(remote_path).map_err(|e| SyncError::Fatal(e.to_string()))
}

/// A file was deleted on the server: remove the local copy (file or empty
/// directory) if present, then untrack. Never contacts the server.
pub fn apply_remote_delete(ctx: &TransferContext, remote_path: &str, local_path: &Path) -> Result<(), SyncError> {
    if local_path.is_dir() {
        match std::fs::remove_dir(local_path) {
            Ok(()) => {}
            Err(_) if !local_path.exists() => {}
            Err(e) => return Err(SyncError::Fatal(format!("failed to remove {}: {e}", local_path.display()))),
        }
    } else {
        match std::fs::remove_file(local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::Fatal(format!("failed to remove {}: {e}", local_path.display()))),
        }
    }

    ctx.state_db.untrack_path(remote_path).map_err(|e| SyncError::Fatal(e.to_string()))
}
