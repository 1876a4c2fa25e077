//! Chunked, resumable transfer primitives (sec 4.10, sec 8): upload,
//! download, and delete, all cooperatively cancellable and sharing the
//! crate's retry and error taxonomy.

pub mod delete;
pub mod download;
pub mod upload;

use crate::api_client::ApiClient;
use crate::error::SyncError;
use crate::retry::BackoffConfig;
use crate::state::StateDb;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use delete::delete_file;
pub use download::download_file;
pub use upload::upload_file;

/// Shared dependencies every transfer primitive needs.
#[derive(Clone)]
pub struct TransferContext {
    pub api: Arc<ApiClient>,
    pub state_db: Arc<StateDb>,
    pub data_key: [u8; 32],
    pub backoff: BackoffConfig,
}

/// Runs a single network call under the network-wait retry policy (sec
/// 4.11: "transfer primitives use network-wait"), probing `/health` while a
/// connectivity error is outstanding.
pub(crate) async fn with_network_wait<F, Fut, T>(ctx: &TransferContext, f: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    crate::retry::retry_with_network_wait(
        &ctx.backoff,
        f,
        || async { ctx.api.health_check().await },
        || tracing::info!(target: "transfers", "waiting for network connectivity"),
        || tracing::info!(target: "transfers", "network connectivity restored"),
    )
    .await
}

/// Checks `token` between atomic units of work (sec 5 cancellation
/// contract): before each chunk, before each network call, before
/// finalization.
pub(crate) fn check_cancelled(token: &CancellationToken) -> Result<(), SyncError> {
    if token.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}
