//! HTTP/JSON client for the relay server's wire protocol (sec 6), plus a
//! helper to open the push-channel websocket.

use crate::config::EngineConfig;
use crate::error::SyncError;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest<'a> {
    pub name: &'a str,
    pub platform: &'a str,
    pub invitation_token: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineInfo {
    pub id: String,
    pub name: String,
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub token: String,
    pub machine: MachineInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: String,
    pub index: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRecordDto {
    pub path: String,
    pub size: i64,
    pub version: i64,
    pub content_hash: String,
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
}

#[derive(Debug, Clone, Serialize)]
struct CreateFileRequest<'a> {
    path: &'a str,
    size: i64,
    content_hash: &'a str,
    chunks: &'a [ChunkRef],
}

#[derive(Debug, Clone, Serialize)]
struct UpdateFileRequest<'a> {
    size: i64,
    content_hash: &'a str,
    parent_version: i64,
    chunks: &'a [ChunkRef],
}

#[derive(Debug, Clone, Deserialize)]
struct VersionConflictBody {
    current_version: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub action: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangesResponse {
    pub changes: Vec<ChangeRecord>,
    pub has_more: bool,
    pub latest_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawChangesResponse {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    changes: Vec<ChangeRecord>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    latest_timestamp: String,
}

/// Result of a changes-since-cursor poll. The server signals a cursor past
/// its retention window with `{"type": "full_resync_required"}` instead of
/// a normal delta body (sec 9 open question: cursor staleness).
#[derive(Debug, Clone)]
pub enum ChangesResult {
    Delta(ChangesResponse),
    FullResyncRequired,
}

/// Thin wrapper over [`reqwest::Client`] targeting the relay server's
/// bearer-token-authenticated JSON API.
pub struct ApiClient {
    http: HttpClient,
    base_url: Url,
    auth_token: String,
}

impl ApiClient {
    pub fn new(config: &EngineConfig) -> Result<Self, SyncError> {
        let mut base_url = Url::parse(&config.server_url)
            .map_err(|e| SyncError::Fatal(format!("invalid server_url: {e}")))?;
        // A trailing slash makes `Url::join` extend this path rather than
        // replace it, so a server mounted under a prefix (e.g. `/sync/`)
        // keeps that prefix on every request.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Fatal(format!("failed to build http client: {e}")))?;
        Ok(Self { http, base_url, auth_token: config.auth_token.clone() })
    }

    /// Extends the base URL's path with `path`. Relies on `path` being one
    /// of our own fixed endpoint strings or a value already run through
    /// [`crate::pathsafety::validate_relative_path`] — this only fixes the
    /// base-path-discarding behavior of `Url::join` on a leading `/`, it is
    /// not itself a traversal guard.
    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::Fatal(format!("invalid request path {path}: {e}")))
    }

    pub async fn register_machine(
        &self,
        name: &str,
        platform: &str,
        invitation_token: &str,
    ) -> Result<RegisterResponse, SyncError> {
        let url = self.url("/api/machines/register")?;
        let response = self
            .http
            .post(url)
            .json(&RegisterRequest { name, platform, invitation_token })
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;

        match response.status() {
            StatusCode::CREATED => response.json().await.map_err(SyncError::from_reqwest),
            StatusCode::UNAUTHORIZED => Err(SyncError::Authentication("invalid invitation token".into())),
            StatusCode::CONFLICT => Err(SyncError::Validation("machine name already taken".into())),
            status => Err(status_to_error(status)),
        }
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<FileRecordDto>, SyncError> {
        let url = self.url(&format!("/api/files/{path}"))?;
        let response = self.authed(self.http.get(url)).send().await.map_err(SyncError::from_reqwest)?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await.map_err(SyncError::from_reqwest)?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(status_to_error(status)),
        }
    }

    pub async fn list_files(&self, prefix: &str) -> Result<Vec<FileRecordDto>, SyncError> {
        let mut url = self.url("/api/files")?;
        url.query_pairs_mut().append_pair("prefix", prefix);
        let response = self.authed(self.http.get(url)).send().await.map_err(SyncError::from_reqwest)?;
        self.parse_ok(response).await
    }

    pub async fn create_file(
        &self,
        path: &str,
        size: i64,
        content_hash: &str,
        chunks: &[ChunkRef],
    ) -> Result<FileRecordDto, SyncError> {
        let url = self.url("/api/files")?;
        let body = CreateFileRequest { path, size, content_hash, chunks };
        let response = self.authed(self.http.post(url)).json(&body).send().await.map_err(SyncError::from_reqwest)?;
        self.parse_ok(response).await
    }

    /// Uploads updated metadata for `path`. On a 409 version conflict
    /// returns [`SyncError::Conflict`] carrying the server's current version.
    pub async fn update_file(
        &self,
        path: &str,
        size: i64,
        content_hash: &str,
        parent_version: i64,
        chunks: &[ChunkRef],
    ) -> Result<FileRecordDto, SyncError> {
        let url = self.url(&format!("/api/files/{path}"))?;
        let body = UpdateFileRequest { size, content_hash, parent_version, chunks };
        let response = self.authed(self.http.put(url)).json(&body).send().await.map_err(SyncError::from_reqwest)?;

        if response.status() == StatusCode::CONFLICT {
            let conflict: VersionConflictBody = response.json().await.map_err(SyncError::from_reqwest)?;
            return Err(SyncError::Conflict { detected_version: conflict.current_version as u64 });
        }
        self.parse_ok(response).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SyncError> {
        let url = self.url(&format!("/api/files/{path}"))?;
        let response = self.authed(self.http.delete(url)).send().await.map_err(SyncError::from_reqwest)?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(status_to_error(status)),
        }
    }

    pub async fn chunk_list(&self, path: &str) -> Result<Vec<String>, SyncError> {
        let url = self.url(&format!("/api/chunks/{path}"))?;
        let response = self.authed(self.http.get(url)).send().await.map_err(SyncError::from_reqwest)?;
        self.parse_ok(response).await
    }

    pub async fn upload_chunk(&self, hash: &str, bytes: Vec<u8>) -> Result<(), SyncError> {
        let url = self.url(&format!("/api/storage/chunks/{hash}"))?;
        let response = self.authed(self.http.put(url)).body(bytes).send().await.map_err(SyncError::from_reqwest)?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(status_to_error(status)),
        }
    }

    pub async fn chunk_exists(&self, hash: &str) -> Result<bool, SyncError> {
        let url = self.url(&format!("/api/storage/chunks/{hash}"))?;
        let response = self.authed(self.http.head(url)).send().await.map_err(SyncError::from_reqwest)?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_to_error(status)),
        }
    }

    pub async fn download_chunk(&self, hash: &str) -> Result<Vec<u8>, SyncError> {
        let url = self.url(&format!("/api/storage/chunks/{hash}"))?;
        let response = self.authed(self.http.get(url)).send().await.map_err(SyncError::from_reqwest)?;
        match response.status() {
            StatusCode::OK => Ok(response.bytes().await.map_err(SyncError::from_reqwest)?.to_vec()),
            StatusCode::NOT_FOUND => Err(SyncError::NotFound(format!("chunk {hash}"))),
            status => Err(status_to_error(status)),
        }
    }

    pub async fn get_changes(&self, since: &str, limit: u32) -> Result<ChangesResult, SyncError> {
        let mut url = self.url("/api/changes")?;
        url.query_pairs_mut()
            .append_pair("since", since)
            .append_pair("limit", &limit.to_string());
        let response = self.authed(self.http.get(url)).send().await.map_err(SyncError::from_reqwest)?;
        let raw: RawChangesResponse = self.parse_ok(response).await?;

        if raw.kind.as_deref() == Some("full_resync_required") {
            return Ok(ChangesResult::FullResyncRequired);
        }
        Ok(ChangesResult::Delta(ChangesResponse {
            changes: raw.changes,
            has_more: raw.has_more,
            latest_timestamp: raw.latest_timestamp,
        }))
    }

    /// Probes `/health`; used by the network-wait retry loop. Never
    /// returns an error — connectivity failures just read as "down".
    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.url("/health") else { return false };
        matches!(
            self.http.get(url).timeout(Duration::from_secs(5)).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    /// Opens the server's push channel at `ws(s)://<server>/ws/client/<token>`.
    pub async fn connect_websocket(
        &self,
    ) -> Result<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, SyncError> {
        let scheme = match self.base_url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        let mut ws_url = self.base_url.clone();
        ws_url
            .set_scheme(scheme)
            .map_err(|_| SyncError::Fatal("failed to derive websocket scheme".into()))?;
        ws_url.set_path(&format!("/ws/client/{}", self.auth_token));

        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Fatal(format!("invalid websocket url: {e}")))?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {}", self.auth_token).parse().unwrap());

        let (stream, _response) = connect_async(request).await.map_err(|e| {
            SyncError::connectivity(format!("websocket connect failed: {e}"))
        })?;
        Ok(stream)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.auth_token)
    }

    async fn parse_ok<T: for<'de> Deserialize<'de>>(&self, response: reqwest::Response) -> Result<T, SyncError> {
        if response.status().is_success() {
            response.json().await.map_err(SyncError::from_reqwest)
        } else {
            Err(status_to_error(response.status()))
        }
    }
}

fn status_to_error(status: StatusCode) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::Authentication(format!("server returned {status}"))
        }
        StatusCode::NOT_FOUND => SyncError::NotFound(format!("server returned {status}")),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            SyncError::Transient(format!("server returned {status}"))
        }
        _ => SyncError::Fatal(format!("server returned {status}")),
    }
}
