use super::schema::{change_cursor, file_records, upload_progress};
use anyhow::{Context, Result};
use diesel::prelude::*;

/// In-memory view of a tracked path's sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub server_file_id: Option<String>,
    pub server_version: Option<i64>,
    pub content_hash: Option<String>,
    pub chunk_hashes: Vec<String>,
    pub size: i64,
    pub mtime: i64,
    pub is_tracked: bool,
    pub updated_at: i64,
}

impl FileRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            server_file_id: None,
            server_version: None,
            content_hash: None,
            chunk_hashes: Vec::new(),
            size: 0,
            mtime: 0,
            is_tracked: false,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// True when the local mtime we last recorded is older than `current_mtime`,
    /// i.e. the file has changed locally since the last sync.
    pub fn is_locally_modified(&self, current_mtime: i64) -> bool {
        current_mtime > self.mtime
    }

    /// True when the given server version is newer than the one we have recorded.
    pub fn needs_download(&self, server_version: i64) -> bool {
        match self.server_version {
            Some(known) => server_version > known,
            None => true,
        }
    }
}

#[derive(Queryable)]
pub(super) struct FileRecordRow {
    pub path: String,
    pub server_file_id: Option<String>,
    pub server_version: Option<i64>,
    pub content_hash: Option<String>,
    pub chunk_hashes: String,
    pub size: i64,
    pub mtime: i64,
    pub is_tracked: bool,
    pub updated_at: i64,
}

impl TryFrom<FileRecordRow> for FileRecord {
    type Error = anyhow::Error;

    fn try_from(row: FileRecordRow) -> Result<Self> {
        let chunk_hashes: Vec<String> =
            serde_json::from_str(&row.chunk_hashes).context("failed to deserialize chunk_hashes")?;
        Ok(FileRecord {
            path: row.path,
            server_file_id: row.server_file_id,
            server_version: row.server_version,
            content_hash: row.content_hash,
            chunk_hashes,
            size: row.size,
            mtime: row.mtime,
            is_tracked: row.is_tracked,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = file_records)]
pub(super) struct NewFileRecord {
    pub path: String,
    pub server_file_id: Option<String>,
    pub server_version: Option<i64>,
    pub content_hash: Option<String>,
    pub chunk_hashes: String,
    pub size: i64,
    pub mtime: i64,
    pub is_tracked: bool,
    pub updated_at: i64,
}

impl TryFrom<&FileRecord> for NewFileRecord {
    type Error = anyhow::Error;

    fn try_from(record: &FileRecord) -> Result<Self> {
        Ok(NewFileRecord {
            path: record.path.clone(),
            server_file_id: record.server_file_id.clone(),
            server_version: record.server_version,
            content_hash: record.content_hash.clone(),
            chunk_hashes: serde_json::to_string(&record.chunk_hashes)
                .context("failed to serialize chunk_hashes")?,
            size: record.size,
            mtime: record.mtime,
            is_tracked: record.is_tracked,
            updated_at: record.updated_at,
        })
    }
}

/// Resumable upload progress for a single path: the full set of chunk
/// hashes the file chunked into, and the subset already confirmed uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    pub path: String,
    pub chunk_hashes: Vec<String>,
    pub uploaded_hashes: Vec<String>,
    pub updated_at: i64,
}

impl UploadProgress {
    pub fn new(path: impl Into<String>, chunk_hashes: Vec<String>) -> Self {
        Self {
            path: path.into(),
            chunk_hashes,
            uploaded_hashes: Vec::new(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Whether this progress record still applies to a re-chunked file, i.e.
    /// the chunk hash list matches exactly.
    pub fn matches(&self, chunk_hashes: &[String]) -> bool {
        self.chunk_hashes == chunk_hashes
    }

    pub fn remaining(&self) -> Vec<String> {
        self.chunk_hashes
            .iter()
            .filter(|h| !self.uploaded_hashes.contains(h))
            .cloned()
            .collect()
    }
}

#[derive(Queryable)]
pub(super) struct UploadProgressRow {
    pub path: String,
    pub chunk_hashes: String,
    pub uploaded_hashes: String,
    pub updated_at: i64,
}

impl TryFrom<UploadProgressRow> for UploadProgress {
    type Error = anyhow::Error;

    fn try_from(row: UploadProgressRow) -> Result<Self> {
        Ok(UploadProgress {
            path: row.path,
            chunk_hashes: serde_json::from_str(&row.chunk_hashes)
                .context("failed to deserialize chunk_hashes")?,
            uploaded_hashes: serde_json::from_str(&row.uploaded_hashes)
                .context("failed to deserialize uploaded_hashes")?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = upload_progress)]
pub(super) struct NewUploadProgress {
    pub path: String,
    pub chunk_hashes: String,
    pub uploaded_hashes: String,
    pub updated_at: i64,
}

impl TryFrom<&UploadProgress> for NewUploadProgress {
    type Error = anyhow::Error;

    fn try_from(progress: &UploadProgress) -> Result<Self> {
        Ok(NewUploadProgress {
            path: progress.path.clone(),
            chunk_hashes: serde_json::to_string(&progress.chunk_hashes)
                .context("failed to serialize chunk_hashes")?,
            uploaded_hashes: serde_json::to_string(&progress.uploaded_hashes)
                .context("failed to serialize uploaded_hashes")?,
            updated_at: progress.updated_at,
        })
    }
}

#[derive(Queryable)]
pub(super) struct ChangeCursorRow {
    pub id: i32,
    pub cursor: Option<String>,
    pub updated_at: i64,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = change_cursor)]
pub(super) struct NewChangeCursor {
    pub id: i32,
    pub cursor: Option<String>,
    pub updated_at: i64,
}
