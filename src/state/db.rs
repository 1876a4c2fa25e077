use super::models::{
    ChangeCursorRow, FileRecord, FileRecordRow, NewChangeCursor, NewFileRecord, NewUploadProgress,
    UploadProgress, UploadProgressRow,
};
use super::schema::change_cursor::{self, dsl as change_cursor_dsl};
use super::schema::file_records::{self, dsl as file_records_dsl};
use super::schema::upload_progress::{self, dsl as upload_progress_dsl};
use anyhow::{Context, Result, anyhow};
use diesel::OptionalExtension;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/state");

/// SQLite-backed local state store: file records, upload progress, and the
/// remote-changes cursor. A single pooled connection serializes writes; the
/// pool exists so callers still go through the standard Diesel connection
/// API rather than holding a bare `SqliteConnection`.
pub struct StateDb {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl StateDb {
    pub fn new(config_dir: &Path) -> Result<Self> {
        Self::with_path(config_dir.join("state.db"))
    }

    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state db parent dir {}", parent.display()))?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("invalid state database path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("failed to build state database connection pool")?;

        Ok(Self { pool: Arc::new(pool) })
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool.get().context("failed to get connection from state pool")
    }

    // --- file records ---------------------------------------------------

    pub fn get_file_record(&self, path: &str) -> Result<Option<FileRecord>> {
        let mut conn = self.connection()?;
        let row = file_records_dsl::file_records
            .filter(file_records_dsl::path.eq(path))
            .first::<FileRecordRow>(&mut conn)
            .optional()
            .context("failed to query file record")?;
        row.map(FileRecord::try_from).transpose()
    }

    pub fn upsert_file_record(&self, record: &FileRecord) -> Result<()> {
        let mut conn = self.connection()?;
        let row = NewFileRecord::try_from(record)?;
        diesel::insert_into(file_records::table)
            .values(&row)
            .on_conflict(file_records::path)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .context("failed to upsert file record")?;
        Ok(())
    }

    /// Marks a path untracked (used on both local and remote delete).
    pub fn untrack_path(&self, path: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(file_records_dsl::file_records.filter(file_records_dsl::path.eq(path)))
            .set((
                file_records_dsl::is_tracked.eq(false),
                file_records_dsl::updated_at.eq(chrono::Utc::now().timestamp()),
            ))
            .execute(&mut conn)
            .context("failed to untrack path")?;
        Ok(())
    }

    pub fn purge_path(&self, path: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(file_records_dsl::file_records.filter(file_records_dsl::path.eq(path)))
            .execute(&mut conn)
            .context("failed to purge file record")?;
        Ok(())
    }

    pub fn all_tracked(&self) -> Result<Vec<FileRecord>> {
        let mut conn = self.connection()?;
        let rows = file_records_dsl::file_records
            .filter(file_records_dsl::is_tracked.eq(true))
            .load::<FileRecordRow>(&mut conn)
            .context("failed to list tracked file records")?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    // --- upload progress --------------------------------------------------

    pub fn get_upload_progress(&self, path: &str) -> Result<Option<UploadProgress>> {
        let mut conn = self.connection()?;
        let row = upload_progress_dsl::upload_progress
            .filter(upload_progress_dsl::path.eq(path))
            .first::<UploadProgressRow>(&mut conn)
            .optional()
            .context("failed to query upload progress")?;
        row.map(UploadProgress::try_from).transpose()
    }

    pub fn save_upload_progress(&self, progress: &UploadProgress) -> Result<()> {
        let mut conn = self.connection()?;
        let row = NewUploadProgress::try_from(progress)?;
        diesel::insert_into(upload_progress::table)
            .values(&row)
            .on_conflict(upload_progress::path)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .context("failed to save upload progress")?;
        Ok(())
    }

    pub fn clear_upload_progress(&self, path: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(upload_progress_dsl::upload_progress.filter(upload_progress_dsl::path.eq(path)))
            .execute(&mut conn)
            .context("failed to clear upload progress")?;
        Ok(())
    }

    // --- change cursor ------------------------------------------------------

    pub fn get_cursor(&self) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let row = change_cursor_dsl::change_cursor
            .filter(change_cursor_dsl::id.eq(0))
            .first::<ChangeCursorRow>(&mut conn)
            .optional()
            .context("failed to query change cursor")?;
        Ok(row.and_then(|r| r.cursor))
    }

    pub fn set_cursor(&self, cursor: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let row = NewChangeCursor {
            id: 0,
            cursor: Some(cursor.to_string()),
            updated_at: chrono::Utc::now().timestamp(),
        };
        diesel::insert_into(change_cursor::table)
            .values(&row)
            .on_conflict(change_cursor::id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .context("failed to persist change cursor")?;
        Ok(())
    }
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("failed to open state database at {database_url}"))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run state database migrations: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, StateDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::with_path(dir.path().join("state.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let (_dir, db) = temp_db();
        let mut record = FileRecord::new("notes.txt");
        record.server_version = Some(1);
        record.chunk_hashes = vec!["abc".to_string()];
        record.is_tracked = true;

        db.upsert_file_record(&record).unwrap();
        let loaded = db.get_file_record("notes.txt").unwrap().unwrap();
        assert_eq!(loaded.server_version, Some(1));
        assert_eq!(loaded.chunk_hashes, vec!["abc".to_string()]);
    }

    #[test]
    fn untrack_then_purge() {
        let (_dir, db) = temp_db();
        let mut record = FileRecord::new("a.txt");
        record.is_tracked = true;
        db.upsert_file_record(&record).unwrap();

        db.untrack_path("a.txt").unwrap();
        assert!(!db.get_file_record("a.txt").unwrap().unwrap().is_tracked);

        db.purge_path("a.txt").unwrap();
        assert!(db.get_file_record("a.txt").unwrap().is_none());
    }

    #[test]
    fn upload_progress_resume() {
        let (_dir, db) = temp_db();
        let mut progress = UploadProgress::new("big.bin", vec!["h1".into(), "h2".into(), "h3".into()]);
        progress.uploaded_hashes = vec!["h1".into(), "h2".into()];
        db.save_upload_progress(&progress).unwrap();

        let loaded = db.get_upload_progress("big.bin").unwrap().unwrap();
        assert_eq!(loaded.remaining(), vec!["h3".to_string()]);

        db.clear_upload_progress("big.bin").unwrap();
        assert!(db.get_upload_progress("big.bin").unwrap().is_none());
    }

    #[test]
    fn cursor_persists_across_calls() {
        let (_dir, db) = temp_db();
        assert!(db.get_cursor().unwrap().is_none());
        db.set_cursor("2026-07-01T00:00:00Z").unwrap();
        assert_eq!(db.get_cursor().unwrap().as_deref(), Some("2026-07-01T00:00:00Z"));
    }
}
