//! SQLite-backed metadata repository.
//!
//! WAL mode for safe concurrent access across processes and
//! `Arc<Mutex<Connection>>` for thread safety within one.

use super::MetadataRepository;
use crate::error::{DroverError, Result};
use crate::model::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Metadata repository stored in a single SQLite database.
pub struct SqliteMetadataRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataRepository {
    /// Open (or create) the repository database at the given path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DroverError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory repository. Test and tooling convenience.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=30000;
             PRAGMA synchronous=NORMAL;",
        )?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                location TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER,
                fingerprint TEXT,
                modified_at TEXT NOT NULL,
                live INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_records_filename ON records(filename);
            CREATE INDEX IF NOT EXISTS idx_records_object ON records(location, path);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| DroverError::Database {
            message: format!("Failed to lock metadata database: {}", e),
            source: None,
        })
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
        let modified_at: String = row.get("modified_at")?;
        let modified_at = modified_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now());
        Ok(Record {
            id: row.get("id")?,
            filename: row.get("filename")?,
            location: row.get("location")?,
            path: row.get("path")?,
            size: row.get::<_, Option<i64>>("size")?.map(|s| s as u64),
            fingerprint: row.get("fingerprint")?,
            modified_at,
            live: row.get::<_, i64>("live")? != 0,
        })
    }

    /// Insert a record. Seeding convenience for hosts and tests.
    pub fn insert(&self, record: &Record) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO records (id, filename, location, path, size, fingerprint, modified_at, live)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.filename,
                record.location,
                record.path,
                record.size.map(|s| s as i64),
                record.fingerprint,
                record.modified_at.to_rfc3339(),
                record.live as i64,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn all_records(&self) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM records ORDER BY id")?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT * FROM records WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM records WHERE filename = ?1 ORDER BY id")?;
        let records = stmt
            .query_map(params![filename], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn find_by_object(&self, location: &str, path: &str) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT * FROM records WHERE location = ?1 AND path = ?2 ORDER BY id")?;
        let records = stmt
            .query_map(params![location, path], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn update_location_and_path(&self, id: &str, location: &str, path: &str) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE records SET location = ?1, path = ?2 WHERE id = ?3",
            params![location, path, id],
        )?;
        if updated == 0 {
            return Err(DroverError::RecordNotFound {
                record_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_live(&self, id: &str, live: bool) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE records SET live = ?1 WHERE id = ?2",
            params![live as i64, id],
        )?;
        if updated == 0 {
            return Err(DroverError::RecordNotFound {
                record_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_removed(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DroverError::RecordNotFound {
                record_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn restore(&self, record: &Record) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO records
                 (id, filename, location, path, size, fingerprint, modified_at, live)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.filename,
                record.location,
                record.path,
                record.size.map(|s| s as i64),
                record.fingerprint,
                record.modified_at.to_rfc3339(),
                record.live as i64,
            ],
        )?;
        Ok(())
    }
}
