//! Run-state persistence: checkpoints, change log, run locks.
//!
//! One SQLite database per state directory holds everything a resumed or
//! rolling-back process needs, crash-safe and readable independently of
//! the writer. Managers in the sibling modules own serialization; this
//! store speaks rows.

pub mod changelog;
pub mod checkpoint;
pub mod lock;
pub mod snapshot;

pub use changelog::{ChangeLogEntry, ChangeLogManager, ChangeOp};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use lock::{LockGuard, LockInfo, MigrationLock};

use crate::error::{DroverError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Raw row of a persisted change-log entry.
pub(crate) struct ChangeLogRow {
    pub seq: u64,
    pub phase: String,
    pub payload: String,
    pub recorded_at: String,
}

/// Raw row of a persisted lock.
pub(crate) struct LockRow {
    pub run_id: String,
    pub holder: String,
    pub acquired_at: String,
    pub expires_at: String,
}

/// SQLite store backing all run-state managers.
pub struct RunStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl RunStateStore {
    /// Open (or create) the run-state database at the given path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DroverError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=30000;
             PRAGMA synchronous=NORMAL;",
        )?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open an in-memory store. Test convenience.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_run
                ON checkpoints(run_id, id);

            CREATE TABLE IF NOT EXISTS change_log (
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                phase TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );

            CREATE TABLE IF NOT EXISTS run_locks (
                scope TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| DroverError::Database {
            message: format!("Failed to lock run-state database: {}", e),
            source: None,
        })
    }

    // Checkpoints

    pub(crate) fn insert_checkpoint(
        &self,
        run_id: &str,
        phase: &str,
        payload: &str,
        created_at: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (run_id, phase, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, phase, payload, created_at],
        )?;
        Ok(())
    }

    pub(crate) fn latest_checkpoint(&self, run_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let payload = conn
            .query_row(
                "SELECT payload FROM checkpoints WHERE run_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![run_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(payload)
    }

    /// Delete checkpoints older than the cutoff, always keeping the newest
    /// row of every run.
    pub(crate) fn prune_checkpoints(&self, cutoff: &str) -> Result<usize> {
        let conn = self.lock()?;
        let pruned = conn.execute(
            "DELETE FROM checkpoints
             WHERE created_at < ?1
               AND id NOT IN (
                   SELECT MAX(id) FROM checkpoints GROUP BY run_id
               )",
            params![cutoff],
        )?;
        Ok(pruned)
    }

    pub(crate) fn latest_run_id(&self) -> Result<Option<String>> {
        let conn = self.lock()?;
        let run_id = conn
            .query_row(
                "SELECT run_id FROM checkpoints ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(run_id)
    }

    pub(crate) fn known_run(&self, run_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Change log

    pub(crate) fn append_change_log(
        &self,
        run_id: &str,
        rows: &[(u64, String, String, String, String)],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO change_log (run_id, seq, phase, op, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (seq, phase, op, payload, recorded_at) in rows {
                stmt.execute(params![run_id, *seq as i64, phase, op, payload, recorded_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn max_change_log_seq(&self, run_id: &str) -> Result<Option<u64>> {
        let conn = self.lock()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM change_log WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(max.map(|s| s as u64))
    }

    pub(crate) fn load_change_log(&self, run_id: &str) -> Result<Vec<ChangeLogRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, phase, payload, recorded_at FROM change_log
             WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(ChangeLogRow {
                    seq: row.get::<_, i64>(0)? as u64,
                    phase: row.get(1)?,
                    payload: row.get(2)?,
                    recorded_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // Locks

    pub(crate) fn get_lock(&self, scope: &str) -> Result<Option<LockRow>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT run_id, holder, acquired_at, expires_at FROM run_locks
                 WHERE scope = ?1",
                params![scope],
                |row| {
                    Ok(LockRow {
                        run_id: row.get(0)?,
                        holder: row.get(1)?,
                        acquired_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub(crate) fn upsert_lock(
        &self,
        scope: &str,
        run_id: &str,
        holder: &str,
        acquired_at: &str,
        expires_at: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO run_locks (scope, run_id, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![scope, run_id, holder, acquired_at, expires_at],
        )?;
        Ok(())
    }

    pub(crate) fn update_lock_expiry(
        &self,
        scope: &str,
        holder: &str,
        expires_at: &str,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE run_locks SET expires_at = ?1 WHERE scope = ?2 AND holder = ?3",
            params![expires_at, scope, holder],
        )?;
        Ok(updated > 0)
    }

    pub(crate) fn delete_lock(&self, scope: &str, holder: Option<&str>) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = match holder {
            Some(holder) => conn.execute(
                "DELETE FROM run_locks WHERE scope = ?1 AND holder = ?2",
                params![scope, holder],
            )?,
            None => conn.execute("DELETE FROM run_locks WHERE scope = ?1", params![scope])?,
        };
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_rows() {
        let store = RunStateStore::open_in_memory().unwrap();
        store
            .insert_checkpoint("run-1", "inventory", "{\"a\":1}", "2026-01-01T00:00:00Z")
            .unwrap();
        store
            .insert_checkpoint("run-1", "link-repair", "{\"a\":2}", "2026-01-02T00:00:00Z")
            .unwrap();

        assert_eq!(
            store.latest_checkpoint("run-1").unwrap(),
            Some("{\"a\":2}".to_string())
        );
        assert!(store.latest_checkpoint("run-2").unwrap().is_none());
        assert!(store.known_run("run-1").unwrap());
        assert!(!store.known_run("run-2").unwrap());
    }

    #[test]
    fn test_prune_keeps_latest_per_run() {
        let store = RunStateStore::open_in_memory().unwrap();
        store
            .insert_checkpoint("run-1", "inventory", "old", "2026-01-01T00:00:00Z")
            .unwrap();
        store
            .insert_checkpoint("run-1", "quarantine", "new", "2026-01-02T00:00:00Z")
            .unwrap();

        let pruned = store.prune_checkpoints("2026-02-01T00:00:00Z").unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.latest_checkpoint("run-1").unwrap(), Some("new".into()));
    }

    #[test]
    fn test_change_log_rows() {
        let store = RunStateStore::open_in_memory().unwrap();
        assert_eq!(store.max_change_log_seq("run-1").unwrap(), None);

        store
            .append_change_log(
                "run-1",
                &[
                    (
                        1,
                        "inventory".into(),
                        "object-moved".into(),
                        "{}".into(),
                        "t1".into(),
                    ),
                    (
                        2,
                        "inventory".into(),
                        "record-linked".into(),
                        "{}".into(),
                        "t2".into(),
                    ),
                ],
            )
            .unwrap();

        assert_eq!(store.max_change_log_seq("run-1").unwrap(), Some(2));
        let rows = store.load_change_log("run-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 1);
        assert_eq!(rows[1].seq, 2);
    }

    #[test]
    fn test_lock_rows() {
        let store = RunStateStore::open_in_memory().unwrap();
        assert!(store.get_lock("migration").unwrap().is_none());

        store
            .upsert_lock("migration", "run-1", "holder-1", "t0", "t9")
            .unwrap();
        let row = store.get_lock("migration").unwrap().unwrap();
        assert_eq!(row.run_id, "run-1");

        assert!(store
            .update_lock_expiry("migration", "holder-1", "t10")
            .unwrap());
        assert!(!store
            .update_lock_expiry("migration", "other", "t10")
            .unwrap());

        assert!(!store.delete_lock("migration", Some("other")).unwrap());
        assert!(store.delete_lock("migration", Some("holder-1")).unwrap());
        assert!(store.get_lock("migration").unwrap().is_none());
    }
}
