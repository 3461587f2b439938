//! Pre-run metadata snapshots.
//!
//! The full-restore rollback strategy needs the exact record set as it
//! stood before the run. Snapshots are JSON files written atomically:
//! temp file, fsync, rename, with the previous snapshot kept as `.bak`.

use crate::error::{DroverError, Result};
use crate::model::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A captured record set for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetadataSnapshot {
    pub run_id: String,
    pub taken_at: DateTime<Utc>,
    pub records: Vec<Record>,
}

fn snapshot_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{}.json", run_id))
}

/// Write a snapshot atomically, keeping any previous one as backup.
pub fn write_snapshot(dir: &Path, run_id: &str, records: Vec<Record>) -> Result<PathBuf> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| DroverError::io_with_path(e, dir))?;
    }

    let snapshot = MetadataSnapshot {
        run_id: run_id.to_string(),
        taken_at: Utc::now(),
        records,
    };
    let serialized = serde_json::to_string_pretty(&snapshot)?;

    let target = snapshot_path(dir, run_id);
    let temp = dir.join(format!("{}.json.{}.tmp", run_id, std::process::id()));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| DroverError::io_with_path(e, &temp))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| DroverError::io_with_path(e, &temp))?;
        file.sync_all()
            .map_err(|e| DroverError::io_with_path(e, &temp))?;
    }

    if target.exists() {
        let backup = dir.join(format!("{}.json.bak", run_id));
        if let Err(e) = fs::copy(&target, &backup) {
            warn!("failed to back up snapshot {}: {}", target.display(), e);
        }
    }

    fs::rename(&temp, &target).map_err(|e| DroverError::io_with_path(e, &target))?;
    debug!(run_id, path = %target.display(), "wrote metadata snapshot");
    Ok(target)
}

/// Read the snapshot of a run, if one was taken.
pub fn read_snapshot(dir: &Path, run_id: &str) -> Result<Option<MetadataSnapshot>> {
    let path = snapshot_path(dir, run_id);
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(&path).map_err(|e| DroverError::io_with_path(e, &path))?;
    let snapshot: MetadataSnapshot =
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| DroverError::Json {
            message: format!("failed to parse snapshot {}: {}", path.display(), e),
            source: Some(e),
        })?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> Record {
        Record {
            id: id.into(),
            filename: "a.jpg".into(),
            location: "primary".into(),
            path: "a.jpg".into(),
            size: Some(1),
            fingerprint: None,
            modified_at: Utc::now(),
            live: true,
        }
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let temp = TempDir::new().unwrap();
        write_snapshot(temp.path(), "run-1", vec![record("r1"), record("r2")]).unwrap();

        let snapshot = read_snapshot(temp.path(), "run-1").unwrap().unwrap();
        assert_eq!(snapshot.run_id, "run-1");
        assert_eq!(snapshot.records.len(), 2);
    }

    #[test]
    fn test_missing_snapshot() {
        let temp = TempDir::new().unwrap();
        assert!(read_snapshot(temp.path(), "run-9").unwrap().is_none());
    }

    #[test]
    fn test_rewrite_keeps_backup() {
        let temp = TempDir::new().unwrap();
        write_snapshot(temp.path(), "run-1", vec![record("r1")]).unwrap();
        write_snapshot(temp.path(), "run-1", vec![record("r1"), record("r2")]).unwrap();

        assert!(temp.path().join("run-1.json.bak").exists());
        let snapshot = read_snapshot(temp.path(), "run-1").unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 2);
    }

    #[test]
    fn test_creates_directory() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("deep").join("snapshots");
        write_snapshot(&nested, "run-1", vec![record("r1")]).unwrap();
        assert!(read_snapshot(&nested, "run-1").unwrap().is_some());
    }
}
