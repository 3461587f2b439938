//! Rollback: reverse a run from its change log or a snapshot.
//!
//! Two strategies. Snapshot restore rewrites the whole record set from
//! the pre-run snapshot: fastest, all-or-nothing, metadata only. Replay
//! walks the change log in strict reverse sequence order and dispatches
//! an inverse action per operation tag; it can be scoped to phases
//! at-or-after a cut point for partial undo. Inverse actions are logged
//! under the rollback phase, individual failures are counted without
//! aborting the remaining reversal, and a sampled verification pass
//! reports entries that failed to restore cleanly.

use crate::config::{MigrationConfig, MigrationDefaults};
use crate::error::{DroverError, Result};
use crate::metadata::MetadataRepository;
use crate::model::{IntegrityViolation, ObjectKey};
use crate::phase::Phase;
use crate::recovery::ErrorRecoveryManager;
use crate::state::{snapshot, ChangeLogEntry, ChangeLogManager, ChangeOp, RunStateStore};
use crate::storage::{ObjectMover, StorageLocationClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Rollback strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackMethod {
    /// Restore the full pre-run metadata snapshot.
    Snapshot,
    /// Replay the change log in reverse, undoing each operation.
    Replay,
}

/// Result of a rollback invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RollbackReport {
    pub run_id: String,
    pub method: RollbackMethod,
    pub entries_reversed: u64,
    pub entries_failed: u64,
    pub records_restored: u64,
    /// Sampled entries whose reversal did not restore cleanly.
    pub verification_failures: Vec<IntegrityViolation>,
}

/// Reverses completed or partial runs.
pub struct RollbackEngine {
    storage: Arc<dyn StorageLocationClient>,
    repo: Arc<dyn MetadataRepository>,
    recovery: Arc<ErrorRecoveryManager>,
    store: Arc<RunStateStore>,
    mover: Arc<ObjectMover>,
    config: MigrationConfig,
}

impl RollbackEngine {
    pub fn new(
        storage: Arc<dyn StorageLocationClient>,
        repo: Arc<dyn MetadataRepository>,
        recovery: Arc<ErrorRecoveryManager>,
        store: Arc<RunStateStore>,
        config: MigrationConfig,
    ) -> Self {
        let mover = Arc::new(ObjectMover::new(storage.clone()));
        Self {
            storage,
            repo,
            recovery,
            store,
            mover,
            config,
        }
    }

    /// Roll back a run with the chosen strategy.
    ///
    /// `scope` limits replay to change-log entries from phases at or
    /// after the given phase; it is ignored by snapshot restore.
    pub async fn rollback(
        &self,
        run_id: &str,
        method: RollbackMethod,
        scope: Option<Phase>,
    ) -> Result<RollbackReport> {
        match method {
            RollbackMethod::Snapshot => self.restore_snapshot(run_id).await,
            RollbackMethod::Replay => self.replay(run_id, scope).await,
        }
    }

    /// Strategy (a): all-or-nothing snapshot restore.
    async fn restore_snapshot(&self, run_id: &str) -> Result<RollbackReport> {
        let snapshot = snapshot::read_snapshot(&self.config.snapshot_dir(), run_id)?
            .ok_or_else(|| DroverError::SnapshotMissing {
                run_id: run_id.to_string(),
            })?;

        info!(
            run_id,
            records = snapshot.records.len(),
            "restoring metadata snapshot"
        );
        let mut restored = 0u64;
        for record in &snapshot.records {
            self.repo.restore(record).await?;
            restored += 1;
        }

        Ok(RollbackReport {
            run_id: run_id.to_string(),
            method: RollbackMethod::Snapshot,
            entries_reversed: 0,
            entries_failed: 0,
            records_restored: restored,
            verification_failures: Vec::new(),
        })
    }

    /// Strategy (b): reverse change-log replay.
    async fn replay(&self, run_id: &str, scope: Option<Phase>) -> Result<RollbackReport> {
        if !self.store.known_run(run_id)? {
            return Err(DroverError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }

        let mut entries: Vec<ChangeLogEntry> = ChangeLogManager::load_run(&self.store, run_id)?
            .into_iter()
            // Only pipeline-phase entries reverse; prior rollback logging
            // must never be re-reversed.
            .filter(|e| e.phase.order_index().is_some())
            .filter(|e| scope.map_or(true, |cut| e.phase.at_or_after(cut)))
            .collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        info!(run_id, count = entries.len(), ?scope, "replaying change log in reverse");

        let rollback_log = ChangeLogManager::new(self.store.clone(), run_id, self.config.flush_every)?;

        let mut reversed = Vec::new();
        let mut failed = 0u64;
        for entry in &entries {
            match self.reverse_entry(entry, &rollback_log).await {
                Ok(()) => reversed.push(entry.clone()),
                Err(err) => {
                    warn!(seq = entry.seq, error = %err, "failed to reverse entry");
                    failed += 1;
                }
            }
        }
        rollback_log.flush()?;

        let verification_failures = self.verify_sample(&reversed).await;

        Ok(RollbackReport {
            run_id: run_id.to_string(),
            method: RollbackMethod::Replay,
            entries_reversed: reversed.len() as u64,
            entries_failed: failed,
            records_restored: 0,
            verification_failures,
        })
    }

    /// Dispatch the inverse action for one entry and log it.
    async fn reverse_entry(
        &self,
        entry: &ChangeLogEntry,
        rollback_log: &ChangeLogManager,
    ) -> Result<()> {
        match &entry.op {
            ChangeOp::ObjectMoved { from, to } => {
                self.move_back(to, from).await?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::ObjectMoved {
                        from: to.clone(),
                        to: from.clone(),
                    },
                )?;
            }
            ChangeOp::RecordPathUpdated {
                record_id,
                prior,
                new,
            } => {
                self.repo
                    .update_location_and_path(record_id, &prior.location, &prior.path)
                    .await?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::RecordPathUpdated {
                        record_id: record_id.clone(),
                        prior: new.clone(),
                        new: prior.clone(),
                    },
                )?;
            }
            ChangeOp::RecordLinked {
                record_id,
                broken,
                target,
                ..
            } => {
                // Undo the repair: the record points at its broken path
                // again.
                self.repo
                    .update_location_and_path(record_id, &broken.location, &broken.path)
                    .await?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::RecordPathUpdated {
                        record_id: record_id.clone(),
                        prior: target.clone(),
                        new: broken.clone(),
                    },
                )?;
            }
            ChangeOp::RecordQuarantined {
                record,
                quarantined_to,
            } => {
                let original = record.object_key();
                self.move_back(quarantined_to, &original).await?;
                self.repo.restore(record).await?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::ObjectMoved {
                        from: quarantined_to.clone(),
                        to: original,
                    },
                )?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::RecordRestored {
                        record: record.clone(),
                    },
                )?;
            }
            ChangeOp::ObjectQuarantined {
                from,
                quarantined_to,
            } => {
                self.move_back(quarantined_to, from).await?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::ObjectMoved {
                        from: quarantined_to.clone(),
                        to: from.clone(),
                    },
                )?;
            }
            ChangeOp::DuplicateRecordRemoved { record, .. } => {
                self.repo.restore(record).await?;
                rollback_log.log(
                    Phase::Rollback,
                    ChangeOp::RecordRestored {
                        record: record.clone(),
                    },
                )?;
            }
            ChangeOp::RecordRestored { .. } => {
                // Rollback-only op; never replayed.
            }
        }
        Ok(())
    }

    async fn move_back(&self, from: &ObjectKey, to: &ObjectKey) -> Result<()> {
        let mover = self.mover.clone();
        self.recovery
            .execute_with_retry("rollback-move", || {
                let mover = mover.clone();
                let from = from.clone();
                let to = to.clone();
                async move { mover.move_object(&from, &to).await.map(|_| ()) }
            })
            .await
    }

    /// Sample reversed entries and confirm the restoration took.
    async fn verify_sample(&self, reversed: &[ChangeLogEntry]) -> Vec<IntegrityViolation> {
        let mut failures = Vec::new();
        for entry in reversed.iter().take(MigrationDefaults::ROLLBACK_SAMPLE_SIZE) {
            if let Some(detail) = self.verify_entry(entry).await {
                failures.push(IntegrityViolation {
                    subject: format!("seq {}", entry.seq),
                    detail,
                });
            }
        }
        failures
    }

    /// Check one reversed entry; `Some(detail)` when restoration failed.
    async fn verify_entry(&self, entry: &ChangeLogEntry) -> Option<String> {
        match &entry.op {
            ChangeOp::ObjectMoved { from, .. } | ChangeOp::ObjectQuarantined { from, .. } => {
                match self.storage.exists(&from.location, &from.path).await {
                    Ok(true) => None,
                    Ok(false) => Some(format!("object not restored at {}", from)),
                    Err(err) => Some(format!("verification read failed: {}", err)),
                }
            }
            ChangeOp::RecordPathUpdated {
                record_id, prior, ..
            } => self.verify_record_at(record_id, prior).await,
            ChangeOp::RecordLinked {
                record_id, broken, ..
            } => self.verify_record_at(record_id, broken).await,
            ChangeOp::RecordQuarantined { record, .. } => {
                self.verify_record_at(&record.id, &record.object_key()).await
            }
            ChangeOp::DuplicateRecordRemoved { record, .. } => {
                match self.repo.find_by_id(&record.id).await {
                    Ok(Some(_)) => None,
                    Ok(None) => Some(format!("record {} not re-instated", record.id)),
                    Err(err) => Some(format!("verification lookup failed: {}", err)),
                }
            }
            ChangeOp::RecordRestored { .. } => None,
        }
    }

    async fn verify_record_at(&self, record_id: &str, expected: &ObjectKey) -> Option<String> {
        match self.repo.find_by_id(record_id).await {
            Ok(Some(record)) if record.object_key() == *expected => None,
            Ok(Some(record)) => Some(format!(
                "record {} at {}, expected {}",
                record_id,
                record.object_key(),
                expected
            )),
            Ok(None) => Some(format!("record {} missing", record_id)),
            Err(err) => Some(format!("verification lookup failed: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SqliteMetadataRepository;
    use crate::model::Record;
    use crate::recovery::RetryConfig;
    use crate::storage::LocalStorageClient;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(id: &str, filename: &str, location: &str, path: &str) -> Record {
        Record {
            id: id.into(),
            filename: filename.into(),
            location: location.into(),
            path: path.into(),
            size: None,
            fingerprint: None,
            modified_at: Utc::now(),
            live: true,
        }
    }

    struct Fixture {
        _temp: TempDir,
        storage: Arc<LocalStorageClient>,
        repo: Arc<SqliteMetadataRepository>,
        store: Arc<RunStateStore>,
        config: MigrationConfig,
        engine: RollbackEngine,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(
            LocalStorageClient::new()
                .with_location("primary", temp.path().join("primary"))
                .with_location("archive", temp.path().join("archive"))
                .with_location("quarantine", temp.path().join("quarantine")),
        );
        let repo = Arc::new(SqliteMetadataRepository::open_in_memory().unwrap());
        let store = Arc::new(RunStateStore::open_in_memory().unwrap());
        let config = MigrationConfig::new(
            vec!["primary".into(), "archive".into()],
            "primary",
            "quarantine",
            temp.path().join("state"),
        );
        let recovery = Arc::new(ErrorRecoveryManager::new(
            RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                jitter: false,
                ..RetryConfig::default()
            },
            10,
            100,
        ));
        let engine = RollbackEngine::new(
            storage.clone(),
            repo.clone(),
            recovery,
            store.clone(),
            config.clone(),
        );
        Fixture {
            _temp: temp,
            storage,
            repo,
            store,
            config,
            engine,
        }
    }

    fn seed_checkpoint(store: &RunStateStore, run_id: &str) {
        store
            .insert_checkpoint(run_id, "inventory", "{}", "2026-01-01T00:00:00Z")
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let f = fixture();
        let original = record("r1", "a.jpg", "archive", "old/a.jpg");
        snapshot::write_snapshot(&f.config.snapshot_dir(), "run-1", vec![original.clone()])
            .unwrap();

        // The run mutated the record and removed another.
        f.repo.insert(&record("r1", "a.jpg", "primary", "a.jpg")).unwrap();

        let report = f
            .engine
            .rollback("run-1", RollbackMethod::Snapshot, None)
            .await
            .unwrap();
        assert_eq!(report.records_restored, 1);

        let restored = f.repo.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(restored.location, "archive");
        assert_eq!(restored.path, "old/a.jpg");
    }

    #[tokio::test]
    async fn test_snapshot_missing_is_an_error() {
        let f = fixture();
        assert!(matches!(
            f.engine.rollback("run-9", RollbackMethod::Snapshot, None).await,
            Err(DroverError::SnapshotMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_replay_reverses_moves_and_pointer_updates() {
        let f = fixture();
        seed_checkpoint(&f.store, "run-1");

        // Forward state: object consolidated archive -> primary.
        f.storage.write("primary", "a.jpg", b"bytes").await.unwrap();
        f.repo.insert(&record("r1", "a.jpg", "primary", "a.jpg")).unwrap();

        let log = ChangeLogManager::new(f.store.clone(), "run-1", 10).unwrap();
        log.log(
            Phase::Consolidation,
            ChangeOp::ObjectMoved {
                from: ObjectKey::new("archive", "old/a.jpg"),
                to: ObjectKey::new("primary", "a.jpg"),
            },
        )
        .unwrap();
        log.log(
            Phase::Consolidation,
            ChangeOp::RecordPathUpdated {
                record_id: "r1".into(),
                prior: ObjectKey::new("archive", "old/a.jpg"),
                new: ObjectKey::new("primary", "a.jpg"),
            },
        )
        .unwrap();
        log.flush().unwrap();

        let report = f
            .engine
            .rollback("run-1", RollbackMethod::Replay, None)
            .await
            .unwrap();
        assert_eq!(report.entries_reversed, 2);
        assert_eq!(report.entries_failed, 0);
        assert!(report.verification_failures.is_empty());

        // Object back at its pre-run path, record pointing at it.
        assert_eq!(
            f.storage.read("archive", "old/a.jpg").await.unwrap(),
            b"bytes"
        );
        assert!(!f.storage.exists("primary", "a.jpg").await.unwrap());
        let restored = f.repo.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(restored.object_key(), ObjectKey::new("archive", "old/a.jpg"));
    }

    #[tokio::test]
    async fn test_replay_reinstates_removed_duplicate() {
        let f = fixture();
        seed_checkpoint(&f.store, "run-1");

        let removed = record("r2", "a.jpg", "primary", "a.jpg");
        let log = ChangeLogManager::new(f.store.clone(), "run-1", 10).unwrap();
        log.log(
            Phase::DuplicateResolution,
            ChangeOp::DuplicateRecordRemoved {
                record: removed.clone(),
                primary_record_id: "r1".into(),
            },
        )
        .unwrap();
        log.flush().unwrap();

        let report = f
            .engine
            .rollback("run-1", RollbackMethod::Replay, None)
            .await
            .unwrap();
        assert_eq!(report.entries_reversed, 1);

        let restored = f.repo.find_by_id("r2").await.unwrap().unwrap();
        assert_eq!(restored.filename, "a.jpg");
    }

    #[tokio::test]
    async fn test_replay_scope_filters_earlier_phases() {
        let f = fixture();
        seed_checkpoint(&f.store, "run-1");
        f.repo.insert(&record("r1", "a.jpg", "archive", "found/a.jpg")).unwrap();

        let log = ChangeLogManager::new(f.store.clone(), "run-1", 10).unwrap();
        // Link repair entry (before the scope cut).
        log.log(
            Phase::LinkRepair,
            ChangeOp::RecordLinked {
                record_id: "r1".into(),
                broken: ObjectKey::new("primary", "gone/a.jpg"),
                target: ObjectKey::new("archive", "found/a.jpg"),
                confidence: crate::model::MatchConfidence::Exact,
            },
        )
        .unwrap();
        log.flush().unwrap();

        let report = f
            .engine
            .rollback("run-1", RollbackMethod::Replay, Some(Phase::Consolidation))
            .await
            .unwrap();
        // Scoped out: nothing reversed, repair stands.
        assert_eq!(report.entries_reversed, 0);
        let unchanged = f.repo.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(unchanged.path, "found/a.jpg");

        // Unscoped replay does reverse it.
        let report = f
            .engine
            .rollback("run-1", RollbackMethod::Replay, None)
            .await
            .unwrap();
        assert_eq!(report.entries_reversed, 1);
        let reverted = f.repo.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(reverted.path, "gone/a.jpg");
    }

    #[tokio::test]
    async fn test_replay_counts_failures_and_continues() {
        let f = fixture();
        seed_checkpoint(&f.store, "run-1");
        f.repo.insert(&record("r1", "a.jpg", "primary", "a.jpg")).unwrap();

        let log = ChangeLogManager::new(f.store.clone(), "run-1", 10).unwrap();
        // This object never existed; its reversal must fail.
        log.log(
            Phase::Consolidation,
            ChangeOp::ObjectMoved {
                from: ObjectKey::new("archive", "ghost.jpg"),
                to: ObjectKey::new("primary", "ghost.jpg"),
            },
        )
        .unwrap();
        // This one is reversible.
        log.log(
            Phase::Consolidation,
            ChangeOp::RecordPathUpdated {
                record_id: "r1".into(),
                prior: ObjectKey::new("archive", "old/a.jpg"),
                new: ObjectKey::new("primary", "a.jpg"),
            },
        )
        .unwrap();
        log.flush().unwrap();

        let report = f
            .engine
            .rollback("run-1", RollbackMethod::Replay, None)
            .await
            .unwrap();
        assert_eq!(report.entries_failed, 1);
        assert_eq!(report.entries_reversed, 1);

        let restored = f.repo.find_by_id("r1").await.unwrap().unwrap();
        assert_eq!(restored.path, "old/a.jpg");
    }

    #[tokio::test]
    async fn test_replay_unknown_run() {
        let f = fixture();
        assert!(matches!(
            f.engine.rollback("run-404", RollbackMethod::Replay, None).await,
            Err(DroverError::RunNotFound { .. })
        ));
    }
}
