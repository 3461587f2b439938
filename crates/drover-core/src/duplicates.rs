//! Duplicate resolution: one live record per physical object.
//!
//! Groups of records referencing the same object resolve to a single
//! primary. The object is staged to local temporary storage and verified
//! byte-for-byte before any metadata row is removed; a staging or
//! verification failure aborts the group with no side effects. Source
//! bytes are never deleted here at all.

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::error::{DroverError, Result};
use crate::inventory::Inventory;
use crate::metadata::MetadataRepository;
use crate::model::{IntegrityViolation, ObjectKey, Record};
use crate::phase::Phase;
use crate::recovery::ErrorRecoveryManager;
use crate::state::{ChangeLogManager, ChangeOp, Checkpoint, CheckpointManager};
use crate::storage::transfer::sha256_hex;
use crate::storage::StorageLocationClient;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Outcome of one run of the service.
#[derive(Debug, Default)]
pub struct DuplicateOutcome {
    pub groups_resolved: u64,
    pub records_removed: u64,
    /// Groups skipped because staged verification failed.
    pub aborted: Vec<IntegrityViolation>,
}

/// Resolves objects referenced by more than one live record.
pub struct DuplicateResolutionService {
    storage: Arc<dyn StorageLocationClient>,
    repo: Arc<dyn MetadataRepository>,
    recovery: Arc<ErrorRecoveryManager>,
    checkpoints: Arc<CheckpointManager>,
    config: MigrationConfig,
}

impl DuplicateResolutionService {
    pub fn new(
        storage: Arc<dyn StorageLocationClient>,
        repo: Arc<dyn MetadataRepository>,
        recovery: Arc<ErrorRecoveryManager>,
        checkpoints: Arc<CheckpointManager>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            storage,
            repo,
            recovery,
            checkpoints,
            config,
        }
    }

    /// Resolve every duplicate group in the inventory.
    pub async fn run(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<DuplicateOutcome> {
        let groups: Vec<(ObjectKey, Vec<String>)> = inventory
            .duplicate_groups()
            .into_iter()
            .filter(|(key, _)| !checkpoint.is_processed(&key.to_string()))
            .collect();
        info!(count = groups.len(), "resolving duplicate groups");

        let mut outcome = DuplicateOutcome::default();
        for batch in groups.chunks(self.config.batch_size) {
            cancel.check()?;
            for (key, record_ids) in batch {
                match self
                    .resolve_group(inventory, changelog, key, record_ids)
                    .await
                {
                    Ok(removed) => {
                        outcome.groups_resolved += 1;
                        outcome.records_removed += removed;
                        checkpoint.counters.duplicate_groups += 1;
                        checkpoint.counters.duplicate_records_removed += removed;
                    }
                    Err(err @ DroverError::IntegrityFailure { .. }) => {
                        warn!(object = %key, error = %err, "duplicate group aborted");
                        checkpoint.counters.duplicate_groups_aborted += 1;
                        outcome.aborted.push(IntegrityViolation {
                            subject: key.to_string(),
                            detail: err.to_string(),
                        });
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(object = %key, error = %err, "duplicate group skipped");
                        checkpoint.counters.items_skipped += 1;
                    }
                }
                checkpoint.mark_processed(key.to_string());
            }
            changelog.flush()?;
            self.checkpoints.save(checkpoint)?;
        }

        Ok(outcome)
    }

    /// Resolve one group: stage, verify, pick the primary, remove the rest.
    async fn resolve_group(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        key: &ObjectKey,
        record_ids: &[String],
    ) -> Result<u64> {
        let records: Vec<Record> = record_ids
            .iter()
            .filter_map(|id| inventory.records.get(id))
            .cloned()
            .collect();
        if records.len() < 2 {
            return Ok(0);
        }

        // The staged copy only exists to prove the object reads back
        // intact; the temp file is removed on drop regardless of outcome.
        let _staged = self.stage_and_verify(key).await?;

        let primary = Self::select_primary(&records, &self.config.canonical_location);
        debug!(object = %key, primary = %primary.id, "selected primary record");

        let mut removed = 0u64;
        for record in &records {
            if record.id == primary.id {
                continue;
            }
            changelog.log(
                Phase::DuplicateResolution,
                ChangeOp::DuplicateRecordRemoved {
                    record: record.clone(),
                    primary_record_id: primary.id.clone(),
                },
            )?;
            self.repo.mark_removed(&record.id).await?;
            inventory.remove_record(&record.id);
            removed += 1;
        }

        Ok(removed)
    }

    /// Copy the object into the staging area and verify it byte-for-byte.
    ///
    /// The returned temp file deletes itself on drop.
    async fn stage_and_verify(&self, key: &ObjectKey) -> Result<NamedTempFile> {
        let staging_dir = self.config.staging_dir();
        std::fs::create_dir_all(&staging_dir)
            .map_err(|e| DroverError::io_with_path(e, &staging_dir))?;

        let storage = self.storage.clone();
        let location = key.location.clone();
        let path = key.path.clone();
        let bytes = self
            .recovery
            .execute_with_retry("stage-read", || {
                let storage = storage.clone();
                let location = location.clone();
                let path = path.clone();
                async move { storage.read(&location, &path).await }
            })
            .await?;
        let expected = sha256_hex(&bytes);

        let mut staged = tempfile::Builder::new()
            .prefix("staged-")
            .tempfile_in(&staging_dir)
            .map_err(|e| DroverError::io_with_path(e, &staging_dir))?;
        staged
            .write_all(&bytes)
            .map_err(|e| DroverError::io_with_path(e, staged.path()))?;
        staged
            .flush()
            .map_err(|e| DroverError::io_with_path(e, staged.path()))?;

        let written = std::fs::read(staged.path())
            .map_err(|e| DroverError::io_with_path(e, staged.path()))?;
        let actual = sha256_hex(&written);
        if actual != expected {
            return Err(DroverError::IntegrityFailure {
                subject: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(staged)
    }

    /// Primary selection: most-recently-modified, tie-break on canonical
    /// location, then lexicographically smallest identifier.
    fn select_primary<'a>(records: &'a [Record], canonical_location: &str) -> &'a Record {
        let mut ordered: Vec<&Record> = records.iter().collect();
        ordered.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then((b.location == canonical_location).cmp(&(a.location == canonical_location)))
                .then(a.id.cmp(&b.id))
        });
        ordered[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::metadata::SqliteMetadataRepository;
    use crate::model::ObjectMeta;
    use crate::recovery::RetryConfig;
    use crate::state::RunStateStore;
    use crate::storage::LocalStorageClient;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(id: &str, location: &str, path: &str, age_minutes: i64) -> Record {
        Record {
            id: id.into(),
            filename: "photo.jpg".into(),
            location: location.into(),
            path: path.into(),
            size: None,
            fingerprint: None,
            modified_at: Utc::now() - ChronoDuration::minutes(age_minutes),
            live: true,
        }
    }

    fn add_to_inventory(inventory: &mut Inventory, rec: &Record) {
        inventory
            .live_refs
            .entry(rec.object_key())
            .or_default()
            .push(rec.id.clone());
        inventory.records.insert(rec.id.clone(), rec.clone());
    }

    struct Fixture {
        _temp: TempDir,
        service: DuplicateResolutionService,
        repo: Arc<SqliteMetadataRepository>,
        storage: Arc<LocalStorageClient>,
        changelog: ChangeLogManager,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(
            LocalStorageClient::new()
                .with_location("primary", temp.path().join("primary"))
                .with_location("archive", temp.path().join("archive")),
        );
        let repo = Arc::new(SqliteMetadataRepository::open_in_memory().unwrap());
        let config = MigrationConfig::new(
            vec!["primary".into(), "archive".into()],
            "primary",
            "quarantine",
            temp.path().join("state"),
        );
        let store = Arc::new(RunStateStore::open_in_memory().unwrap());
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            Duration::from_secs(3600),
        ));
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
        let changelog = ChangeLogManager::new(store, "run-1", 100).unwrap();
        Fixture {
            service: DuplicateResolutionService::new(
                storage.clone(),
                repo.clone(),
                recovery,
                checkpoints,
                config,
            ),
            _temp: temp,
            repo,
            storage,
            changelog,
        }
    }

    #[tokio::test]
    async fn test_one_record_survives_per_group() {
        let f = fixture();
        f.storage
            .write("primary", "shared.jpg", b"shared-bytes")
            .await
            .unwrap();

        let older = record("r1", "primary", "shared.jpg", 100);
        let newer = record("r2", "primary", "shared.jpg", 1);
        f.repo.insert(&older).unwrap();
        f.repo.insert(&newer).unwrap();

        let mut inventory = Inventory::default();
        add_to_inventory(&mut inventory, &older);
        add_to_inventory(&mut inventory, &newer);
        inventory.objects.insert(
            ObjectKey::new("primary", "shared.jpg"),
            ObjectMeta {
                location: "primary".into(),
                path: "shared.jpg".into(),
                size: 12,
                modified_at: Utc::now(),
            },
        );

        let mut checkpoint = Checkpoint::new("run-1");
        let outcome = f
            .service
            .run(
                &mut inventory,
                &f.changelog,
                &mut checkpoint,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.groups_resolved, 1);
        assert_eq!(outcome.records_removed, 1);

        // Most-recently-modified record remains.
        assert!(f.repo.find_by_id("r2").await.unwrap().is_some());
        assert!(f.repo.find_by_id("r1").await.unwrap().is_none());

        // Object bytes untouched.
        assert_eq!(
            f.storage.read("primary", "shared.jpg").await.unwrap(),
            b"shared-bytes"
        );

        // Removal logged with full prior state.
        let entries = f.changelog.load_all().unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].op {
            ChangeOp::DuplicateRecordRemoved {
                record,
                primary_record_id,
            } => {
                assert_eq!(record.id, "r1");
                assert_eq!(primary_record_id, "r2");
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_canonical_location_breaks_timestamp_tie() {
        let f = fixture();
        f.storage
            .write("archive", "shared.jpg", b"bytes")
            .await
            .unwrap();

        let mut canonical = record("r1", "primary", "shared.jpg", 50);
        let mut other = record("r2", "archive", "shared.jpg", 50);
        // Identical timestamps force the location tie-break.
        other.modified_at = canonical.modified_at;
        // Both reference the archive object.
        canonical.location = "primary".into();
        canonical.path = "shared.jpg".into();

        f.repo.insert(&canonical).unwrap();
        f.repo.insert(&other).unwrap();

        let mut inventory = Inventory::default();
        // Both ids reference the same physical object.
        let key = ObjectKey::new("archive", "shared.jpg");
        inventory.live_refs.insert(
            key.clone(),
            vec!["r1".to_string(), "r2".to_string()],
        );
        inventory.records.insert("r1".into(), canonical.clone());
        inventory.records.insert("r2".into(), other.clone());

        let mut checkpoint = Checkpoint::new("run-1");
        f.service
            .run(
                &mut inventory,
                &f.changelog,
                &mut checkpoint,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // The canonical-location record wins the tie.
        assert!(f.repo.find_by_id("r1").await.unwrap().is_some());
        assert!(f.repo.find_by_id("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_object_aborts_group_without_side_effects() {
        let f = fixture();

        let a = record("r1", "primary", "ghost.jpg", 10);
        let b = record("r2", "primary", "ghost.jpg", 1);
        f.repo.insert(&a).unwrap();
        f.repo.insert(&b).unwrap();

        let mut inventory = Inventory::default();
        add_to_inventory(&mut inventory, &a);
        add_to_inventory(&mut inventory, &b);

        let mut checkpoint = Checkpoint::new("run-1");
        let outcome = f
            .service
            .run(
                &mut inventory,
                &f.changelog,
                &mut checkpoint,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.groups_resolved, 0);
        assert_eq!(checkpoint.counters.items_skipped, 1);
        // Nothing removed, nothing logged.
        assert!(f.repo.find_by_id("r1").await.unwrap().is_some());
        assert!(f.repo.find_by_id("r2").await.unwrap().is_some());
        assert!(f.changelog.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_processed_groups() {
        let f = fixture();
        f.storage
            .write("primary", "shared.jpg", b"bytes")
            .await
            .unwrap();

        let a = record("r1", "primary", "shared.jpg", 10);
        let b = record("r2", "primary", "shared.jpg", 1);
        f.repo.insert(&a).unwrap();
        f.repo.insert(&b).unwrap();

        let mut inventory = Inventory::default();
        add_to_inventory(&mut inventory, &a);
        add_to_inventory(&mut inventory, &b);

        let mut checkpoint = Checkpoint::new("run-1");
        checkpoint.mark_processed(ObjectKey::new("primary", "shared.jpg").to_string());

        let outcome = f
            .service
            .run(
                &mut inventory,
                &f.changelog,
                &mut checkpoint,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.groups_resolved, 0);
        assert!(f.repo.find_by_id("r1").await.unwrap().is_some());
    }
}
