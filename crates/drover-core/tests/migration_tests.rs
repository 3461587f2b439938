//! End-to-end tests for the migration pipeline.
//!
//! These drive the orchestrator against the local storage client and the
//! SQLite repository, the way a host deployment wires it up.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use drover_core::metadata::{MetadataRepository, SqliteMetadataRepository};
use drover_core::rollback::RollbackMethod;
use drover_core::storage::StorageLocationClient;
use drover_core::{
    DroverError, LocalStorageClient, MigrationConfig, MigrationOrchestrator, ObjectMeta, Phase,
    Record, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn record(id: &str, filename: &str, location: &str, path: &str, live: bool) -> Record {
    Record {
        id: id.into(),
        filename: filename.into(),
        location: location.into(),
        path: path.into(),
        size: Some(2048),
        fingerprint: None,
        modified_at: Utc::now(),
        live,
    }
}

struct Env {
    _temp: TempDir,
    storage: Arc<LocalStorageClient>,
    repo: Arc<SqliteMetadataRepository>,
    config: MigrationConfig,
}

impl Env {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(
            LocalStorageClient::new()
                .with_location("primary", temp.path().join("primary"))
                .with_location("archive", temp.path().join("archive"))
                .with_location("quarantine", temp.path().join("quarantine")),
        );
        let repo = Arc::new(
            SqliteMetadataRepository::open(temp.path().join("records.db")).unwrap(),
        );
        let config = MigrationConfig::new(
            vec!["primary".into(), "archive".into()],
            "primary",
            "quarantine",
            temp.path().join("state"),
        );
        Self {
            _temp: temp,
            storage,
            repo,
            config,
        }
    }

    fn orchestrator(&self) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            self.config.clone(),
            self.storage.clone(),
            self.repo.clone(),
        )
        .unwrap()
    }
}

/// Assert the I1 invariant: every live record resolves to exactly one
/// existing object, and no object carries two live records.
async fn assert_bijective(env: &Env) {
    let mut seen: HashMap<(String, String), String> = HashMap::new();
    for rec in env.repo.all_records().await.unwrap() {
        if !rec.live {
            continue;
        }
        assert!(
            env.storage.exists(&rec.location, &rec.path).await.unwrap(),
            "live record {} does not resolve at {}:{}",
            rec.id,
            rec.location,
            rec.path
        );
        let prior = seen.insert((rec.location.clone(), rec.path.clone()), rec.id.clone());
        assert!(
            prior.is_none(),
            "object {}:{} referenced by two live records",
            rec.location,
            rec.path
        );
    }
}

#[tokio::test]
async fn successful_run_upholds_record_object_bijection() {
    let env = Env::new();

    env.storage.write("primary", "a.jpg", b"aa").await.unwrap();
    env.storage
        .write("archive", "deep/b.jpg", b"bb")
        .await
        .unwrap();
    env.storage
        .write("archive", "stray/unreferenced.png", b"xx")
        .await
        .unwrap();
    env.repo
        .insert(&record("r1", "a.jpg", "primary", "a.jpg", true))
        .unwrap();
    env.repo
        .insert(&record("r2", "b.jpg", "archive", "deep/b.jpg", true))
        .unwrap();

    let summary = env.orchestrator().start().await.unwrap();
    assert!(summary.completed);
    assert!(summary.violations.is_empty());

    assert_bijective(&env).await;

    // The stray object was quarantined, not deleted.
    assert!(
        !env.storage
            .exists("archive", "stray/unreferenced.png")
            .await
            .unwrap()
    );
    let quarantined = env.storage.list("quarantine", "").await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].path.ends_with("stray/unreferenced.png"));
}

#[tokio::test]
async fn spec_scenario_three_photo_records() {
    let env = Env::new();

    // L1/path-a missing; L1/path-b exists at T1; L2/path-c exists at
    // T2 > T1 inside an originals subpath.
    env.storage
        .write("primary", "keep/photo.jpg", &[1u8; 2048])
        .await
        .unwrap();
    env.storage
        .write("archive", "originals/photo.jpg", &[2u8; 2048])
        .await
        .unwrap();

    let t1 = Utc::now() - ChronoDuration::hours(2);
    let t2 = Utc::now() - ChronoDuration::hours(1);
    let mut r1 = record("r1", "photo.jpg", "primary", "missing/photo.jpg", true);
    r1.modified_at = t1;
    let mut r2 = record("r2", "photo.jpg", "primary", "keep/photo.jpg", true);
    r2.modified_at = t1;
    let mut r3 = record("r3", "photo.jpg", "archive", "originals/photo.jpg", true);
    r3.modified_at = t2;
    env.repo.insert(&r1).unwrap();
    env.repo.insert(&r2).unwrap();
    env.repo.insert(&r3).unwrap();

    let summary = env.orchestrator().start().await.unwrap();
    assert!(summary.completed);

    // The broken record was repaired onto the originals candidate
    // (originals outranks recency), which then made it a duplicate of
    // r3; resolution keeps one of them.
    assert_eq!(summary.counters.records_repaired, 1);
    assert_eq!(summary.counters.duplicate_records_removed, 1);

    let remaining = env.repo.all_records().await.unwrap();
    let live: Vec<_> = remaining.iter().filter(|r| r.live).collect();
    assert_eq!(live.len(), 2, "two live records remain");
    assert_bijective(&env).await;
    assert!(summary.violations.is_empty());
    assert!(summary.unrepaired.is_empty());
}

#[tokio::test]
async fn duplicate_resolution_keeps_one_verified_record() {
    let env = Env::new();

    env.storage
        .write("primary", "shared.jpg", b"the-shared-bytes")
        .await
        .unwrap();
    let mut older = record("r1", "shared.jpg", "primary", "shared.jpg", true);
    older.modified_at = Utc::now() - ChronoDuration::days(2);
    let newer = record("r2", "shared.jpg", "primary", "shared.jpg", true);
    env.repo.insert(&older).unwrap();
    env.repo.insert(&newer).unwrap();

    let summary = env.orchestrator().start().await.unwrap();
    assert!(summary.completed);
    assert_eq!(summary.counters.duplicate_groups, 1);
    assert_eq!(summary.counters.duplicate_records_removed, 1);

    // Exactly one of the pair remains, and its path resolves to the
    // identical bytes.
    let remaining = env.repo.all_records().await.unwrap();
    assert_eq!(remaining.len(), 1);
    let survivor = &remaining[0];
    assert_eq!(survivor.id, "r2");
    assert_eq!(
        env.storage
            .read(&survivor.location, &survivor.path)
            .await
            .unwrap(),
        b"the-shared-bytes"
    );
}

#[tokio::test]
async fn full_replay_restores_pre_run_paths() {
    let env = Env::new();

    env.storage
        .write("archive", "old/a.jpg", b"aa")
        .await
        .unwrap();
    env.storage
        .write("archive", "old/b.jpg", b"bb")
        .await
        .unwrap();
    env.repo
        .insert(&record("r1", "a.jpg", "archive", "old/a.jpg", true))
        .unwrap();
    env.repo
        .insert(&record("r2", "b.jpg", "archive", "old/b.jpg", true))
        .unwrap();

    let orchestrator = env.orchestrator();
    let summary = orchestrator.start().await.unwrap();
    assert!(summary.completed);
    assert_eq!(summary.counters.objects_consolidated, 2);

    // Consolidation moved both into the canonical location.
    let moved = env.repo.find_by_id("r1").await.unwrap().unwrap();
    assert_eq!(moved.location, "primary");

    let report = orchestrator
        .rollback(&summary.run_id, RollbackMethod::Replay, None)
        .await
        .unwrap();
    assert_eq!(report.entries_failed, 0);
    assert!(report.verification_failures.is_empty());

    // Every record is back at its pre-run (location, path), bytes
    // included.
    let r1 = env.repo.find_by_id("r1").await.unwrap().unwrap();
    assert_eq!((r1.location.as_str(), r1.path.as_str()), ("archive", "old/a.jpg"));
    let r2 = env.repo.find_by_id("r2").await.unwrap().unwrap();
    assert_eq!((r2.location.as_str(), r2.path.as_str()), ("archive", "old/b.jpg"));
    assert_eq!(env.storage.read("archive", "old/a.jpg").await.unwrap(), b"aa");
    assert_eq!(env.storage.read("archive", "old/b.jpg").await.unwrap(), b"bb");
    assert!(!env.storage.exists("primary", "a.jpg").await.unwrap());
}

#[tokio::test]
async fn snapshot_rollback_restores_record_rows() {
    let env = Env::new();

    env.storage
        .write("archive", "old/a.jpg", b"aa")
        .await
        .unwrap();
    env.repo
        .insert(&record("r1", "a.jpg", "archive", "old/a.jpg", true))
        .unwrap();

    let orchestrator = env.orchestrator();
    let summary = orchestrator.start().await.unwrap();

    let report = orchestrator
        .rollback(&summary.run_id, RollbackMethod::Snapshot, None)
        .await
        .unwrap();
    assert_eq!(report.records_restored, 1);

    let restored = env.repo.find_by_id("r1").await.unwrap().unwrap();
    assert_eq!(restored.location, "archive");
    assert_eq!(restored.path, "old/a.jpg");
}

#[tokio::test]
async fn resume_skips_identifiers_in_processed_set() {
    let env = Env::new();

    env.storage
        .write("archive", "old/a.jpg", b"aa")
        .await
        .unwrap();
    env.storage
        .write("archive", "old/b.jpg", b"bb")
        .await
        .unwrap();
    env.repo
        .insert(&record("r1", "a.jpg", "archive", "old/a.jpg", true))
        .unwrap();
    env.repo
        .insert(&record("r2", "b.jpg", "archive", "old/b.jpg", true))
        .unwrap();

    // Simulate a crash mid-consolidation: r1 already processed and
    // moved, checkpoint saved, process died before r2.
    {
        use drover_core::{Checkpoint, CheckpointManager, RunStateStore};
        let store = Arc::new(RunStateStore::open(env.config.state_db_path()).unwrap());
        let manager = CheckpointManager::new(store, env.config.checkpoint_retention);
        let mut checkpoint = Checkpoint::new("crashed-run");
        checkpoint.advance_to(Phase::Consolidation);
        checkpoint.mark_processed("r1");
        manager.save(&checkpoint).unwrap();
    }
    // The "already consolidated" state for r1.
    env.storage.rename("archive", "old/a.jpg", "a.jpg").await.unwrap();
    // It moved across locations in the real crash; emulate with the
    // pointer already updated.
    let moved = env.storage.read("archive", "a.jpg").await.unwrap();
    env.storage.write("primary", "a.jpg", &moved).await.unwrap();
    env.storage.delete("archive", "a.jpg").await.unwrap();
    env.repo
        .update_location_and_path("r1", "primary", "a.jpg")
        .await
        .unwrap();

    let summary = env.orchestrator().resume("crashed-run").await.unwrap();
    assert!(summary.completed);
    // Only r2 was consolidated on resume; r1's identifier was skipped.
    assert_eq!(summary.counters.objects_consolidated, 1);
    assert_bijective(&env).await;
}

/// Storage client whose writes always fail with one error signature.
struct WriteBrokenClient {
    inner: LocalStorageClient,
}

#[async_trait]
impl StorageLocationClient for WriteBrokenClient {
    async fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.inner.list(location, prefix).await
    }

    async fn read(&self, location: &str, path: &str) -> Result<Vec<u8>> {
        self.inner.read(location, path).await
    }

    async fn write(&self, _location: &str, _path: &str, _bytes: &[u8]) -> Result<()> {
        Err(DroverError::storage(
            "primary",
            "ingest",
            "backend writes unavailable",
        ))
    }

    async fn exists(&self, location: &str, path: &str) -> Result<bool> {
        self.inner.exists(location, path).await
    }

    async fn delete(&self, location: &str, path: &str) -> Result<()> {
        self.inner.delete(location, path).await
    }

    async fn rename(&self, _location: &str, _from: &str, _to: &str) -> Result<()> {
        Err(DroverError::storage(
            "primary",
            "ingest",
            "backend writes unavailable",
        ))
    }
}

#[tokio::test]
async fn repeated_error_signature_trips_circuit_break() {
    let temp = TempDir::new().unwrap();
    let inner = LocalStorageClient::new()
        .with_location("primary", temp.path().join("primary"))
        .with_location("archive", temp.path().join("archive"))
        .with_location("quarantine", temp.path().join("quarantine"));

    // Twelve records in the archive all need consolidation; every move
    // fails with the same signature.
    let repo = Arc::new(SqliteMetadataRepository::open(temp.path().join("records.db")).unwrap());
    for i in 0..12 {
        let path = format!("old/file-{:02}.jpg", i);
        inner.write("archive", &path, b"x").await.unwrap();
        repo.insert(&record(
            &format!("r{:02}", i),
            &format!("file-{:02}.jpg", i),
            "archive",
            &path,
            true,
        ))
        .unwrap();
    }

    let storage = Arc::new(WriteBrokenClient { inner });
    let mut config = MigrationConfig::new(
        vec!["primary".into(), "archive".into()],
        "primary",
        "quarantine",
        temp.path().join("state"),
    );
    config.circuit_breaker_threshold = 10;
    config.max_retries = 1;
    config.retry_base_delay = std::time::Duration::from_millis(1);

    let orchestrator = MigrationOrchestrator::new(config, storage, repo).unwrap();
    let result = orchestrator.start().await;
    match result {
        Err(err @ DroverError::CircuitBreak { .. }) => {
            assert_eq!(err.exit_code(), 4);
        }
        other => panic!(
            "expected circuit break, got {:?}",
            other.map(|s| s.completed)
        ),
    }

    // The halt left a resumable checkpoint behind.
    let run_id = orchestrator.latest_run_id().unwrap().unwrap();
    let status = orchestrator.status(&run_id).unwrap();
    assert!(!status.completed);
    assert_eq!(status.phase, Phase::Consolidation);
}

#[tokio::test]
async fn quarantined_object_is_restored_by_replay() {
    let env = Env::new();

    env.storage
        .write("primary", "forgotten/orphan.jpg", b"orphan-bytes")
        .await
        .unwrap();

    let orchestrator = env.orchestrator();
    let summary = orchestrator.start().await.unwrap();
    assert_eq!(summary.counters.objects_quarantined, 1);
    assert!(
        !env.storage
            .exists("primary", "forgotten/orphan.jpg")
            .await
            .unwrap()
    );

    let report = orchestrator
        .rollback(&summary.run_id, RollbackMethod::Replay, Some(Phase::Quarantine))
        .await
        .unwrap();
    assert_eq!(report.entries_failed, 0);

    assert_eq!(
        env.storage
            .read("primary", "forgotten/orphan.jpg")
            .await
            .unwrap(),
        b"orphan-bytes"
    );
}

#[tokio::test]
async fn status_reports_phase_and_counters() {
    let env = Env::new();
    env.storage.write("primary", "a.jpg", b"x").await.unwrap();
    env.repo
        .insert(&record("r1", "a.jpg", "primary", "a.jpg", true))
        .unwrap();

    let orchestrator = env.orchestrator();
    let summary = orchestrator.start().await.unwrap();

    let status = orchestrator.status(&summary.run_id).unwrap();
    assert!(status.completed);
    assert_eq!(status.counters.records_total, 1);

    assert!(matches!(
        orchestrator.status("no-such-run"),
        Err(DroverError::RunNotFound { .. })
    ));
}
