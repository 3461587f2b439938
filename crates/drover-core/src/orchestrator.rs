//! Migration orchestrator: the run state machine.
//!
//! Owns the lifecycle of a run: configuration validation, lock
//! acquisition, the pre-run snapshot, checkpoint creation, the fixed
//! phase pipeline, and final reporting. All services are per-run and
//! dependency-injected; nothing here is global.

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::consolidate::ConsolidationService;
use crate::duplicates::DuplicateResolutionService;
use crate::error::{DroverError, Result};
use crate::inventory::{Inventory, InventoryBuilder};
use crate::metadata::MetadataRepository;
use crate::model::{IntegrityViolation, ObjectKey, RunStatus, RunSummary, UnrepairedRecord};
use crate::phase::Phase;
use crate::quarantine::{LiveFlagUsage, QuarantineService, UsageSignal};
use crate::recovery::ErrorRecoveryManager;
use crate::repair::LinkRepairService;
use crate::rollback::{RollbackEngine, RollbackMethod, RollbackReport};
use crate::state::{
    snapshot, ChangeLogManager, Checkpoint, CheckpointManager, MigrationLock, RunStateStore,
};
use crate::storage::StorageLocationClient;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sequences migration phases for one scope.
pub struct MigrationOrchestrator {
    config: MigrationConfig,
    storage: Arc<dyn StorageLocationClient>,
    repo: Arc<dyn MetadataRepository>,
    usage: Arc<dyn UsageSignal>,
    cancel: CancellationToken,
    store: Arc<RunStateStore>,
    checkpoints: Arc<CheckpointManager>,
    lock: Arc<MigrationLock>,
}

impl MigrationOrchestrator {
    /// Create an orchestrator for the given configuration.
    ///
    /// Validation happens here: a bad configuration never opens state or
    /// acquires anything.
    pub fn new(
        config: MigrationConfig,
        storage: Arc<dyn StorageLocationClient>,
        repo: Arc<dyn MetadataRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(RunStateStore::open(config.state_db_path())?);
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            config.checkpoint_retention,
        ));
        let lock = Arc::new(MigrationLock::new(
            store.clone(),
            config.lock_scope.clone(),
            config.lock_ttl,
        ));
        Ok(Self {
            config,
            storage,
            repo,
            usage: Arc::new(LiveFlagUsage),
            cancel: CancellationToken::new(),
            store,
            checkpoints,
            lock,
        })
    }

    /// Replace the default usage signal with a host-supplied one.
    pub fn with_usage_signal(mut self, usage: Arc<dyn UsageSignal>) -> Self {
        self.usage = usage;
        self
    }

    /// Token the host wires to its shutdown signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a new run. Returns the final report.
    pub async fn start(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, "starting migration run");

        let checkpoint = Checkpoint::new(&run_id);
        self.execute(checkpoint, true).await
    }

    /// Resume an interrupted run from its latest checkpoint.
    pub async fn resume(&self, run_id: &str) -> Result<RunSummary> {
        let checkpoint = self.checkpoints.require_latest(run_id)?;
        if checkpoint.is_complete() {
            info!(run_id, "run already complete, nothing to resume");
            return Ok(RunSummary {
                run_id: run_id.to_string(),
                completed: true,
                counters: checkpoint.counters,
                unrepaired: Vec::new(),
                violations: Vec::new(),
                started_at: checkpoint.started_at,
                finished_at: checkpoint.updated_at,
            });
        }
        info!(run_id, phase = %checkpoint.phase, "resuming migration run");
        self.execute(checkpoint, false).await
    }

    /// Current status of a run.
    pub fn status(&self, run_id: &str) -> Result<RunStatus> {
        let checkpoint = self.checkpoints.require_latest(run_id)?;
        Ok(RunStatus {
            run_id: run_id.to_string(),
            phase: checkpoint.phase,
            completed: checkpoint.is_complete(),
            processed_in_phase: checkpoint.processed_ids.len() as u64,
            counters: checkpoint.counters,
            updated_at: checkpoint.updated_at,
        })
    }

    /// Roll back a run.
    pub async fn rollback(
        &self,
        run_id: &str,
        method: RollbackMethod,
        scope: Option<Phase>,
    ) -> Result<RollbackReport> {
        let recovery = Arc::new(ErrorRecoveryManager::from_config(&self.config));
        let engine = RollbackEngine::new(
            self.storage.clone(),
            self.repo.clone(),
            recovery,
            self.store.clone(),
            self.config.clone(),
        );
        engine.rollback(run_id, method, scope).await
    }

    /// Operator escape hatch for locks left by dead processes.
    pub fn force_clear_lock(&self) -> Result<bool> {
        self.lock.force_clear()
    }

    /// Run id of the most recently checkpointed run in this scope.
    pub fn latest_run_id(&self) -> Result<Option<String>> {
        self.store.latest_run_id()
    }

    /// Run the phase pipeline for a (new or resumed) checkpoint.
    async fn execute(&self, mut checkpoint: Checkpoint, fresh: bool) -> Result<RunSummary> {
        let run_id = checkpoint.run_id.clone();
        let guard = self.lock.acquire(&run_id)?;
        self.checkpoints.attach_lock(self.lock.clone(), guard.clone());

        if fresh {
            // Pre-run snapshot backs the full-restore rollback strategy.
            let records = self.repo.all_records().await?;
            snapshot::write_snapshot(&self.config.snapshot_dir(), &run_id, records)?;
            self.checkpoints.save(&checkpoint)?;
        }

        let recovery = Arc::new(ErrorRecoveryManager::from_config(&self.config));
        let changelog =
            ChangeLogManager::new(self.store.clone(), &run_id, self.config.flush_every)?;

        let result = self
            .run_phases(&mut checkpoint, &recovery, &changelog)
            .await;

        // Whatever happened, leave durable state behind: flushed log,
        // current checkpoint, no dangling lock.
        let flush_result = changelog.flush();
        let save_result = self.checkpoints.save(&checkpoint);
        if let Err(release_err) = self.lock.release(&guard) {
            warn!(error = %release_err, "failed to release migration lock");
        }

        match result {
            Ok((inventory, violations)) => {
                flush_result?;
                save_result?;
                if let Err(err) = self.checkpoints.prune() {
                    warn!(error = %err, "checkpoint pruning failed");
                }
                let summary = self.summarize(&checkpoint, &inventory, violations);
                info!(
                    run_id = %run_id,
                    repaired = summary.counters.records_repaired,
                    consolidated = summary.counters.objects_consolidated,
                    quarantined = summary.counters.objects_quarantined,
                    "migration run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(
                    run_id = %run_id,
                    phase = %checkpoint.phase,
                    error = %err,
                    "migration run halted"
                );
                if let Err(flush_err) = flush_result {
                    warn!(error = %flush_err, "final change-log flush failed");
                }
                if let Err(save_err) = save_result {
                    warn!(error = %save_err, "final checkpoint save failed");
                }
                Err(err)
            }
        }
    }

    /// The phase state machine: run each phase, advance via the
    /// transition table, checkpoint at every boundary.
    async fn run_phases(
        &self,
        checkpoint: &mut Checkpoint,
        recovery: &Arc<ErrorRecoveryManager>,
        changelog: &ChangeLogManager,
    ) -> Result<(Inventory, Vec<IntegrityViolation>)> {
        let builder = InventoryBuilder::new(
            self.storage.clone(),
            self.repo.clone(),
            recovery.clone(),
            self.config.clone(),
        );
        // Later phases consume the inventory, so a resumed run rebuilds
        // it before re-entering the pipeline.
        let mut inventory = builder.build(&self.cancel).await?;
        let mut violations = Vec::new();

        while !checkpoint.is_complete() {
            self.cancel.check()?;
            info!(run_id = %checkpoint.run_id, phase = %checkpoint.phase, "entering phase");

            match checkpoint.phase {
                Phase::Inventory => {
                    checkpoint.counters.records_total = inventory.records.len() as u64;
                    checkpoint.counters.objects_total = inventory.objects.len() as u64;
                    checkpoint.counters.records_broken = inventory.broken_records().len() as u64;
                }
                Phase::LinkRepair => {
                    let service = LinkRepairService::new(
                        self.repo.clone(),
                        self.checkpoints.clone(),
                        self.config.clone(),
                    );
                    service
                        .run(&mut inventory, changelog, checkpoint, &self.cancel)
                        .await?;
                }
                Phase::DuplicateResolution => {
                    let service = DuplicateResolutionService::new(
                        self.storage.clone(),
                        self.repo.clone(),
                        recovery.clone(),
                        self.checkpoints.clone(),
                        self.config.clone(),
                    );
                    let outcome = service
                        .run(&mut inventory, changelog, checkpoint, &self.cancel)
                        .await?;
                    violations.extend(outcome.aborted);
                }
                Phase::Consolidation => {
                    let service = ConsolidationService::new(
                        self.storage.clone(),
                        self.repo.clone(),
                        recovery.clone(),
                        self.checkpoints.clone(),
                        self.config.clone(),
                    );
                    service
                        .run(&mut inventory, changelog, checkpoint, &self.cancel)
                        .await?;
                }
                Phase::Quarantine => {
                    let service = QuarantineService::new(
                        self.storage.clone(),
                        self.repo.clone(),
                        recovery.clone(),
                        self.checkpoints.clone(),
                        self.usage.clone(),
                        self.config.clone(),
                    );
                    service
                        .run(&mut inventory, changelog, checkpoint, &self.cancel)
                        .await?;
                }
                Phase::Verification => {
                    let found = self.verify(&inventory, checkpoint).await?;
                    violations.extend(found);
                }
                Phase::Complete | Phase::Rollback => break,
            }

            let next = checkpoint.phase.next().unwrap_or(Phase::Complete);
            checkpoint.advance_to(next);
            changelog.flush()?;
            self.checkpoints.save(checkpoint)?;
        }

        Ok((inventory, violations))
    }

    /// Invariant sweep: every live record resolves, and no object is
    /// referenced by more than one live record.
    async fn verify(
        &self,
        inventory: &Inventory,
        checkpoint: &mut Checkpoint,
    ) -> Result<Vec<IntegrityViolation>> {
        let mut violations = Vec::new();
        let mut refs: HashMap<ObjectKey, Vec<String>> = HashMap::new();

        let mut live: Vec<_> = inventory
            .records
            .values()
            .filter(|record| record.live)
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));

        for batch in live.chunks(self.config.batch_size) {
            self.cancel.check()?;
            for record in batch {
                let key = record.object_key();
                refs.entry(key.clone()).or_default().push(record.id.clone());

                // Broken records are surfaced through the unrepaired
                // list; re-flagging them here would double-report.
                if inventory.record_classes.get(&record.id)
                    == Some(&crate::model::RecordClass::Broken)
                {
                    continue;
                }

                let storage = self.storage.clone();
                let location = key.location.clone();
                let path = key.path.clone();
                let exists = storage.exists(&location, &path).await?;
                if !exists {
                    violations.push(IntegrityViolation {
                        subject: format!("record {}", record.id),
                        detail: format!("live record does not resolve: {}", key),
                    });
                }
            }
        }

        for (key, ids) in refs {
            if ids.len() > 1 {
                violations.push(IntegrityViolation {
                    subject: key.to_string(),
                    detail: format!("object referenced by {} live records", ids.len()),
                });
            }
        }

        violations.sort_by(|a, b| a.subject.cmp(&b.subject));
        checkpoint.counters.verification_violations = violations.len() as u64;
        Ok(violations)
    }

    fn summarize(
        &self,
        checkpoint: &Checkpoint,
        inventory: &Inventory,
        violations: Vec<IntegrityViolation>,
    ) -> RunSummary {
        let unrepaired: Vec<UnrepairedRecord> = inventory
            .broken_records()
            .into_iter()
            .filter(|record| record.live)
            .map(|record| UnrepairedRecord {
                record_id: record.id.clone(),
                filename: record.filename.clone(),
                location: record.location.clone(),
                path: record.path.clone(),
                reason: "no repair candidate after exhaustive search".to_string(),
            })
            .collect();

        RunSummary {
            run_id: checkpoint.run_id.clone(),
            completed: checkpoint.is_complete(),
            counters: checkpoint.counters.clone(),
            unrepaired,
            violations,
            started_at: checkpoint.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Exit code for a finished or failed run, per the documented categories.
pub fn exit_code(result: &Result<RunSummary>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.exit_code(),
    }
}
