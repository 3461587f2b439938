//! Quarantine: reversible isolation of unreferenced data.
//!
//! Orphaned objects and host-flagged unused records are relocated under
//! the quarantine location at `run_id/original_location/original_path`,
//! never deleted. The original placement travels in the change log, so
//! restoration is a rollback replay away. The live-reference count is
//! re-checked through the repository immediately before each object move,
//! guarding against quarantining a file a repair just relinked.

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::metadata::MetadataRepository;
use crate::model::{ObjectKey, ObjectMeta, Record};
use crate::phase::Phase;
use crate::recovery::ErrorRecoveryManager;
use crate::state::{ChangeLogManager, ChangeOp, Checkpoint, CheckpointManager};
use crate::storage::{ObjectMover, StorageLocationClient};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host-supplied usage signal for records.
///
/// The migration core cannot know which records active application
/// content still uses; the host answers through this seam.
pub trait UsageSignal: Send + Sync {
    fn is_used(&self, record: &Record) -> bool;
}

/// Default signal: trust the record's live flag.
#[derive(Debug, Default)]
pub struct LiveFlagUsage;

impl UsageSignal for LiveFlagUsage {
    fn is_used(&self, record: &Record) -> bool {
        record.live
    }
}

/// Relocates unreferenced objects and unused records into quarantine.
pub struct QuarantineService {
    repo: Arc<dyn MetadataRepository>,
    recovery: Arc<ErrorRecoveryManager>,
    checkpoints: Arc<CheckpointManager>,
    usage: Arc<dyn UsageSignal>,
    mover: Arc<ObjectMover>,
    config: MigrationConfig,
}

impl QuarantineService {
    pub fn new(
        storage: Arc<dyn StorageLocationClient>,
        repo: Arc<dyn MetadataRepository>,
        recovery: Arc<ErrorRecoveryManager>,
        checkpoints: Arc<CheckpointManager>,
        usage: Arc<dyn UsageSignal>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            repo,
            recovery,
            checkpoints,
            usage,
            mover: Arc::new(ObjectMover::new(storage)),
            config,
        }
    }

    /// Quarantine unused records, then orphaned objects.
    ///
    /// Records go first: quarantining a record relocates its object, and
    /// the orphan sweep must not see that object again.
    pub async fn run(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.quarantine_records(inventory, changelog, checkpoint, cancel)
            .await?;
        self.quarantine_objects(inventory, changelog, checkpoint, cancel)
            .await?;
        Ok(())
    }

    fn quarantine_key(&self, run_id: &str, key: &ObjectKey) -> ObjectKey {
        ObjectKey::new(
            self.config.quarantine_location.clone(),
            format!("{}/{}/{}", run_id, key.location, key.path),
        )
    }

    async fn quarantine_records(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut unused: Vec<Record> = inventory
            .records
            .values()
            .filter(|r| !self.usage.is_used(r))
            .filter(|r| !checkpoint.is_processed(&r.id))
            .cloned()
            .collect();
        unused.sort_by(|a, b| a.id.cmp(&b.id));
        info!(count = unused.len(), "quarantining unused records");

        for batch in unused.chunks(self.config.batch_size) {
            cancel.check()?;
            for record in batch {
                let from = record.object_key();
                // A record whose object is already gone has nothing to
                // relocate; it stays broken and surfaces in the report.
                if !inventory.objects.contains_key(&from) {
                    checkpoint.mark_processed(&record.id);
                    continue;
                }

                let to = self.quarantine_key(&checkpoint.run_id, &from);
                match self.move_with_retry(&from, &to).await {
                    Ok(()) => {
                        changelog.log(
                            Phase::Quarantine,
                            ChangeOp::RecordQuarantined {
                                record: record.clone(),
                                quarantined_to: to.clone(),
                            },
                        )?;
                        self.repo
                            .update_location_and_path(&record.id, &to.location, &to.path)
                            .await?;
                        self.repo.set_live(&record.id, false).await?;
                        inventory.remove_object(&from);
                        if let Some(rec) = inventory.records.get_mut(&record.id) {
                            rec.location = to.location.clone();
                            rec.path = to.path.clone();
                            rec.live = false;
                        }
                        checkpoint.counters.records_quarantined += 1;
                        debug!(record_id = %record.id, to = %to, "record quarantined");
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(record_id = %record.id, error = %err, "record quarantine skipped");
                        checkpoint.counters.items_skipped += 1;
                    }
                }
                checkpoint.mark_processed(&record.id);
            }
            changelog.flush()?;
            self.checkpoints.save(checkpoint)?;
        }
        Ok(())
    }

    async fn quarantine_objects(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let orphans: Vec<ObjectMeta> = inventory
            .orphaned_objects()
            .into_iter()
            .filter(|meta| !checkpoint.is_processed(&meta.key().to_string()))
            .cloned()
            .collect();
        info!(count = orphans.len(), "quarantining orphaned objects");

        for batch in orphans.chunks(self.config.batch_size) {
            cancel.check()?;
            for meta in batch {
                let from = meta.key();

                // Guard: re-check the live-reference count right before
                // moving. A repair in this run may have relinked a record
                // onto this object.
                let referenced = self
                    .repo
                    .find_by_object(&from.location, &from.path)
                    .await?
                    .iter()
                    .any(|r| r.live);
                if referenced {
                    debug!(object = %from, "skipping quarantine, object re-referenced");
                    checkpoint.mark_processed(from.to_string());
                    continue;
                }

                let to = self.quarantine_key(&checkpoint.run_id, &from);
                match self.move_with_retry(&from, &to).await {
                    Ok(()) => {
                        changelog.log(
                            Phase::Quarantine,
                            ChangeOp::ObjectQuarantined {
                                from: from.clone(),
                                quarantined_to: to.clone(),
                            },
                        )?;
                        inventory.remove_object(&from);
                        checkpoint.counters.objects_quarantined += 1;
                        debug!(object = %from, to = %to, "object quarantined");
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(object = %from, error = %err, "object quarantine skipped");
                        checkpoint.counters.items_skipped += 1;
                    }
                }
                checkpoint.mark_processed(from.to_string());
            }
            changelog.flush()?;
            self.checkpoints.save(checkpoint)?;
        }
        Ok(())
    }

    async fn move_with_retry(&self, from: &ObjectKey, to: &ObjectKey) -> Result<()> {
        let mover = self.mover.clone();
        self.recovery
            .execute_with_retry("quarantine-move", || {
                let mover = mover.clone();
                let from = from.clone();
                let to = to.clone();
                async move { mover.move_object(&from, &to).await.map(|_| ()) }
            })
            .await
    }
}
