//! Consolidation: move live objects to their canonical placement.
//!
//! Canonical placement is the canonical location plus the normalized
//! filename under the configured prefix; name collisions get a numeric
//! suffix. Object transfers within a batch run on a bounded pool, while
//! metadata updates and logging stay on the single writer. Each batch is
//! checkpointed before the next starts, so resume skips already-moved
//! identifiers instead of re-deriving state.

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::metadata::MetadataRepository;
use crate::model::{ObjectKey, Record};
use crate::phase::Phase;
use crate::recovery::ErrorRecoveryManager;
use crate::state::{ChangeLogManager, ChangeOp, Checkpoint, CheckpointManager};
use crate::storage::{ObjectMover, StorageLocationClient};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One planned move, computed serially before transfers start.
struct PlannedMove {
    record: Record,
    from: ObjectKey,
    to: ObjectKey,
}

/// Moves live, linked records' objects into the canonical location.
pub struct ConsolidationService {
    storage: Arc<dyn StorageLocationClient>,
    repo: Arc<dyn MetadataRepository>,
    recovery: Arc<ErrorRecoveryManager>,
    checkpoints: Arc<CheckpointManager>,
    mover: Arc<ObjectMover>,
    config: MigrationConfig,
}

impl ConsolidationService {
    pub fn new(
        storage: Arc<dyn StorageLocationClient>,
        repo: Arc<dyn MetadataRepository>,
        recovery: Arc<ErrorRecoveryManager>,
        checkpoints: Arc<CheckpointManager>,
        config: MigrationConfig,
    ) -> Self {
        let mover = Arc::new(ObjectMover::new(storage.clone()));
        Self {
            storage,
            repo,
            recovery,
            checkpoints,
            mover,
            config,
        }
    }

    /// Consolidate every out-of-place live record. Returns moves made.
    pub async fn run(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let candidates: Vec<Record> = inventory
            .linked_records()
            .into_iter()
            .filter(|r| !checkpoint.is_processed(&r.id))
            .cloned()
            .collect();
        info!(count = candidates.len(), "consolidating records");

        let mut moved_total = 0u64;
        let mut claimed: HashSet<ObjectKey> = HashSet::new();

        for batch in candidates.chunks(self.config.batch_size) {
            cancel.check()?;

            // Plan serially so collision suffixes are assigned once.
            let mut planned = Vec::new();
            for record in batch {
                let from = record.object_key();
                let to = self.canonical_target(inventory, record, &mut claimed).await?;
                if to == from {
                    checkpoint.mark_processed(&record.id);
                    continue;
                }
                planned.push(PlannedMove {
                    record: record.clone(),
                    from,
                    to,
                });
            }

            // Transfers run on the bounded pool; results come back for the
            // single writer to apply.
            let results: Vec<(PlannedMove, Result<()>)> = stream::iter(planned)
                .map(|plan| {
                    let mover = self.mover.clone();
                    let recovery = self.recovery.clone();
                    async move {
                        let result = recovery
                            .execute_with_retry("consolidate-move", || {
                                let mover = mover.clone();
                                let from = plan.from.clone();
                                let to = plan.to.clone();
                                async move { mover.move_object(&from, &to).await.map(|_| ()) }
                            })
                            .await;
                        (plan, result)
                    }
                })
                .buffer_unordered(self.config.max_concurrent_transfers)
                .collect()
                .await;

            for (plan, result) in results {
                match result {
                    Ok(()) => {
                        changelog.log(
                            Phase::Consolidation,
                            ChangeOp::ObjectMoved {
                                from: plan.from.clone(),
                                to: plan.to.clone(),
                            },
                        )?;
                        changelog.log(
                            Phase::Consolidation,
                            ChangeOp::RecordPathUpdated {
                                record_id: plan.record.id.clone(),
                                prior: plan.from.clone(),
                                new: plan.to.clone(),
                            },
                        )?;
                        self.repo
                            .update_location_and_path(
                                &plan.record.id,
                                &plan.to.location,
                                &plan.to.path,
                            )
                            .await?;
                        inventory.object_moved(&plan.from, plan.to.clone());
                        inventory.relink(
                            &plan.record.id,
                            plan.to.clone(),
                            &self.config.canonical_location,
                        );
                        checkpoint.counters.objects_consolidated += 1;
                        moved_total += 1;
                        debug!(record_id = %plan.record.id, to = %plan.to, "consolidated");
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(record_id = %plan.record.id, error = %err, "consolidation skipped");
                        checkpoint.counters.items_skipped += 1;
                        checkpoint.counters.transient_errors += 1;
                    }
                }
                checkpoint.mark_processed(&plan.record.id);
            }

            changelog.flush()?;
            self.checkpoints.save(checkpoint)?;
        }

        Ok(moved_total)
    }

    /// Canonical (location, path) for a record, with collision suffixes.
    async fn canonical_target(
        &self,
        inventory: &Inventory,
        record: &Record,
        claimed: &mut HashSet<ObjectKey>,
    ) -> Result<ObjectKey> {
        let normalized = record.normalized_filename();
        let (stem, ext) = match normalized.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (normalized.clone(), None),
        };

        let current = record.object_key();
        let mut attempt = 0u32;
        loop {
            let filename = match (&ext, attempt) {
                (Some(ext), 0) => format!("{}.{}", stem, ext),
                (Some(ext), n) => format!("{}-{}.{}", stem, n, ext),
                (None, 0) => stem.clone(),
                (None, n) => format!("{}-{}", stem, n),
            };
            let path = if self.config.canonical_prefix.is_empty() {
                filename
            } else {
                format!("{}/{}", self.config.canonical_prefix.trim_end_matches('/'), filename)
            };
            let key = ObjectKey::new(self.config.canonical_location.clone(), path);

            // The record's own object occupying the target is not a
            // collision.
            if key == current {
                return Ok(key);
            }

            let occupied = claimed.contains(&key)
                || inventory.objects.contains_key(&key)
                || self.exists(&key).await?;
            if !occupied {
                claimed.insert(key.clone());
                return Ok(key);
            }
            attempt += 1;
        }
    }

    async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        let storage = self.storage.clone();
        let location = key.location.clone();
        let path = key.path.clone();
        self.recovery
            .execute_with_retry("exists", || {
                let storage = storage.clone();
                let location = location.clone();
                let path = path.clone();
                async move { storage.exists(&location, &path).await }
            })
            .await
    }
}
