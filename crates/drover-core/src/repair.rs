//! Link repair: reconnect records whose paths no longer resolve.
//!
//! Exact normalized-filename matches win outright; when none exist the
//! search widens to fuzzy candidates within the same extension family.
//! Tied candidates resolve by a deterministic priority: an "originals"
//! subpath outranks everything, then residence in the canonical location,
//! then most-recent modification, then lexicographic path. Every repair
//! records its confidence for audit, and records that stay broken are
//! surfaced, never dropped.

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::metadata::MetadataRepository;
use crate::model::{MatchConfidence, ObjectKey, Record};
use crate::naming;
use crate::phase::Phase;
use crate::state::{ChangeLogManager, ChangeOp, Checkpoint, CheckpointManager};
use std::sync::Arc;
use tracing::{debug, info};

/// A scored repair candidate.
#[derive(Debug, Clone)]
struct Candidate {
    key: ObjectKey,
    score: f64,
    in_originals: bool,
    in_canonical: bool,
    modified_at: chrono::DateTime<chrono::Utc>,
}

/// Repairs broken record links against the object index.
pub struct LinkRepairService {
    repo: Arc<dyn MetadataRepository>,
    checkpoints: Arc<CheckpointManager>,
    config: MigrationConfig,
}

impl LinkRepairService {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        checkpoints: Arc<CheckpointManager>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            repo,
            checkpoints,
            config,
        }
    }

    /// Repair every live broken record. Returns the number repaired.
    pub async fn run(
        &self,
        inventory: &mut Inventory,
        changelog: &ChangeLogManager,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let broken: Vec<Record> = inventory
            .broken_records()
            .into_iter()
            .filter(|r| r.live && !checkpoint.is_processed(&r.id))
            .cloned()
            .collect();
        info!(count = broken.len(), "repairing broken records");

        let mut repaired = 0u64;
        for batch in broken.chunks(self.config.batch_size) {
            cancel.check()?;
            for record in batch {
                match self.select_candidate(inventory, record) {
                    Some((target, confidence)) => {
                        changelog.log(
                            Phase::LinkRepair,
                            ChangeOp::RecordLinked {
                                record_id: record.id.clone(),
                                broken: record.object_key(),
                                target: target.clone(),
                                confidence,
                            },
                        )?;
                        self.repo
                            .update_location_and_path(&record.id, &target.location, &target.path)
                            .await?;
                        inventory.relink(&record.id, target, &self.config.canonical_location);
                        repaired += 1;
                        checkpoint.counters.records_repaired += 1;
                        debug!(
                            record_id = %record.id,
                            method = confidence.method(),
                            "repaired record link"
                        );
                    }
                    None => {
                        checkpoint.counters.records_unrepairable += 1;
                        debug!(record_id = %record.id, "no repair candidate found");
                    }
                }
                checkpoint.mark_processed(&record.id);
            }
            changelog.flush()?;
            self.checkpoints.save(checkpoint)?;
        }

        Ok(repaired)
    }

    /// Pick the best candidate object for a broken record.
    ///
    /// Exact matches first; fuzzy candidates only when no exact match
    /// exists, gated by the similarity threshold and the extension
    /// family.
    fn select_candidate(
        &self,
        inventory: &Inventory,
        record: &Record,
    ) -> Option<(ObjectKey, MatchConfidence)> {
        let exact = self.exact_candidates(inventory, record);
        if !exact.is_empty() {
            let best = self.rank(exact)?;
            return Some((best.key, MatchConfidence::Exact));
        }

        let fuzzy = self.fuzzy_candidates(inventory, record);
        let best = self.rank(fuzzy)?;
        let score = best.score;
        Some((best.key, MatchConfidence::Fuzzy { score }))
    }

    fn exact_candidates(&self, inventory: &Inventory, record: &Record) -> Vec<Candidate> {
        let normalized = record.normalized_filename();
        inventory
            .objects_by_filename
            .get(&normalized)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.candidate(inventory, record, key, 1.0))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn fuzzy_candidates(&self, inventory: &Inventory, record: &Record) -> Vec<Candidate> {
        let Some(ext) = naming::extension(&record.filename) else {
            return Vec::new();
        };
        let family = naming::extension_family(&ext);
        let Some(keys) = inventory.objects_by_family.get(&family) else {
            return Vec::new();
        };

        keys.iter()
            .filter_map(|key| {
                let meta = inventory.objects.get(key)?;
                let score = naming::filename_similarity(&record.filename, meta.filename());
                if score >= self.config.similarity_threshold {
                    self.candidate(inventory, record, key, score)
                } else {
                    None
                }
            })
            .collect()
    }

    fn candidate(
        &self,
        inventory: &Inventory,
        record: &Record,
        key: &ObjectKey,
        score: f64,
    ) -> Option<Candidate> {
        // The record's current (broken) target is not a candidate.
        if *key == record.object_key() {
            return None;
        }
        let meta = inventory.objects.get(key)?;
        let originals_segment = format!("/{}/", self.config.originals_subpath);
        let in_originals = key.path.starts_with(&format!("{}/", self.config.originals_subpath))
            || key.path.contains(&originals_segment);
        Some(Candidate {
            key: key.clone(),
            score,
            in_originals,
            in_canonical: key.location == self.config.canonical_location,
            modified_at: meta.modified_at,
        })
    }

    /// Order candidates by score, then the deterministic priority ladder.
    fn rank(&self, mut candidates: Vec<Candidate>) -> Option<Candidate> {
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.in_originals.cmp(&a.in_originals))
                .then(b.in_canonical.cmp(&a.in_canonical))
                .then(b.modified_at.cmp(&a.modified_at))
                .then(a.key.path.cmp(&b.key.path))
        });
        candidates.into_iter().next()
    }
}
