//! Checkpoint persistence and retention.
//!
//! A checkpoint captures where a run stands: current phase, the
//! processed-ID set for the phase, and the accumulated counters. Saving at
//! batch boundaries is what makes crashes resumable without reprocessing.

use super::RunStateStore;
use crate::error::{DroverError, Result};
use crate::model::RunCounters;
use crate::phase::Phase;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resumable progress state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    pub run_id: String,
    pub phase: Phase,
    /// Identifiers already processed within the current phase.
    pub processed_ids: BTreeSet<String>,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint for a new run, positioned at the first phase.
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            phase: Phase::Inventory,
            processed_ids: BTreeSet::new(),
            counters: RunCounters::default(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to the next phase, clearing the per-phase processed set.
    pub fn advance_to(&mut self, phase: Phase) {
        self.phase = phase;
        self.processed_ids.clear();
    }

    pub fn mark_processed(&mut self, id: impl Into<String>) {
        self.processed_ids.insert(id.into());
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_ids.contains(id)
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }
}

/// Saves, loads and prunes checkpoints.
pub struct CheckpointManager {
    store: Arc<RunStateStore>,
    retention: Duration,
    renewal: std::sync::Mutex<Option<(Arc<super::MigrationLock>, super::LockGuard)>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<RunStateStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            renewal: std::sync::Mutex::new(None),
        }
    }

    /// Attach the run lock so every checkpoint write renews it.
    pub fn attach_lock(&self, lock: Arc<super::MigrationLock>, guard: super::LockGuard) {
        *self.renewal.lock().unwrap() = Some((lock, guard));
    }

    /// Persist a checkpoint as the new current state of its run.
    ///
    /// Also renews the attached run lock: a process that keeps
    /// checkpointing keeps its lock alive.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut stamped = checkpoint.clone();
        stamped.updated_at = Utc::now();
        let payload = serde_json::to_string(&stamped)?;
        self.store.insert_checkpoint(
            &stamped.run_id,
            stamped.phase.as_str(),
            &payload,
            &stamped.updated_at.to_rfc3339(),
        )?;
        debug!(
            run_id = %stamped.run_id,
            phase = %stamped.phase,
            processed = stamped.processed_ids.len(),
            "saved checkpoint"
        );

        let renewal = self.renewal.lock().unwrap();
        if let Some((lock, guard)) = renewal.as_ref() {
            lock.renew(guard)?;
        }
        Ok(())
    }

    /// Load the most recent checkpoint of a run.
    pub fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        match self.store.latest_checkpoint(run_id)? {
            Some(payload) => {
                let checkpoint = serde_json::from_str(&payload)?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Load the most recent checkpoint, erroring for unknown runs.
    pub fn require_latest(&self, run_id: &str) -> Result<Checkpoint> {
        self.load_latest(run_id)?.ok_or_else(|| DroverError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Drop checkpoints older than the retention window, keeping at least
    /// the newest one per run. Returns the number pruned.
    pub fn prune(&self) -> Result<usize> {
        let retention = ChronoDuration::from_std(self.retention)
            .unwrap_or_else(|_| ChronoDuration::days(7));
        let cutoff = (Utc::now() - retention).to_rfc3339();
        let pruned = self.store.prune_checkpoints(&cutoff)?;
        if pruned > 0 {
            debug!(pruned, "pruned old checkpoints");
        }
        Ok(pruned)
    }
}
