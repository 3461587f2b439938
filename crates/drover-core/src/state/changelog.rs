//! Append-only change log for a run.
//!
//! Every mutation a service performs is logged before the service reports
//! success for that item. Entries buffer in memory and flush in batches;
//! phase boundaries and shutdown force a flush. Each payload carries the
//! before-state needed to reverse the operation.

use super::RunStateStore;
use crate::error::Result;
use crate::model::{MatchConfidence, ObjectKey, Record};
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One logged mutation, tagged by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ChangeOp {
    /// An object was moved between (location, path) pairs.
    ObjectMoved { from: ObjectKey, to: ObjectKey },
    /// A record pointer was updated; prior pair retained for reversal.
    RecordPathUpdated {
        record_id: String,
        prior: ObjectKey,
        new: ObjectKey,
    },
    /// A broken record was repaired onto a resolvable object.
    RecordLinked {
        record_id: String,
        broken: ObjectKey,
        target: ObjectKey,
        confidence: MatchConfidence,
    },
    /// A record and its object were relocated into quarantine.
    RecordQuarantined {
        record: Record,
        quarantined_to: ObjectKey,
    },
    /// An unreferenced object was relocated into quarantine.
    ObjectQuarantined {
        from: ObjectKey,
        quarantined_to: ObjectKey,
    },
    /// A non-primary duplicate record's metadata row was removed.
    DuplicateRecordRemoved {
        record: Record,
        primary_record_id: String,
    },
    /// A previously removed record row was re-instated during rollback.
    RecordRestored { record: Record },
}

impl ChangeOp {
    /// Stable operation tag, as persisted in the `op` column.
    pub fn tag(&self) -> &'static str {
        match self {
            ChangeOp::ObjectMoved { .. } => "object-moved",
            ChangeOp::RecordPathUpdated { .. } => "record-path-updated",
            ChangeOp::RecordLinked { .. } => "record-linked",
            ChangeOp::RecordQuarantined { .. } => "record-quarantined",
            ChangeOp::ObjectQuarantined { .. } => "object-quarantined",
            ChangeOp::DuplicateRecordRemoved { .. } => "duplicate-record-removed",
            ChangeOp::RecordRestored { .. } => "record-restored",
        }
    }
}

/// A change-log entry with its per-run monotonic sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChangeLogEntry {
    pub run_id: String,
    pub seq: u64,
    pub phase: Phase,
    #[serde(flatten)]
    pub op: ChangeOp,
    pub recorded_at: DateTime<Utc>,
}

/// Buffered, batch-flushed change log for one run.
pub struct ChangeLogManager {
    store: Arc<RunStateStore>,
    run_id: String,
    flush_every: usize,
    buffer: Mutex<Vec<ChangeLogEntry>>,
    next_seq: AtomicU64,
}

impl ChangeLogManager {
    /// Create a manager for a run, continuing its sequence if entries
    /// already exist.
    pub fn new(store: Arc<RunStateStore>, run_id: impl Into<String>, flush_every: usize) -> Result<Self> {
        let run_id = run_id.into();
        let next_seq = store.max_change_log_seq(&run_id)?.map_or(1, |max| max + 1);
        Ok(Self {
            store,
            run_id,
            flush_every: flush_every.max(1),
            buffer: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Append an operation to the log. Returns the assigned sequence.
    ///
    /// Flushes automatically when the buffer reaches the configured size.
    pub fn log(&self, phase: Phase, op: ChangeOp) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = ChangeLogEntry {
            run_id: self.run_id.clone(),
            seq,
            phase,
            op,
            recorded_at: Utc::now(),
        };

        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(entry);
            buffer.len() >= self.flush_every
        };
        if should_flush {
            self.flush()?;
        }
        Ok(seq)
    }

    /// Number of buffered, unflushed entries.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Write all buffered entries in one transaction.
    pub fn flush(&self) -> Result<usize> {
        let entries: Vec<ChangeLogEntry> = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if entries.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(entries.len());
        for entry in &entries {
            rows.push((
                entry.seq,
                entry.phase.as_str().to_string(),
                entry.op.tag().to_string(),
                serde_json::to_string(entry)?,
                entry.recorded_at.to_rfc3339(),
            ));
        }
        self.store.append_change_log(&self.run_id, &rows)?;
        debug!(run_id = %self.run_id, flushed = rows.len(), "flushed change log");
        Ok(rows.len())
    }

    /// All flushed entries of this run, ordered by sequence.
    pub fn load_all(&self) -> Result<Vec<ChangeLogEntry>> {
        Self::load_run(&self.store, &self.run_id)
    }

    /// All flushed entries of any run, ordered by sequence.
    ///
    /// Used by rollback, which reads independently of the writer.
    pub fn load_run(store: &RunStateStore, run_id: &str) -> Result<Vec<ChangeLogEntry>> {
        let rows = store.load_change_log(run_id)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry: ChangeLogEntry = serde_json::from_str(&row.payload)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
