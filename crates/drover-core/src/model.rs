//! Core data model: records, storage objects, classifications, counters.

use crate::naming;
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A metadata record describing a managed file-backed resource.
///
/// Owned by the metadata repository; services mutate it only through the
/// repository interface, and every mutation is change-logged first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Record {
    /// Stable identifier.
    pub id: String,
    /// Logical filename as the host application knows it.
    pub filename: String,
    /// Owning location id.
    pub location: String,
    /// Path within the owning location.
    pub path: String,
    /// Size in bytes, when known.
    pub size: Option<u64>,
    /// Optional SHA-256 content fingerprint (lowercase hex).
    pub fingerprint: Option<String>,
    /// Last modification time of the record.
    pub modified_at: DateTime<Utc>,
    /// Whether active application content still references this record.
    pub live: bool,
}

impl Record {
    /// The (location, path) pair this record points at.
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey {
            location: self.location.clone(),
            path: self.path.clone(),
        }
    }

    /// Normalized filename used for index keys.
    pub fn normalized_filename(&self) -> String {
        naming::normalize_filename(&self.filename)
    }
}

/// Identity of a physical object: its (location, path) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub location: String,
    pub path: String,
}

impl ObjectKey {
    pub fn new(location: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.location, self.path)
    }
}

/// A physical object discovered by listing a location.
///
/// Objects have no identity beyond their path: several records may
/// reference one path, or a record may reference a path with no object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ObjectMeta {
    pub location: String,
    pub path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            location: self.location.clone(),
            path: self.path.clone(),
        }
    }

    /// Final path segment.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Normalized filename used for index keys.
    pub fn normalized_filename(&self) -> String {
        naming::normalize_filename(self.filename())
    }
}

/// Classification of a record against the object index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordClass {
    /// The record's (location, path) resolves to an existing object in the
    /// canonical location.
    LinkedCorrect,
    /// The record resolves, but the object lives outside the canonical
    /// location and needs consolidation.
    LinkedWrongLocation,
    /// The record's path does not resolve to any object.
    Broken,
}

/// Classification of a discovered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectClass {
    /// At least one live record references this object.
    Referenced,
    /// No live record references this object.
    Orphaned,
}

/// Audit confidence of a link repair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MatchConfidence {
    /// Exact normalized-filename match.
    Exact,
    /// Fuzzy match with its similarity score.
    Fuzzy { score: f64 },
}

impl MatchConfidence {
    /// Audit label recorded alongside the repair.
    pub fn method(&self) -> &'static str {
        match self {
            MatchConfidence::Exact => "filename_exact",
            MatchConfidence::Fuzzy { .. } => "filename_fuzzy",
        }
    }
}

/// Counters accumulated across a run, persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunCounters {
    pub records_total: u64,
    pub objects_total: u64,
    pub records_broken: u64,
    pub records_repaired: u64,
    pub records_unrepairable: u64,
    pub duplicate_groups: u64,
    pub duplicate_records_removed: u64,
    pub duplicate_groups_aborted: u64,
    pub objects_consolidated: u64,
    pub objects_quarantined: u64,
    pub records_quarantined: u64,
    pub transient_errors: u64,
    pub items_skipped: u64,
    pub verification_violations: u64,
}

/// A record that remained broken after exhaustive repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UnrepairedRecord {
    pub record_id: String,
    pub filename: String,
    pub location: String,
    pub path: String,
    pub reason: String,
}

/// An invariant violation found by the verification phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IntegrityViolation {
    pub subject: String,
    pub detail: String,
}

/// Point-in-time view of a run, served by `status(run_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunStatus {
    pub run_id: String,
    pub phase: Phase,
    pub completed: bool,
    pub processed_in_phase: u64,
    pub counters: RunCounters,
    pub updated_at: DateTime<Utc>,
}

/// Final report of a run invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunSummary {
    pub run_id: String,
    pub completed: bool,
    pub counters: RunCounters,
    /// Broken records surfaced for the operator, never silently dropped.
    pub unrepaired: Vec<UnrepairedRecord>,
    pub violations: Vec<IntegrityViolation>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
