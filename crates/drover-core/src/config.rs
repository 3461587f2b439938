//! Migration run configuration.
//!
//! A `MigrationConfig` describes one run: the locations in play, canonical
//! placement, quarantine target, batching and error-tolerance knobs.
//! Validation happens once at startup; an invalid configuration means the
//! run never begins.

use crate::error::{DroverError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default values for migration tuning knobs.
pub struct MigrationDefaults;

impl MigrationDefaults {
    /// Items processed between checkpoint writes.
    pub const BATCH_SIZE: usize = 200;
    /// Buffered change-log entries before an automatic flush.
    pub const FLUSH_EVERY: usize = 100;
    /// Retry attempts per object operation (including the first).
    pub const MAX_RETRIES: u32 = 3;
    /// Base delay for exponential backoff.
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    /// Cap on backoff delay.
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
    /// One error signature recurring past this count halts the run.
    pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 10;
    /// Cumulative error cap across all signatures.
    pub const ERROR_BUDGET: u32 = 250;
    /// Minimum similarity score for a fuzzy link-repair candidate.
    pub const SIMILARITY_THRESHOLD: f64 = 0.55;
    /// How long non-current checkpoints are retained.
    pub const CHECKPOINT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
    /// Lock lifetime between renewals.
    pub const LOCK_TTL: Duration = Duration::from_secs(300);
    /// Concurrent object transfers within a batch.
    pub const MAX_CONCURRENT_TRANSFERS: usize = 4;
    /// Path segment that marks an "originals" candidate during repair.
    pub const ORIGINALS_SUBPATH: &'static str = "originals";
    /// Entries sampled by the post-rollback verification pass.
    pub const ROLLBACK_SAMPLE_SIZE: usize = 50;
    /// File name of the run-state database inside the state directory.
    pub const STATE_DB_NAME: &'static str = "migration_state.db";
    /// Subdirectory of the state directory holding pre-run snapshots.
    pub const SNAPSHOT_DIR_NAME: &'static str = "snapshots";
    /// Subdirectory of the state directory used for staged copies.
    pub const STAGING_DIR_NAME: &'static str = "staging";
}

/// Configuration for one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MigrationConfig {
    /// All locations whose objects participate in the run.
    pub locations: Vec<String>,
    /// Location that live objects are consolidated into.
    pub canonical_location: String,
    /// Path prefix inside the canonical location ("" for the root).
    pub canonical_prefix: String,
    /// Location that quarantined objects are moved into. Must not be one
    /// of `locations`.
    pub quarantine_location: String,
    /// Path segment identifying preferred "originals" repair candidates.
    pub originals_subpath: String,
    /// Directory for the run-state database, snapshots and staging area.
    pub state_dir: PathBuf,
    /// Lock scope; one active run per scope.
    pub lock_scope: String,
    pub batch_size: usize,
    pub flush_every: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub error_budget: u32,
    pub similarity_threshold: f64,
    pub checkpoint_retention: Duration,
    pub lock_ttl: Duration,
    pub max_concurrent_transfers: usize,
}

impl MigrationConfig {
    /// Create a configuration with default tuning for the given locations.
    pub fn new(
        locations: Vec<String>,
        canonical_location: impl Into<String>,
        quarantine_location: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            locations,
            canonical_location: canonical_location.into(),
            canonical_prefix: String::new(),
            quarantine_location: quarantine_location.into(),
            originals_subpath: MigrationDefaults::ORIGINALS_SUBPATH.to_string(),
            state_dir: state_dir.into(),
            lock_scope: "migration".to_string(),
            batch_size: MigrationDefaults::BATCH_SIZE,
            flush_every: MigrationDefaults::FLUSH_EVERY,
            max_retries: MigrationDefaults::MAX_RETRIES,
            retry_base_delay: MigrationDefaults::RETRY_BASE_DELAY,
            circuit_breaker_threshold: MigrationDefaults::CIRCUIT_BREAKER_THRESHOLD,
            error_budget: MigrationDefaults::ERROR_BUDGET,
            similarity_threshold: MigrationDefaults::SIMILARITY_THRESHOLD,
            checkpoint_retention: MigrationDefaults::CHECKPOINT_RETENTION,
            lock_ttl: MigrationDefaults::LOCK_TTL,
            max_concurrent_transfers: MigrationDefaults::MAX_CONCURRENT_TRANSFERS,
        }
    }

    /// Path of the run-state database.
    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join(MigrationDefaults::STATE_DB_NAME)
    }

    /// Directory holding pre-run metadata snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join(MigrationDefaults::SNAPSHOT_DIR_NAME)
    }

    /// Directory used for staged duplicate-verification copies.
    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join(MigrationDefaults::STAGING_DIR_NAME)
    }

    /// Validate the configuration. Called once at run startup.
    pub fn validate(&self) -> Result<()> {
        if self.locations.is_empty() {
            return Err(config_err("at least one location is required"));
        }
        if !self.locations.contains(&self.canonical_location) {
            return Err(config_err(format!(
                "canonical location '{}' is not among the configured locations",
                self.canonical_location
            )));
        }
        if self.locations.contains(&self.quarantine_location) {
            return Err(config_err(format!(
                "quarantine location '{}' must not be a migrated location",
                self.quarantine_location
            )));
        }
        if self.quarantine_location.is_empty() {
            return Err(config_err("quarantine location is required"));
        }
        if self.batch_size == 0 {
            return Err(config_err("batch_size must be positive"));
        }
        if self.flush_every == 0 {
            return Err(config_err("flush_every must be positive"));
        }
        if self.max_retries == 0 {
            return Err(config_err("max_retries must be positive"));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(config_err("max_concurrent_transfers must be positive"));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(config_err(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(config_err("circuit_breaker_threshold must be positive"));
        }
        if self.circuit_breaker_threshold > self.error_budget {
            return Err(config_err(format!(
                "circuit_breaker_threshold ({}) must not exceed error_budget ({})",
                self.circuit_breaker_threshold, self.error_budget
            )));
        }
        Ok(())
    }
}

fn config_err(message: impl Into<String>) -> DroverError {
    DroverError::Config {
        message: message.into(),
    }
}
