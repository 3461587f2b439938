//! Drover Core - Headless orchestration for bulk storage record migration.
//!
//! This crate relocates large collections of file-backed metadata records
//! between storage backends while the host's metadata store keeps
//! referencing them. One run walks a fixed phase pipeline — inventory,
//! link repair, duplicate resolution, consolidation, quarantine,
//! verification — under a single-writer lock, checkpointing at batch
//! boundaries and change-logging every mutation so the whole run is
//! resumable and reversible.
//!
//! # Example
//!
//! ```rust,ignore
//! use drover_core::{LocalStorageClient, MigrationConfig, MigrationOrchestrator};
//! use drover_core::metadata::SqliteMetadataRepository;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> drover_core::Result<()> {
//!     let storage = Arc::new(
//!         LocalStorageClient::new()
//!             .with_location("primary", "/srv/media/primary")
//!             .with_location("archive", "/srv/media/archive")
//!             .with_location("quarantine", "/srv/media/quarantine"),
//!     );
//!     let repo = Arc::new(SqliteMetadataRepository::open("/srv/media/records.db")?);
//!     let config = MigrationConfig::new(
//!         vec!["primary".into(), "archive".into()],
//!         "primary",
//!         "quarantine",
//!         "/srv/media/migration-state",
//!     );
//!
//!     let orchestrator = MigrationOrchestrator::new(config, storage, repo)?;
//!     let summary = orchestrator.start().await?;
//!     println!("run {} complete: {:?}", summary.run_id, summary.counters);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod consolidate;
pub mod duplicates;
pub mod error;
pub mod inventory;
pub mod metadata;
pub mod model;
pub mod naming;
pub mod orchestrator;
pub mod phase;
pub mod quarantine;
pub mod recovery;
pub mod repair;
pub mod rollback;
pub mod state;
pub mod storage;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{MigrationConfig, MigrationDefaults};
pub use consolidate::ConsolidationService;
pub use duplicates::{DuplicateOutcome, DuplicateResolutionService};
pub use error::{DroverError, Result};
pub use inventory::{Inventory, InventoryBuilder};
pub use metadata::{MetadataRepository, SqliteMetadataRepository};
pub use model::{
    MatchConfidence, ObjectKey, ObjectMeta, Record, RecordClass, RunCounters, RunStatus,
    RunSummary,
};
pub use orchestrator::MigrationOrchestrator;
pub use phase::Phase;
pub use quarantine::{LiveFlagUsage, QuarantineService, UsageSignal};
pub use recovery::{ErrorRecoveryManager, RetryConfig};
pub use repair::LinkRepairService;
pub use rollback::{RollbackEngine, RollbackMethod, RollbackReport};
pub use state::{
    ChangeLogEntry, ChangeLogManager, ChangeOp, Checkpoint, CheckpointManager, MigrationLock,
    RunStateStore,
};
pub use storage::{LocalStorageClient, MoveStrategy, ObjectMover, StorageLocationClient};
