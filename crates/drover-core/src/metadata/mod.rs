//! Metadata persistence seam.
//!
//! The host application owns the relational metadata store; the migration
//! core mutates records only through this trait. `sqlite` provides the
//! bundled implementation used by local deployments and the test suite.

pub mod sqlite;

use crate::error::Result;
use crate::model::Record;
use async_trait::async_trait;

pub use sqlite::SqliteMetadataRepository;

/// Find/update access to the host metadata store.
///
/// `mark_removed` is the only operation that destroys a metadata row, and
/// callers invoke it solely for verified duplicate-record cleanup.
/// `restore` re-instates a row from change-log before-state during
/// rollback.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// All records, live and not.
    async fn all_records(&self) -> Result<Vec<Record>>;

    /// Look up one record by its stable identifier.
    async fn find_by_id(&self, id: &str) -> Result<Option<Record>>;

    /// All records carrying the exact logical filename.
    async fn find_by_filename(&self, filename: &str) -> Result<Vec<Record>>;

    /// All records pointing at the given (location, path).
    async fn find_by_object(&self, location: &str, path: &str) -> Result<Vec<Record>>;

    /// Repoint a record at a new (location, path).
    async fn update_location_and_path(&self, id: &str, location: &str, path: &str) -> Result<()>;

    /// Set the live flag of a record.
    async fn set_live(&self, id: &str, live: bool) -> Result<()>;

    /// Remove a record's metadata row.
    async fn mark_removed(&self, id: &str) -> Result<()>;

    /// Insert or replace a record, restoring logged before-state.
    async fn restore(&self, record: &Record) -> Result<()>;
}
