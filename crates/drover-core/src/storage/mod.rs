//! Storage backend abstraction.
//!
//! A `StorageLocationClient` gives uniform read/write/list/exists/delete
//! and rename access to named locations. The orchestration core only ever
//! talks to backends through this trait; `local` provides the
//! filesystem-backed implementation and `transfer` the move strategy
//! negotiated per location pair.

pub mod local;
pub mod transfer;

use crate::error::Result;
use crate::model::ObjectMeta;
use async_trait::async_trait;

pub use local::LocalStorageClient;
pub use transfer::{MoveStrategy, ObjectMover};

/// Uniform access to named storage locations.
///
/// Paths are location-relative, `/`-separated. Implementations must treat
/// `write` as create-or-replace and make `rename` atomic within a location
/// when `supports_rename` reports true for it.
#[async_trait]
pub trait StorageLocationClient: Send + Sync {
    /// List objects in a location whose paths start with `prefix`.
    ///
    /// An empty prefix lists the whole location.
    async fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Read an object's full content.
    async fn read(&self, location: &str, path: &str) -> Result<Vec<u8>>;

    /// Write an object, replacing any existing content at the path.
    async fn write(&self, location: &str, path: &str, bytes: &[u8]) -> Result<()>;

    /// Check whether an object exists at the path.
    async fn exists(&self, location: &str, path: &str) -> Result<bool>;

    /// Delete an object.
    async fn delete(&self, location: &str, path: &str) -> Result<()>;

    /// Rename an object within a single location.
    async fn rename(&self, location: &str, from: &str, to: &str) -> Result<()>;

    /// Whether this backend supports in-place rename for a location.
    ///
    /// When false, movers fall back to copy-then-delete.
    fn supports_rename(&self, _location: &str) -> bool {
        true
    }
}
