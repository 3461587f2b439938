//! Object move strategy, negotiated once per location pair.
//!
//! Same-location moves use the backend's rename when it supports one;
//! everything else is copy, verify, then delete-source. The source object
//! is never deleted before the destination copy has been verified.

use super::StorageLocationClient;
use crate::error::{DroverError, Result};
use crate::model::ObjectKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// How objects move between a given (source, destination) location pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStrategy {
    /// Atomic rename within one location.
    Rename,
    /// Read source, write destination, verify the copy, delete source.
    CopyThenDelete,
}

/// Moves objects according to the per-pair negotiated strategy.
pub struct ObjectMover {
    client: Arc<dyn StorageLocationClient>,
    strategies: Mutex<HashMap<(String, String), MoveStrategy>>,
}

impl ObjectMover {
    pub fn new(client: Arc<dyn StorageLocationClient>) -> Self {
        Self {
            client,
            strategies: Mutex::new(HashMap::new()),
        }
    }

    /// The strategy for moving from `from` to `to`, negotiated on first use.
    pub fn strategy_for(&self, from: &str, to: &str) -> MoveStrategy {
        let key = (from.to_string(), to.to_string());
        let mut strategies = self.strategies.lock().unwrap();
        *strategies.entry(key).or_insert_with(|| {
            let strategy = if from == to && self.client.supports_rename(from) {
                MoveStrategy::Rename
            } else {
                MoveStrategy::CopyThenDelete
            };
            debug!(from, to, ?strategy, "negotiated move strategy");
            strategy
        })
    }

    /// Move an object, reporting the strategy that was used.
    ///
    /// Copy-then-delete verifies the destination content against the
    /// source digest before the source is removed; a verification failure
    /// removes the bad copy and leaves the source untouched.
    pub async fn move_object(&self, from: &ObjectKey, to: &ObjectKey) -> Result<MoveStrategy> {
        let strategy = self.strategy_for(&from.location, &to.location);
        match strategy {
            MoveStrategy::Rename => {
                self.client
                    .rename(&from.location, &from.path, &to.path)
                    .await?;
            }
            MoveStrategy::CopyThenDelete => {
                let bytes = self.client.read(&from.location, &from.path).await?;
                let expected = sha256_hex(&bytes);

                self.client.write(&to.location, &to.path, &bytes).await?;

                let written = self.client.read(&to.location, &to.path).await?;
                let actual = sha256_hex(&written);
                if actual != expected {
                    let _ = self.client.delete(&to.location, &to.path).await;
                    return Err(DroverError::IntegrityFailure {
                        subject: to.to_string(),
                        expected,
                        actual,
                    });
                }

                self.client.delete(&from.location, &from.path).await?;
            }
        }
        Ok(strategy)
    }
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
