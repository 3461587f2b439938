//! Mutual exclusion for migration runs.
//!
//! One active run per scope. A lock row carries a holder token and an
//! expiry; checkpoint saves renew it, so a crashed process leaves a lock
//! that simply expires and can be reclaimed.

use super::RunStateStore;
use crate::error::{DroverError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// A held lock. Proof of acquisition; passed back for renew/release.
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub scope: String,
    pub run_id: String,
    pub holder: String,
}

/// Observed state of a scope's lock.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub scope: String,
    pub run_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Scoped run lock backed by the run-state store.
pub struct MigrationLock {
    store: Arc<RunStateStore>,
    scope: String,
    ttl: Duration,
}

impl MigrationLock {
    pub fn new(store: Arc<RunStateStore>, scope: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            scope: scope.into(),
            ttl,
        }
    }

    fn ttl_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::minutes(5))
    }

    /// Acquire the lock for a run.
    ///
    /// Fails fast with `LockHeld` when a live, unexpired lock is held
    /// elsewhere. Expired locks are reclaimed with a warning.
    pub fn acquire(&self, run_id: &str) -> Result<LockGuard> {
        let now = Utc::now();
        if let Some(current) = self.current()? {
            if !current.is_expired(now) {
                return Err(DroverError::LockHeld {
                    scope: self.scope.clone(),
                    holder: current.holder,
                });
            }
            warn!(
                scope = %self.scope,
                stale_run = %current.run_id,
                "reclaiming expired migration lock"
            );
        }

        let holder = Uuid::new_v4().to_string();
        let expires_at = now + self.ttl_chrono();
        self.store.upsert_lock(
            &self.scope,
            run_id,
            &holder,
            &now.to_rfc3339(),
            &expires_at.to_rfc3339(),
        )?;
        info!(scope = %self.scope, run_id, "acquired migration lock");
        Ok(LockGuard {
            scope: self.scope.clone(),
            run_id: run_id.to_string(),
            holder,
        })
    }

    /// Extend the expiry of a held lock.
    ///
    /// Fails with `LockLost` when the holder token no longer matches —
    /// someone force-cleared and re-acquired the scope.
    pub fn renew(&self, guard: &LockGuard) -> Result<()> {
        let expires_at = Utc::now() + self.ttl_chrono();
        let renewed = self
            .store
            .update_lock_expiry(&self.scope, &guard.holder, &expires_at.to_rfc3339())?;
        if !renewed {
            return Err(DroverError::LockLost {
                scope: self.scope.clone(),
            });
        }
        Ok(())
    }

    /// Release a held lock.
    pub fn release(&self, guard: &LockGuard) -> Result<()> {
        let released = self.store.delete_lock(&self.scope, Some(&guard.holder))?;
        if released {
            info!(scope = %self.scope, run_id = %guard.run_id, "released migration lock");
        }
        Ok(())
    }

    /// Forcibly clear the scope's lock regardless of holder.
    ///
    /// Operator escape hatch for stale locks from dead processes.
    pub fn force_clear(&self) -> Result<bool> {
        let cleared = self.store.delete_lock(&self.scope, None)?;
        if cleared {
            warn!(scope = %self.scope, "force-cleared migration lock");
        }
        Ok(cleared)
    }

    /// The current lock row of this scope, if any.
    pub fn current(&self) -> Result<Option<LockInfo>> {
        let Some(row) = self.store.get_lock(&self.scope)? else {
            return Ok(None);
        };
        let parse = |value: &str| {
            value
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now())
        };
        Ok(Some(LockInfo {
            scope: self.scope.clone(),
            run_id: row.run_id,
            holder: row.holder,
            acquired_at: parse(&row.acquired_at),
            expires_at: parse(&row.expires_at),
        }))
    }
}
