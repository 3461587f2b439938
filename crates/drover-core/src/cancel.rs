//! Cooperative cancellation for long-running phases.
//!
//! The orchestrator hands one token to every phase; the host wires it to
//! whatever shutdown signal it owns. Phases poll between batches, finish
//! the in-flight item, flush state, and exit resumable.

use crate::error::{DroverError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation token shared across the run.
///
/// Clones observe each other: cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, un-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(DroverError::Cancelled)` if cancellation was requested.
    ///
    /// Convenience for batch loops that bail out with `?`.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DroverError::Cancelled)
        } else {
            Ok(())
        }
    }
}
