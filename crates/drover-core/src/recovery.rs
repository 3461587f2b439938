//! Retry with backoff plus repeated-error circuit breaking.
//!
//! Every object operation runs through `execute_with_retry`. Transient
//! failures back off exponentially with jitter. Failures that survive
//! their retries are counted per error signature; one signature recurring
//! past the configured threshold raises a fatal circuit break, and a
//! softer cumulative budget caps total failures across all signatures.

use crate::config::{MigrationConfig, MigrationDefaults};
use crate::error::{DroverError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Cap on backoff delay.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MigrationDefaults::MAX_RETRIES,
            base_delay: MigrationDefaults::RETRY_BASE_DELAY,
            max_delay: MigrationDefaults::RETRY_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following attempt `attempt` (0-indexed).
    ///
    /// Exponential doubling from the base, capped, with decorrelated
    /// jitter multiplying by a factor in [0.5, 1.5) so synchronized
    /// retries spread out without allowing near-zero delays.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt as i32);
        let capped = (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());
        let final_secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };
        Duration::from_secs_f64(final_secs)
    }
}

/// Per-run error accounting and retry driver.
pub struct ErrorRecoveryManager {
    retry: RetryConfig,
    circuit_threshold: u32,
    error_budget: u32,
    signature_counts: Mutex<HashMap<String, u32>>,
    total_errors: AtomicU32,
}

impl ErrorRecoveryManager {
    pub fn new(retry: RetryConfig, circuit_threshold: u32, error_budget: u32) -> Self {
        Self {
            retry,
            circuit_threshold,
            error_budget,
            signature_counts: Mutex::new(HashMap::new()),
            total_errors: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            RetryConfig {
                max_attempts: config.max_retries,
                base_delay: config.retry_base_delay,
                ..RetryConfig::default()
            },
            config.circuit_breaker_threshold,
            config.error_budget,
        )
    }

    /// Run an operation, retrying transient failures with backoff.
    ///
    /// The error returned after exhausted retries is accounted against its
    /// signature; past the threshold the caller receives `CircuitBreak`
    /// instead, and past the cumulative budget `ErrorBudgetExceeded`.
    pub async fn execute_with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(label, attempts = attempt + 1, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if err.is_retryable() && attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            label,
                            attempt = attempt + 1,
                            max = self.retry.max_attempts,
                            error = %err,
                            "retrying after {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(self.note_failure(err));
                }
            }
        }
    }

    /// Account a final (post-retry) failure, escalating when thresholds
    /// are crossed. Fatal lifecycle errors pass through uncounted.
    pub fn note_failure(&self, err: DroverError) -> DroverError {
        if err.is_fatal() {
            return err;
        }

        let signature = err.signature();
        let signature_count = {
            let mut counts = self.signature_counts.lock().unwrap();
            let count = counts.entry(signature.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let total = self.total_errors.fetch_add(1, Ordering::SeqCst) + 1;

        if signature_count > self.circuit_threshold {
            warn!(
                signature = %signature,
                count = signature_count,
                "circuit break: repeated error signature"
            );
            return DroverError::CircuitBreak {
                signature,
                count: signature_count,
                threshold: self.circuit_threshold,
            };
        }
        if total > self.error_budget {
            warn!(total, budget = self.error_budget, "error budget exceeded");
            return DroverError::ErrorBudgetExceeded {
                count: total,
                budget: self.error_budget,
            };
        }
        err
    }

    /// Occurrences recorded for a signature.
    pub fn signature_count(&self, signature: &str) -> u32 {
        self.signature_counts
            .lock()
            .unwrap()
            .get(signature)
            .copied()
            .unwrap_or(0)
    }

    /// Cumulative failures recorded across all signatures.
    pub fn total_errors(&self) -> u32 {
        self.total_errors.load(Ordering::SeqCst)
    }
}
