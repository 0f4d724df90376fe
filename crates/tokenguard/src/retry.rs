//! Retry with exponential backoff and jitter
//!
//! [`RetryStrategy`] wraps one fallible async operation, primarily the HTTP
//! key-material fetch. Each attempt, each delay and the whole execution are
//! recorded in the [`PerformanceMonitor`]; delays abort on cancellation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::KeyLoadError;
use crate::monitor::{MeasurementType, PerformanceMonitor};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub multiplier: f64,
    /// Jitter factor (0.0 - 1.0) to avoid thundering herd
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// A single attempt, never retried
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `retry`-th failure (0-based), jittered and capped
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        let jitter = 1.0 + (fastrand::f64() - 0.5) * 2.0 * self.jitter_factor;
        let jittered_ms = delay_ms * jitter;

        let capped_ms = jittered_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Errors a [`RetryStrategy`] can classify and synthesize on shutdown.
pub trait RetryableError: fmt::Display {
    /// Whether another attempt may succeed
    fn is_retryable(&self) -> bool;

    /// Error returned when the operation is cancelled between attempts
    fn cancelled() -> Self;
}

impl RetryableError for KeyLoadError {
    fn is_retryable(&self) -> bool {
        KeyLoadError::is_retryable(self)
    }

    fn cancelled() -> Self {
        KeyLoadError::Cancelled
    }
}

/// Attempt outcome counters
#[derive(Debug, Default)]
pub struct RetryStats {
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

impl RetryStats {
    /// Attempts that returned `Ok`
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Attempts that returned `Err`
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Attempts made after a failure
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Executes operations under a [`RetryConfig`].
#[derive(Debug)]
pub struct RetryStrategy {
    config: RetryConfig,
    monitor: Arc<PerformanceMonitor>,
    stats: RetryStats,
}

impl RetryStrategy {
    /// Retry under `config`, recording into `monitor`
    pub fn new(config: RetryConfig, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            config,
            monitor,
            stats: RetryStats::default(),
        }
    }

    /// Single attempt strategy
    pub fn none(monitor: Arc<PerformanceMonitor>) -> Self {
        Self::new(RetryConfig::none(), monitor)
    }

    /// Backoff parameters
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Outcome counters
    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        let result = loop {
            if cancel.is_cancelled() {
                break Err(E::cancelled());
            }

            let attempt_started = Instant::now();
            let outcome = op(attempt).await;
            self.monitor
                .record_since(MeasurementType::RetryAttempt, attempt_started);

            let error = match outcome {
                Ok(value) => {
                    self.stats.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    break Ok(value);
                }
                Err(error) => error,
            };

            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            if !error.is_retryable() || attempt >= max_attempts {
                warn!(operation, attempt, error = %error, "Operation failed, not retrying");
                break Err(error);
            }

            let planned = self.config.calculate_delay(attempt - 1);
            debug!(
                operation,
                attempt,
                delay_ms = planned.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );

            let delay_started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => break Err(E::cancelled()),
                _ = tokio::time::sleep(planned) => {}
            }
            self.monitor.record(
                MeasurementType::RetryDelay,
                delay_started.elapsed().abs_diff(planned),
            );

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            attempt += 1;
        };

        self.monitor
            .record_since(MeasurementType::RetryComplete, started);
        result
    }
}
