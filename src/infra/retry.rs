//! Retry utilities
//!
//! Two flavours:
//! - [`BackoffPolicy`]: persisted, scheduled retries of registry submissions.
//!   The next attempt is a deadline stored on the entry (`next_retry_at`)
//!   and picked up by a later worker tick, so restarts lose nothing.
//! - [`Retry`]: in-process retries with jitter for short transient failures
//!   (database connectivity at startup).

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::{RegistryError, Result};

// ============================================================================
// Scheduled submission backoff
// ============================================================================

/// Largest retry delay accepted from configuration
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 24 * 3600);

/// Capped exponential backoff for failed submissions
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Caps exponential growth
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Failures after which an entry stops being retried automatically
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let initial = env_parse::<u64>("REGISTRY_RETRY_INITIAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.initial_delay);
        let max = env_parse::<u64>("REGISTRY_RETRY_MAX_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_delay);
        let multiplier = env_parse::<f64>("REGISTRY_RETRY_MULTIPLIER")?.unwrap_or(defaults.multiplier);
        let max_attempts = env_parse::<u32>("REGISTRY_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts);

        if multiplier < 1.0 {
            return Err(RegistryError::Configuration(
                "REGISTRY_RETRY_MULTIPLIER must be >= 1.0".to_string(),
            ));
        }

        let initial = initial.min(MAX_RETRY_DELAY);
        Ok(Self {
            initial_delay: initial,
            max_delay: max.clamp(initial, MAX_RETRY_DELAY),
            multiplier,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Delay before retrying after the `failures`-th consecutive failure (1-based)
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(base.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }

    /// Whether an entry with `retry_count` failures needs manual intervention
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }

    /// Deadline for the next attempt, `None` once retries are exhausted
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> Option<DateTime<Utc>> {
        if self.is_exhausted(retry_count) {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay_for_attempt(retry_count))
            .unwrap_or_else(|_| saturating_seconds(self.max_delay));
        Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

fn saturating_seconds(delay: Duration) -> chrono::Duration {
    let secs = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RegistryError::Configuration(format!("invalid {var}: {e}"))),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// In-process retry
// ============================================================================

/// Configuration for in-process retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt)
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0); the delay varies by up to this fraction either way
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::database()
    }
}

impl RetryConfig {
    /// Create a config for database operations
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter > 0.0 {
            let jitter_range = capped_delay * self.jitter;
            let mut rng = rand::thread_rng();
            let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter_offset).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: std::result::Result<T, E>,
    /// Number of attempts made (1 = succeeded on first try)
    pub attempts: u32,
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> std::result::Result<T, E> {
        self.result
    }
}

/// A retry executor that can run operations with retry logic
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run an operation, retrying while `should_retry` accepts the error
    pub async fn run_with_context<F, Fut, T, E, P>(
        &self,
        context: &str,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(context, attempts, "Operation succeeded after retries");
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => {
                    if attempts > self.config.max_retries || !should_retry(&e) {
                        tracing::warn!(
                            context,
                            attempts,
                            error = %e,
                            "Operation failed, giving up"
                        );
                        return RetryResult {
                            result: Err(e),
                            attempts,
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempts - 1);
                    tracing::warn!(
                        context,
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Check if a database error is transient
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // serialization failure, deadlock, connection exceptions, operator intervention
            code == "40001" || code == "40P01" || code.starts_with("08") || code.starts_with("57")
        }
        _ => false,
    }
}
