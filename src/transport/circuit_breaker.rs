//! Circuit breaker guarding each remote endpoint
//!
//! When an endpoint keeps timing out or answering 5xx, further submissions
//! fail fast with [`TransportError::CircuitOpen`] and are rescheduled by the
//! registry's normal backoff instead of tying the worker up for a full
//! timeout per entry. Explicit rejections of a document say nothing about
//! endpoint health and leave the breaker alone.
//!
//! # States
//!
//! - **Closed**: requests pass through
//! - **Open**: endpoint considered down, requests fail fast
//! - **HalfOpen**: one probe is let through to see whether it recovered

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use super::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive endpoint failures before opening
    pub failure_threshold: u32,
    /// Time spent open before the first probe
    pub open_timeout: Duration,
    /// Each failed probe multiplies the open time by this factor
    pub backoff_multiplier: f64,
    pub max_open: Duration,
    /// Up to this fraction of the open time is added at random
    pub jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_open: Duration::from_secs(600),
            jitter_factor: 0.1,
        }
    }
}

impl CircuitBreakerConfig {
    fn open_duration(&self, reopenings: u32) -> Duration {
        let exponent = reopenings.min(16) as i32;
        let secs = (self.open_timeout.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_open.as_secs_f64());
        let jitter = if self.jitter_factor > 0.0 && secs > 0.0 {
            rand::thread_rng().gen_range(0.0..=secs * self.jitter_factor)
        } else {
            0.0
        };
        Duration::from_secs_f64(secs + jitter)
    }
}

#[derive(Debug, Default)]
struct Counters {
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
    times_opened: AtomicU64,
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { until: Instant, reopenings: u32 },
    HalfOpen { probing: bool, reopenings: u32 },
}

/// Breaker for one endpoint URL
#[derive(Debug)]
pub struct EndpointBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
    counters: Counters,
}

impl EndpointBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
            counters: Counters::default(),
        }
    }

    pub async fn state(&self) -> CircuitState {
        let mut phase = self.phase.lock().await;
        Self::expire_open(&mut phase);
        match *phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Send `request` through the breaker with a deadline.
    ///
    /// Timeouts and errors for which [`TransportError::counts_against_endpoint`]
    /// holds are endpoint failures; everything else counts as a healthy answer.
    pub async fn guard<T, F>(&self, timeout: Duration, request: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if !self.admit().await {
            self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::CircuitOpen(self.endpoint.clone()));
        }

        let result = tokio::time::timeout(timeout, request)
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)));

        match &result {
            Err(e) if e.counts_against_endpoint() => self.record_failure().await,
            _ => self.record_success().await,
        }
        result
    }

    async fn admit(&self) -> bool {
        let mut phase = self.phase.lock().await;
        Self::expire_open(&mut phase);
        match &mut *phase {
            Phase::Closed { .. } => true,
            Phase::Open { .. } => false,
            Phase::HalfOpen { probing, .. } => !std::mem::replace(probing, true),
        }
    }

    fn expire_open(phase: &mut Phase) {
        if let Phase::Open { until, reopenings } = *phase {
            if Instant::now() >= until {
                *phase = Phase::HalfOpen {
                    probing: false,
                    reopenings,
                };
            }
        }
    }

    async fn record_success(&self) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Closed { failures: 0 }) {
            if matches!(*phase, Phase::HalfOpen { .. }) {
                tracing::info!(endpoint = %self.endpoint, "Endpoint recovered, circuit closed");
            }
            *phase = Phase::Closed { failures: 0 };
        }
    }

    async fn record_failure(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let mut phase = self.phase.lock().await;
        let reopenings = match *phase {
            Phase::Closed { failures } if failures + 1 < self.config.failure_threshold => {
                *phase = Phase::Closed {
                    failures: failures + 1,
                };
                return;
            }
            Phase::Closed { .. } => 0,
            Phase::HalfOpen { reopenings, .. } => reopenings + 1,
            Phase::Open { .. } => return,
        };

        let open_for = self.config.open_duration(reopenings);
        *phase = Phase::Open {
            until: Instant::now() + open_for,
            reopenings,
        };
        self.counters.times_opened.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            endpoint = %self.endpoint,
            reopenings,
            open_for = ?open_for,
            "Endpoint failing, circuit opened"
        );
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state().await.to_string(),
            "successes": self.counters.successes.load(Ordering::Relaxed),
            "failures": self.counters.failures.load(Ordering::Relaxed),
            "short_circuited": self.counters.short_circuited.load(Ordering::Relaxed),
            "times_opened": self.counters.times_opened.load(Ordering::Relaxed),
        })
    }
}

/// One breaker per endpoint URL, created on first use
#[derive(Debug, Default)]
pub struct EndpointBreakers {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<EndpointBreaker>>>,
}

impl EndpointBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, endpoint: &str) -> Arc<EndpointBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(endpoint) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .await
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(EndpointBreaker::new(endpoint, self.config.clone())))
            .clone()
    }

    pub async fn status(&self) -> serde_json::Value {
        let breakers: Vec<_> = self
            .breakers
            .read()
            .await
            .iter()
            .map(|(endpoint, breaker)| (endpoint.clone(), breaker.clone()))
            .collect();

        let mut status = serde_json::Map::new();
        for (endpoint, breaker) in breakers {
            status.insert(endpoint, breaker.status().await);
        }
        serde_json::Value::Object(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            open_timeout: Duration::from_millis(20),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    fn unavailable() -> TransportError {
        TransportError::Http {
            status: 503,
            body: String::new(),
        }
    }

    async fn fail(breaker: &EndpointBreaker) -> TransportError {
        breaker
            .guard(Duration::from_secs(1), async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = EndpointBreaker::new("https://svc.test/submit", config(2));
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let err = breaker
            .guard(Duration::from_secs(1), async { Ok::<_, TransportError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CircuitOpen(ref e) if e == "https://svc.test/submit"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = EndpointBreaker::new("e", config(2));
        fail(&breaker).await;
        breaker
            .guard(Duration::from_secs(1), async { Ok::<_, TransportError>(()) })
            .await
            .unwrap();
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let breaker = EndpointBreaker::new("e", config(1));
        fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert!(breaker.admit().await);
        assert!(!breaker.admit().await);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let breaker = EndpointBreaker::new("e", config(1));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(config(1).open_duration(1) > config(1).open_duration(0));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = EndpointBreaker::new("e", config(1));
        let err = breaker
            .guard(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, TransportError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_client_side_errors_keep_circuit_closed() {
        let breaker = EndpointBreaker::new("e", config(1));
        let err = breaker
            .guard(Duration::from_secs(1), async {
                Err::<(), _>(TransportError::Identity("bad key".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Identity(_)));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breakers_are_shared_per_endpoint() {
        let breakers = EndpointBreakers::default();
        let a = breakers.get("https://a.test/submit").await;
        let b = breakers.get("https://a.test/submit").await;
        assert!(Arc::ptr_eq(&a, &b));

        let status = breakers.status().await;
        assert_eq!(status["https://a.test/submit"]["state"], "closed");
    }
}
