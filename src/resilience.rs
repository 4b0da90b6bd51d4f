//! Per-key circuit breakers.
//!
//! Each tool gets its own breaker, created on first use. A breaker opens after
//! `failure_threshold` consecutive failures, rejects calls until
//! `open_duration` has elapsed, then lets calls through half-open until
//! `success_threshold` successes close it again (any half-open failure
//! reopens it).

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::ServerError;

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitBreakerConfig> for CircuitConfig {
    fn from(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            open_duration: Duration::from_millis(cfg.open_duration_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// How a guarded call counts toward its breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
    /// Says nothing about the health of the guarded operation.
    Neutral,
}

/// Observable breaker state, used in health reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub key: String,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
}

pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    config: CircuitConfig,
    failure_count: AtomicU32,
    success_count: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed),
            config,
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
        }
    }

    /// Ask for permission to call. Returns the remaining open time when the
    /// breaker is rejecting calls.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        if let CircuitState::Open { until } = *state {
            let now = Instant::now();
            if now >= until {
                *state = CircuitState::HalfOpen;
                self.success_count.store(0, Ordering::SeqCst);
            } else {
                return Err(until - now);
            }
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    *state = CircuitState::Open {
                        until: Instant::now() + self.config.open_duration,
                    };
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count.fetch_add(1, Ordering::SeqCst);
                *state = CircuitState::Open {
                    until: Instant::now() + self.config.open_duration,
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn status(&self) -> BreakerStatus {
        match *self.state.lock() {
            CircuitState::Closed => BreakerStatus::Closed,
            CircuitState::HalfOpen => BreakerStatus::HalfOpen,
            CircuitState::Open { until } if Instant::now() >= until => BreakerStatus::HalfOpen,
            CircuitState::Open { .. } => BreakerStatus::Open,
        }
    }
}

/// Breakers keyed by tool name, shared by every concurrent invocation.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(key) {
            return existing.clone();
        }
        self.breakers
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Run `operation` under the breaker for `key`.
    ///
    /// When the breaker is open the operation is not started and `fallback`
    /// receives the open error instead; its value is returned as a success.
    pub async fn with_breaker<T, F, Fut, FB>(
        &self,
        key: &str,
        operation: F,
        fallback: FB,
    ) -> Result<T, ServerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServerError>>,
        FB: FnOnce(ServerError) -> T,
    {
        self.with_breaker_scored(key, operation, fallback, |result| match result {
            Ok(_) => Verdict::Success,
            Err(_) => Verdict::Failure,
        })
        .await
    }

    /// Like [`with_breaker`](Self::with_breaker), but `score` decides how the
    /// result counts. A neutral result leaves the breaker untouched.
    pub async fn with_breaker_scored<T, F, Fut, FB, S>(
        &self,
        key: &str,
        operation: F,
        fallback: FB,
        score: S,
    ) -> Result<T, ServerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServerError>>,
        FB: FnOnce(ServerError) -> T,
        S: FnOnce(&Result<T, ServerError>) -> Verdict,
    {
        let breaker = self.breaker(key);
        if let Err(retry_after) = breaker.try_acquire() {
            tracing::debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, using fallback");
            return Ok(fallback(ServerError::CircuitOpen {
                key: key.to_string(),
                retry_after,
            }));
        }

        let result = operation().await;
        match score(&result) {
            Verdict::Success => breaker.record_success(),
            Verdict::Failure => breaker.record_failure(),
            Verdict::Neutral => {}
        }
        result
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .iter()
            .map(|(key, breaker)| BreakerSnapshot {
                key: key.clone(),
                status: breaker.status(),
                consecutive_failures: breaker.failure_count.load(Ordering::SeqCst),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.status() == BreakerStatus::Open)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
