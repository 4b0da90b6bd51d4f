//! Periodic health monitoring and composed health reports.
//!
//! [`HealthMonitor`] owns the timer task; what a tick does is supplied by the
//! lifecycle controller so that failures share its error budget.
//! [`HealthReporter`] builds the reports served by the probe endpoints and the
//! `health_check` tool.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheSummary;
use crate::context::{ServerContext, SessionStats};
use crate::lifecycle::state::{RuntimeHandle, RuntimeState, ServerState};
use crate::resilience::BreakerSnapshot;
use crate::tools::registry::{RegistryHealth, RegistryHealthStatus, UsageStatistics};

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    interval: Duration,
    enabled: AtomicBool,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            enabled: AtomicBool::new(true),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the timer task is currently running.
    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Start calling `tick` every interval. No-op when disabled or already
    /// running. The first tick fires one full interval after start.
    pub fn start<F, Fut>(&self, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.is_enabled() {
            return false;
        }
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            tracing::debug!("Health monitor stopped");
        });

        *slot = Some(MonitorTask { cancel, handle });
        tracing::info!(interval_ms = period.as_millis() as u64, "Health monitor started");
        true
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub version: String,
    pub state: ServerState,
    pub is_running: bool,
    pub uptime_seconds: Option<i64>,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSummary {
    pub enabled: bool,
    pub active: bool,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    pub runtime: RuntimeState,
    pub usage: UsageStatistics,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub server: ServerSummary,
    pub registry: RegistryHealth,
    pub cache: CacheSummary,
    pub sessions: SessionStats,
    pub monitoring: MonitoringSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub ready: bool,
    pub is_running: bool,
    pub registry_status: RegistryHealthStatus,
    pub consecutive_errors: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Liveness {
    pub alive: bool,
    pub state: ServerState,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HealthReporter {
    context: Arc<ServerContext>,
    state: RuntimeHandle,
    monitor: Arc<HealthMonitor>,
}

impl HealthReporter {
    pub fn new(context: Arc<ServerContext>, state: RuntimeHandle, monitor: Arc<HealthMonitor>) -> Self {
        Self {
            context,
            state,
            monitor,
        }
    }

    fn max_consecutive_errors(&self) -> u32 {
        self.context.config.error_handling.max_consecutive_errors
    }

    pub fn report(&self, detailed: bool) -> HealthReport {
        let runtime = self.state.snapshot();
        let registry = self.context.registry.get_health_status();
        let open_breakers = self.context.breakers.open_count();
        let status = compose_status(&runtime, registry.status, open_breakers);
        let config = &self.context.config;

        let details = detailed.then(|| HealthDetails {
            runtime: runtime.clone(),
            usage: self.context.registry.get_usage_statistics(),
            circuit_breakers: self.context.breakers.snapshots(),
            categories: self.context.registry.get_categories(),
            tags: self.context.registry.get_tags(),
        });

        HealthReport {
            status,
            timestamp: Utc::now(),
            server: ServerSummary {
                name: config.name.clone(),
                version: config.version.clone(),
                state: runtime.server_state,
                is_running: runtime.is_running,
                uptime_seconds: runtime.uptime_seconds(),
                consecutive_errors: runtime.consecutive_errors,
                max_consecutive_errors: self.max_consecutive_errors(),
                recovery_attempts: runtime.recovery_attempts,
            },
            registry,
            cache: self.context.cache.summary(),
            sessions: self.context.sessions.stats(),
            monitoring: MonitoringSummary {
                enabled: self.monitor.is_enabled(),
                active: self.monitor.is_active(),
                interval_ms: self.monitor.interval().as_millis() as u64,
            },
            details,
        }
    }

    pub fn readiness(&self) -> Readiness {
        let runtime = self.state.snapshot();
        let registry_status = self.context.registry.get_health_status().status;
        Readiness {
            ready: runtime.is_running
                && registry_status != RegistryHealthStatus::Error
                && runtime.consecutive_errors == 0,
            is_running: runtime.is_running,
            registry_status,
            consecutive_errors: runtime.consecutive_errors,
            timestamp: Utc::now(),
        }
    }

    pub fn liveness(&self) -> Liveness {
        let runtime = self.state.snapshot();
        let max = self.max_consecutive_errors();
        Liveness {
            alive: runtime.server_state != ServerState::Error && runtime.consecutive_errors < max,
            state: runtime.server_state,
            consecutive_errors: runtime.consecutive_errors,
            max_consecutive_errors: max,
            timestamp: Utc::now(),
        }
    }
}

/// `healthy` only when running cleanly; `warning` while running degraded.
fn compose_status(
    runtime: &RuntimeState,
    registry: RegistryHealthStatus,
    open_breakers: usize,
) -> HealthStatus {
    if runtime.server_state != ServerState::Running || registry == RegistryHealthStatus::Error {
        return HealthStatus::Error;
    }
    if registry == RegistryHealthStatus::Warning
        || runtime.consecutive_errors > 0
        || open_breakers > 0
    {
        return HealthStatus::Warning;
    }
    HealthStatus::Healthy
}
