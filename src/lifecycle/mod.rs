//! Server lifecycle state machine.
//!
//! `stopped → starting → running → stopping → stopped`, with `error` and
//! `recovering` reached through [`LifecycleController::handle_server_error`].
//! Start and stop race the transport against their configured timeouts; the
//! losing future is dropped, so a late transport result can never change the
//! decision.

pub mod state;

#[cfg(test)]
mod integration_tests;

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ProbeListener;
use crate::context::ServerContext;
use crate::error::{ErrorSeverity, ServerError};
use crate::health::{HealthMonitor, HealthReporter};
use crate::tools::registry::RegistryHealthStatus;
use crate::tools::wrapper::FailureSink;

pub use state::{LastError, RuntimeHandle, RuntimeState, ServerState};

/// The wire transport carrying protocol messages.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Resolves once the transport is accepting requests.
    async fn start(&self) -> Result<(), ServerError>;

    /// Resolves once the transport has shut down.
    async fn stop(&self) -> Result<(), ServerError>;

    /// Liveness check run by the health monitor.
    async fn health_check(&self) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Race `operation` against `timeout`. The loser is dropped.
async fn race_timeout<F>(operation: &str, timeout: Duration, fut: F) -> Result<(), ServerError>
where
    F: Future<Output = Result<(), ServerError>>,
{
    tokio::select! {
        result = fut => result,
        _ = tokio::time::sleep(timeout) => Err(ServerError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

pub struct LifecycleController {
    context: Arc<ServerContext>,
    transport: Arc<dyn Transport>,
    state: RuntimeHandle,
    monitor: Arc<HealthMonitor>,
    reporter: HealthReporter,
    probe: AsyncMutex<Option<ProbeListener>>,
    recovering: AtomicBool,
    /// Cancelled by operator actions that supersede a running recovery.
    recovery_abort: parking_lot::Mutex<CancellationToken>,
}

impl LifecycleController {
    pub fn new(context: Arc<ServerContext>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let state = RuntimeHandle::new();
        let monitor = Arc::new(HealthMonitor::new(context.config.health_check_interval()));
        let reporter = HealthReporter::new(context.clone(), state.clone(), monitor.clone());
        let controller = Arc::new(Self {
            context,
            transport,
            state,
            monitor,
            reporter,
            probe: AsyncMutex::new(None),
            recovering: AtomicBool::new(false),
            recovery_abort: parking_lot::Mutex::new(CancellationToken::new()),
        });
        let sink = Arc::downgrade(&controller);
        controller.context.executor.set_failure_sink(sink);
        controller
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn reporter(&self) -> &HealthReporter {
        &self.reporter
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    pub fn runtime_state(&self) -> RuntimeState {
        self.state.snapshot()
    }

    pub fn server_state(&self) -> ServerState {
        self.state.state()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Address the probe listener is bound to, when it is running.
    pub async fn probe_addr(&self) -> Option<std::net::SocketAddr> {
        self.probe.lock().await.as_ref().map(ProbeListener::local_addr)
    }

    /// Start the transport. Rejects when the server is already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        self.state.update(|s| {
            if s.is_running || matches!(s.server_state, ServerState::Starting | ServerState::Stopping) {
                return Err(ServerError::AlreadyRunning);
            }
            s.server_state = ServerState::Starting;
            Ok(())
        })?;
        info!(transport = self.transport.kind(), "Starting server");

        let timeout = self.context.config.startup_timeout();
        match race_timeout("Server startup", timeout, self.transport.start()).await {
            Ok(()) => {
                self.state.update(|s| {
                    s.server_state = ServerState::Running;
                    s.is_running = true;
                    s.start_time = Some(Utc::now());
                    s.consecutive_errors = 0;
                });
                self.start_monitoring();
                self.start_probe().await;
                info!(
                    name = %self.context.config.name,
                    version = %self.context.config.version,
                    tools = self.context.registry.len(),
                    "Server started"
                );
                Ok(())
            }
            Err(err) => {
                if matches!(err, ServerError::Timeout { .. }) {
                    self.abandon_transport().await;
                }
                self.state.update(|s| {
                    s.server_state = ServerState::Error;
                    s.is_running = false;
                });
                self.handle_server_error(&err, "start");
                Err(err)
            }
        }
    }

    /// Stop the server. A no-op when already stopped.
    ///
    /// Supersedes any recovery in progress: a stopped server stays stopped.
    pub async fn stop(self: &Arc<Self>) -> Result<(), ServerError> {
        self.abort_recovery();
        self.shutdown().await
    }

    async fn shutdown(self: &Arc<Self>) -> Result<(), ServerError> {
        let proceed = self.state.update(|s| match s.server_state {
            ServerState::Stopped | ServerState::Stopping => Ok(false),
            ServerState::Starting => Err(ServerError::execution(
                "Cannot stop the server while it is starting",
            )),
            _ => {
                s.server_state = ServerState::Stopping;
                Ok(true)
            }
        })?;
        if !proceed {
            debug!("Stop requested but server is not running");
            return Ok(());
        }
        info!("Stopping server");

        // No probe traffic may observe a half-torn-down transport.
        self.monitor.stop();
        self.stop_probe().await;

        let timeout = self.context.config.shutdown_timeout();
        let result = race_timeout("Server shutdown", timeout, self.transport.stop()).await;
        match result {
            Ok(()) => {
                self.state.update(|s| {
                    s.server_state = ServerState::Stopped;
                    s.is_running = false;
                    s.start_time = None;
                });
                info!("Server stopped");
                Ok(())
            }
            Err(err) => {
                self.monitor.stop();
                self.state.update(|s| {
                    s.server_state = ServerState::Error;
                    s.is_running = false;
                });
                self.handle_server_error(&err, "stop");
                Err(err)
            }
        }
    }

    pub async fn restart(self: &Arc<Self>) -> Result<(), ServerError> {
        info!("Restarting server");
        self.stop().await?;
        self.start().await
    }

    /// Shared error path for lifecycle, health-check and transport failures.
    ///
    /// Never awaits: recovery, when triggered, runs on its own task.
    pub fn handle_server_error(self: &Arc<Self>, err: &ServerError, operation: &str) {
        let config = &self.context.config;
        let max_errors = config.error_handling.max_consecutive_errors;
        let max_retries = config.lifecycle.max_retries;

        let (consecutive, attempts, threshold_reached) = self.state.update(|s| {
            s.consecutive_errors = s.consecutive_errors.saturating_add(1);
            s.last_error = Some(LastError {
                error: err.to_string(),
                operation: operation.to_string(),
                timestamp: Utc::now(),
            });
            let reached = s.consecutive_errors >= max_errors;
            if reached && s.server_state != ServerState::Recovering {
                s.server_state = ServerState::Error;
            }
            (s.consecutive_errors, s.recovery_attempts, reached)
        });

        if config.error_handling.log_errors {
            let categorized = self.context.categorizer.categorize(err, None, operation);
            match categorized.severity {
                ErrorSeverity::Critical | ErrorSeverity::High => error!(
                    operation,
                    code = %categorized.code,
                    consecutive_errors = consecutive,
                    "Server error: {}",
                    err
                ),
                _ => warn!(
                    operation,
                    code = %categorized.code,
                    consecutive_errors = consecutive,
                    "Server error: {}",
                    err
                ),
            }
        }

        if !threshold_reached || !config.error_handling.enable_recovery {
            return;
        }
        if attempts >= max_retries {
            if !self.is_recovering() {
                error!(
                    attempts,
                    "Recovery attempts exhausted; server remains in error state"
                );
            }
            return;
        }
        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let abort = CancellationToken::new();
            *self.recovery_abort.lock() = abort.clone();
            let this = self.clone();
            tokio::spawn(async move { this.run_recovery(abort).await });
        } else {
            debug!(consecutive_errors = consecutive, "Recovery already in progress");
        }
    }

    /// Bounded stop-then-restart loop. Only one runs at a time.
    ///
    /// Gives up as soon as `abort` is cancelled by an operator stop or error
    /// reset.
    async fn run_recovery(self: Arc<Self>, abort: CancellationToken) {
        let config = self.context.config.clone();
        let max_retries = config.lifecycle.max_retries;

        loop {
            let attempt = self.state.update(|s| {
                let awaiting =
                    matches!(s.server_state, ServerState::Error | ServerState::Recovering);
                if !awaiting || s.recovery_attempts >= max_retries {
                    return None;
                }
                s.recovery_attempts += 1;
                s.server_state = ServerState::Recovering;
                Some(s.recovery_attempts)
            });
            let Some(attempt) = attempt else {
                break;
            };
            info!(attempt, max_retries, "Attempting server recovery");

            if !pause(&abort, config.error_recovery_delay()).await
                || self.server_state() != ServerState::Recovering
            {
                info!(attempt, "Recovery superseded before restart");
                break;
            }

            if self.state.snapshot().is_running {
                if let Err(err) = self.shutdown().await {
                    warn!(attempt, "Stop during recovery failed: {}", err);
                }
                self.state.update(|s| {
                    if s.server_state == ServerState::Stopped {
                        s.server_state = ServerState::Recovering;
                    }
                });
            }
            if !pause(&abort, config.recovery_grace()).await {
                info!(attempt, "Recovery superseded before restart");
                break;
            }

            match self.start().await {
                Ok(()) => {
                    self.mark_recovered();
                    info!(attempt, "Server recovered");
                    break;
                }
                Err(ServerError::AlreadyRunning) if self.state.snapshot().is_running => {
                    self.mark_recovered();
                    info!(attempt, "Server already running; recovery complete");
                    break;
                }
                Err(ServerError::AlreadyRunning) => {
                    info!(attempt, "Another start is in flight; leaving recovery to it");
                    break;
                }
                Err(err) => {
                    self.state.update(|s| s.server_state = ServerState::Error);
                    if attempt >= max_retries {
                        error!(
                            attempt,
                            "Recovery failed and attempts are exhausted; manual intervention required: {}",
                            err
                        );
                        break;
                    }
                    warn!(attempt, "Recovery attempt failed: {}", err);
                    if !pause(&abort, config.retry_delay()).await {
                        info!(attempt, "Recovery superseded between attempts");
                        break;
                    }
                }
            }
        }

        self.recovering.store(false, Ordering::SeqCst);
    }

    fn mark_recovered(&self) {
        self.state.update(|s| {
            s.server_state = ServerState::Running;
            s.consecutive_errors = 0;
            s.recovery_attempts = 0;
        });
    }

    fn abort_recovery(&self) {
        if self.is_recovering() {
            info!("Cancelling automatic recovery");
        }
        self.recovery_abort.lock().cancel();
    }

    /// Clear the error budget. Returns the resulting state.
    ///
    /// Cancels any recovery in progress.
    pub fn reset_errors(&self) -> RuntimeState {
        self.abort_recovery();
        let snapshot = self.state.update(|s| {
            s.consecutive_errors = 0;
            s.recovery_attempts = 0;
            s.last_error = None;
            if matches!(s.server_state, ServerState::Error | ServerState::Recovering) {
                s.server_state = if s.is_running {
                    ServerState::Running
                } else {
                    ServerState::Error
                };
            }
            s.clone()
        });
        info!(state = %snapshot.server_state, "Error counters reset");
        snapshot
    }

    /// Turn periodic health monitoring on or off. `None` flips the setting.
    pub fn toggle_health_monitoring(self: &Arc<Self>, enabled: Option<bool>) -> bool {
        let enabled = enabled.unwrap_or(!self.monitor.is_enabled());
        self.monitor.set_enabled(enabled);
        if !enabled {
            self.monitor.stop();
        } else if self.state.snapshot().is_running {
            self.start_monitoring();
        }
        info!(enabled, "Health monitoring toggled");
        enabled
    }

    fn start_monitoring(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.monitor.start(move || {
            let weak = weak.clone();
            async move {
                if let Some(controller) = weak.upgrade() {
                    controller.health_tick().await;
                }
            }
        });
    }

    async fn health_tick(self: Arc<Self>) {
        let snapshot = self.state.snapshot();
        let registry = self.context.registry.get_health_status();
        let sessions = self.context.sessions.stats();
        debug!(
            state = %snapshot.server_state,
            registry = ?registry.status,
            active_sessions = sessions.active,
            "Health check"
        );

        if registry.status != RegistryHealthStatus::Healthy {
            warn!(issues = ?registry.issues, "Registry reported issues");
        }

        let result = if !snapshot.is_running {
            Err(ServerError::execution("Health check: server is not running"))
        } else {
            race_timeout(
                "Health check",
                self.context.config.request_timeout(),
                self.transport.health_check(),
            )
            .await
        };
        if let Err(err) = result {
            self.handle_server_error(&err, "health_check");
        }
    }

    async fn start_probe(self: &Arc<Self>) {
        let config = &self.context.config.health_check;
        if !config.enabled {
            return;
        }
        let mut slot = self.probe.lock().await;
        if slot.is_some() {
            return;
        }
        match ProbeListener::bind(self.reporter.clone(), config).await {
            Ok(listener) => *slot = Some(listener),
            Err(err) => {
                drop(slot);
                self.handle_server_error(
                    &ServerError::execution(format!("Failed to start probe listener: {}", err)),
                    "probe",
                );
            }
        }
    }

    async fn stop_probe(&self) {
        let listener = self.probe.lock().await.take();
        if let Some(listener) = listener {
            listener.shutdown(self.context.config.shutdown_timeout()).await;
        }
    }

    /// Best-effort cleanup after a start that timed out.
    async fn abandon_transport(&self) {
        let timeout = self.context.config.shutdown_timeout();
        if let Err(err) = race_timeout("Transport cleanup", timeout, self.transport.stop()).await {
            debug!("Cleanup after failed start: {}", err);
        }
    }
}

impl FailureSink for LifecycleController {
    /// Tool-call failures only count while the server is serving.
    fn record_failure(self: Arc<Self>, err: &ServerError, operation: &str) {
        if self.state.snapshot().is_running {
            self.handle_server_error(err, operation);
        }
    }
}

/// Sleep for `duration`. Returns `false` when `abort` fired first.
async fn pause(abort: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = abort.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
