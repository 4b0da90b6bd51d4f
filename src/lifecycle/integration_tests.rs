#![cfg(test)]

//! End-to-end lifecycle scenarios against a scripted transport, on paused
//! tokio time.

use super::*;
use crate::config::ServerConfig;
use crate::tools::metadata::ToolMetadata;
use crate::tools::registry::{RegisterOptions, handler_fn};
use crate::tools::schema::ParamSchema;
use crate::tools::system::register_system_tools;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Default)]
struct ScriptedTransport {
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    /// Number of upcoming starts that fail.
    failing_starts: AtomicUsize,
    start_delay_ms: AtomicU64,
    stop_delay_ms: AtomicU64,
    health_failing: AtomicBool,
    running: AtomicBool,
    /// Controller inspected from inside `stop`, when set.
    observer: OnceLock<Weak<LifecycleController>>,
    listener_up_at_stop: AtomicBool,
    monitor_up_at_stop: AtomicBool,
}

impl ScriptedTransport {
    fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn start(&self) -> Result<(), ServerError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServerError::execution("induced start failure"));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(controller) = self.observer.get().and_then(Weak::upgrade) {
            let listener_up = controller.probe_addr().await.is_some();
            self.listener_up_at_stop.store(listener_up, Ordering::SeqCst);
            self.monitor_up_at_stop
                .store(controller.is_monitoring(), Ordering::SeqCst);
        }
        let delay = self.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ServerError> {
        if self.health_failing.load(Ordering::SeqCst) {
            Err(ServerError::execution("induced health check failure"))
        } else {
            Ok(())
        }
    }
}

fn setup_with(config: ServerConfig) -> (Arc<LifecycleController>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let context = Arc::new(ServerContext::new(config).unwrap());
    let controller = LifecycleController::new(context, transport.clone());
    (controller, transport)
}

fn setup() -> (Arc<LifecycleController>, Arc<ScriptedTransport>) {
    setup_with(ServerConfig::default())
}

fn induce_errors(controller: &Arc<LifecycleController>, n: u32) {
    for _ in 0..n {
        controller.handle_server_error(&ServerError::execution("induced failure"), "test");
    }
}

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_then_running() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Running);
    assert!(state.is_running);
    assert!(state.start_time.is_some());
    assert_eq!(state.consecutive_errors, 0);
    assert!(controller.is_monitoring());
    assert_eq!(transport.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning));
    assert_eq!(transport.starts(), 1);
    assert_eq!(controller.runtime_state().consecutive_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let (controller, transport) = setup();
    controller.stop().await.unwrap();
    assert_eq!(transport.stops(), 0);

    controller.start().await.unwrap();
    controller.stop().await.unwrap();
    controller.stop().await.unwrap();

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Stopped);
    assert!(!state.is_running);
    assert!(!controller.is_monitoring());
    assert_eq!(transport.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_after_stop() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    controller.stop().await.unwrap();
    controller.start().await.unwrap();
    assert_eq!(controller.server_state(), ServerState::Running);
    assert_eq!(transport.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout_cannot_be_resurrected() {
    let mut config = ServerConfig::default();
    config.error_handling.enable_recovery = false;
    let (controller, transport) = setup_with(config);
    transport.start_delay_ms.store(60_000, Ordering::SeqCst);

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, ServerError::Timeout { .. }));

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Error);
    assert!(!state.is_running);
    assert_eq!(state.consecutive_errors, 1);
    assert!(state.last_error.unwrap().error.contains("timed out"));

    // The abandoned start would have finished by now.
    settle(120).await;
    assert!(!transport.running.load(Ordering::SeqCst));
    assert!(!controller.runtime_state().is_running);
    assert!(!controller.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_forces_monitor_off() {
    let mut config = ServerConfig::default();
    config.error_handling.enable_recovery = false;
    let (controller, transport) = setup_with(config);
    controller.start().await.unwrap();
    transport.stop_delay_ms.store(60_000, Ordering::SeqCst);

    let err = controller.stop().await.unwrap_err();
    assert!(matches!(err, ServerError::Timeout { .. }));

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Error);
    assert!(!state.is_running);
    assert!(!controller.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_errors_below_budget_keep_running() {
    let (controller, _) = setup();
    controller.start().await.unwrap();
    induce_errors(&controller, 4);

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Running);
    assert_eq!(state.consecutive_errors, 4);
    assert!(!controller.is_recovering());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_succeeds_and_resets_counters() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    transport.fail_next_starts(2);

    induce_errors(&controller, 5);
    assert_eq!(controller.server_state(), ServerState::Error);
    assert!(controller.is_recovering());

    settle(300).await;

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Running);
    assert!(state.is_running);
    assert_eq!(state.consecutive_errors, 0);
    assert_eq!(state.recovery_attempts, 0);
    assert!(!controller.is_recovering());
    assert!(controller.is_monitoring());
    // initial start + two failed attempts + the successful one
    assert_eq!(transport.starts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_is_bounded_by_max_retries() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    transport.fail_next_starts(usize::MAX);

    induce_errors(&controller, 5);
    settle(300).await;

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Error);
    assert!(!state.is_running);
    assert_eq!(state.recovery_attempts, 3);
    assert!(!controller.is_recovering());
    assert_eq!(transport.starts(), 1 + 3);

    // Parked: further errors do not trigger a fourth attempt.
    induce_errors(&controller, 3);
    settle(300).await;
    assert_eq!(transport.starts(), 1 + 3);
    assert_eq!(controller.server_state(), ServerState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_errors_during_recovery_do_not_start_another() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    transport.fail_next_starts(1);

    induce_errors(&controller, 5);
    settle(2).await;
    assert_eq!(controller.server_state(), ServerState::Recovering);

    induce_errors(&controller, 10);
    assert_eq!(controller.server_state(), ServerState::Recovering);
    assert_eq!(controller.runtime_state().consecutive_errors, 15);

    settle(300).await;
    assert_eq!(controller.server_state(), ServerState::Running);
    // initial start + one failed attempt + one successful attempt
    assert_eq!(transport.starts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_disabled_parks_in_error() {
    let mut config = ServerConfig::default();
    config.error_handling.enable_recovery = false;
    let (controller, transport) = setup_with(config);
    controller.start().await.unwrap();

    induce_errors(&controller, 5);
    settle(300).await;

    assert_eq!(controller.server_state(), ServerState::Error);
    assert!(controller.runtime_state().is_running);
    assert_eq!(transport.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_health_checks_spend_the_error_budget() {
    let mut config = ServerConfig::default();
    config.error_handling.enable_recovery = false;
    let (controller, transport) = setup_with(config);
    controller.start().await.unwrap();
    transport.health_failing.store(true, Ordering::SeqCst);

    // Default interval is 30s; five ticks exhaust the default budget.
    settle(151).await;

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Error);
    assert!(state.consecutive_errors >= 5);
    assert_eq!(state.last_error.unwrap().operation, "health_check");
    assert!(!controller.reporter().liveness().alive);
}

#[tokio::test(start_paused = true)]
async fn test_reset_errors_returns_to_running() {
    let mut config = ServerConfig::default();
    config.error_handling.enable_recovery = false;
    let (controller, _) = setup_with(config);
    controller.start().await.unwrap();
    induce_errors(&controller, 5);
    assert_eq!(controller.server_state(), ServerState::Error);

    let state = controller.reset_errors();
    assert_eq!(state.server_state, ServerState::Running);
    assert_eq!(state.consecutive_errors, 0);
    assert!(state.last_error.is_none());
    assert!(controller.reporter().readiness().ready);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_health_monitoring() {
    let (controller, _) = setup();
    controller.start().await.unwrap();
    assert!(controller.is_monitoring());

    assert!(!controller.toggle_health_monitoring(Some(false)));
    assert!(!controller.is_monitoring());

    assert!(controller.toggle_health_monitoring(None));
    assert!(controller.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_restart_cycles_transport() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    controller.restart().await.unwrap();
    assert_eq!(transport.starts(), 2);
    assert_eq!(transport.stops(), 1);
    assert_eq!(controller.server_state(), ServerState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_system_tools_drive_the_controller() {
    let mut config = ServerConfig::default();
    config.error_handling.enable_recovery = false;
    let (controller, _) = setup_with(config);
    let context = controller.context().clone();
    register_system_tools(&context.registry, Arc::downgrade(&controller)).unwrap();
    context
        .registry
        .register_tool(
            ToolMetadata::new("echo", "Echo", "1.0.0", "util"),
            ParamSchema::any_object(),
            handler_fn(|params| async move { Ok::<_, ServerError>(params) }),
            RegisterOptions::default(),
        )
        .unwrap();
    controller.start().await.unwrap();

    let discovered = context
        .executor
        .execute("tool_discovery", json!({"category": "system", "isActive": true}))
        .await;
    let data = discovered.data().unwrap();
    assert_eq!(data["count"], 7);
    assert_eq!(data["tools"][0]["name"], "health_check");

    let deactivated = context
        .executor
        .execute("registry_activate_tool", json!({"toolName": "echo", "isActive": false}))
        .await;
    assert!(deactivated.is_success());
    assert!(!context.registry.get_tool("echo").unwrap().is_active);

    let missing = context
        .executor
        .execute("registry_activate_tool", json!({"toolName": "ghost", "isActive": true}))
        .await;
    assert_eq!(missing.error().unwrap().code, "TOOL_NOT_FOUND");

    let updated = context
        .executor
        .execute(
            "registry_update_metadata",
            json!({"toolName": "echo", "metadata": {"tags": ["new"]}}),
        )
        .await;
    assert!(updated.is_success());
    assert!(context.registry.get_tags().contains(&"new".to_string()));
    assert_eq!(context.registry.get_tool("echo").unwrap().metadata.category, "util");

    induce_errors(&controller, 5);
    let reset = context
        .executor
        .execute("server_lifecycle", json!({"action": "reset_errors"}))
        .await;
    assert_eq!(reset.data().unwrap()["runtime"]["serverState"], "running");

    let health = context
        .executor
        .execute("health_check", json!({"detailed": true}))
        .await;
    let report = health.data().unwrap();
    assert_eq!(report["server"]["state"], "running");
    assert!(report["details"]["usage"]["totalUsage"].as_u64().unwrap() >= 5);

    let info = context.executor.execute("server_info", json!({})).await;
    assert_eq!(info.data().unwrap()["transport"], "scripted");

    let bad = context
        .executor
        .execute("server_lifecycle", json!({"action": "explode"}))
        .await;
    assert_eq!(bad.error().unwrap().code, "VALIDATION_ERROR");
}

fn register_failing_tool(controller: &Arc<LifecycleController>, name: &str, err: ServerError) {
    controller
        .context()
        .registry
        .register_tool(
            ToolMetadata::new(name, "Always fails", "1.0.0", "util"),
            ParamSchema::any_object(),
            handler_fn(move |_| {
                let err = err.clone();
                async move { Err::<Value, _>(err) }
            }),
            RegisterOptions::default(),
        )
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_tool_calls_spend_the_budget_and_recover() {
    let (controller, transport) = setup();
    register_failing_tool(&controller, "flaky", ServerError::execution("backend unavailable"));
    controller.start().await.unwrap();

    let executor = &controller.context().executor;
    for _ in 0..5 {
        let outcome = executor.execute("flaky", json!({})).await;
        assert!(!outcome.is_success());
    }

    let state = controller.runtime_state();
    assert_eq!(state.consecutive_errors, 5);
    assert_eq!(state.server_state, ServerState::Error);
    assert_eq!(state.last_error.unwrap().operation, "tool:flaky");
    assert!(controller.is_recovering());

    settle(300).await;

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Running);
    assert_eq!(state.consecutive_errors, 0);
    assert!(!controller.is_recovering());
    assert_eq!(transport.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_caller_mistakes_leave_the_budget_alone() {
    let (controller, transport) = setup();
    register_failing_tool(
        &controller,
        "picky",
        ServerError::validation("unsupported option", vec![]),
    );
    controller.start().await.unwrap();

    let executor = &controller.context().executor;
    for _ in 0..10 {
        executor.execute("ghost", json!({})).await;
        executor.execute("picky", json!({})).await;
    }

    let state = controller.runtime_state();
    assert_eq!(state.consecutive_errors, 0);
    assert_eq!(state.server_state, ServerState::Running);
    assert!(!controller.is_recovering());
    settle(300).await;
    assert_eq!(transport.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tool_failures_while_stopped_are_not_counted() {
    let (controller, transport) = setup();
    register_failing_tool(&controller, "flaky", ServerError::execution("backend unavailable"));

    let executor = &controller.context().executor;
    for _ in 0..5 {
        executor.execute("flaky", json!({})).await;
    }

    settle(300).await;
    assert_eq!(controller.server_state(), ServerState::Stopped);
    assert_eq!(controller.runtime_state().consecutive_errors, 0);
    assert_eq!(transport.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_operator_stop_cancels_pending_recovery() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    induce_errors(&controller, 5);
    settle(1).await;
    assert_eq!(controller.server_state(), ServerState::Recovering);

    controller.stop().await.unwrap();
    settle(300).await;

    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Stopped);
    assert!(!state.is_running);
    assert!(!controller.is_recovering());
    assert_eq!(transport.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_operator_stop_during_recovery_grace_keeps_server_down() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    induce_errors(&controller, 5);

    // Past the recovery delay: the recovery task has stopped the transport
    // and is waiting out its grace period.
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert!(!controller.runtime_state().is_running);

    controller.stop().await.unwrap();
    settle(300).await;

    assert!(!controller.runtime_state().is_running);
    assert!(!controller.is_recovering());
    assert_eq!(transport.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_errors_cancels_pending_recovery() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    induce_errors(&controller, 5);
    settle(1).await;

    let state = controller.reset_errors();
    assert_eq!(state.server_state, ServerState::Running);
    settle(300).await;

    assert_eq!(controller.server_state(), ServerState::Running);
    assert!(!controller.is_recovering());
    assert_eq!(transport.starts(), 1);
    assert_eq!(transport.stops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_defers_to_a_start_in_flight() {
    let (controller, transport) = setup();
    controller.start().await.unwrap();
    induce_errors(&controller, 5);

    // The recovery task has stopped the transport and is in its grace period.
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    transport.start_delay_ms.store(5_000, Ordering::SeqCst);
    let operator = controller.clone();
    let pending = tokio::spawn(async move { operator.start().await });

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Starting);
    assert!(!state.is_running);
    assert_eq!(state.recovery_attempts, 1);
    assert!(!controller.is_recovering());

    pending.await.unwrap().unwrap();
    let state = controller.runtime_state();
    assert_eq!(state.server_state, ServerState::Running);
    assert!(state.is_running);
    assert_eq!(state.consecutive_errors, 0);
    assert_eq!(transport.starts(), 2);
}

fn free_port() -> u16 {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_health_endpoints_follow_the_controller() {
    let mut config = ServerConfig::default();
    config.health_check.enabled = true;
    config.health_check.host = "127.0.0.1".to_string();
    config.health_check.port = free_port();
    let (controller, transport) = setup_with(config);
    transport.observer.set(Arc::downgrade(&controller)).unwrap();

    assert!(controller.probe_addr().await.is_none());
    controller.start().await.unwrap();
    let addr = controller.probe_addr().await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /live HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));

    controller.stop().await.unwrap();
    assert_eq!(transport.stops(), 1);
    assert!(!transport.listener_up_at_stop.load(Ordering::SeqCst));
    assert!(!transport.monitor_up_at_stop.load(Ordering::SeqCst));
    assert!(controller.probe_addr().await.is_none());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
