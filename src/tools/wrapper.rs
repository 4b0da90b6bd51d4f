//! Execution wrapper around every tool call.
//!
//! `ExecutionWrapper::execute` never fails: parameter validation, circuit
//! breaking, handler errors, panics and timeouts are all folded into a
//! [`ToolOutcome`]. Usage is recorded on the registry for every outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::error::{CategorizedError, ErrorCategorizer, ErrorSeverity, ServerError};
use crate::resilience::{CircuitBreakerRegistry, Verdict};
use crate::tools::registry::{ResolvedTool, ToolHandler, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMeta {
    pub tool: String,
    pub invocation_id: Uuid,
    pub duration_ms: u64,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

/// Result envelope of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { data: Value, meta: CallMeta },
    Error { error: CategorizedError, meta: CallMeta },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&CategorizedError> {
        match self {
            Self::Success { .. } => None,
            Self::Error { error, .. } => Some(error),
        }
    }

    pub fn meta(&self) -> &CallMeta {
        match self {
            Self::Success { meta, .. } | Self::Error { meta, .. } => meta,
        }
    }
}

/// Receives tool-call failures that count toward the server's error budget.
pub trait FailureSink: Send + Sync {
    fn record_failure(self: Arc<Self>, err: &ServerError, operation: &str);
}

/// How a guarded call ended, as seen by the breaker.
enum Attempt {
    Completed(Value),
    /// Caller mistake surfaced by the handler; not a breaker failure.
    CallerError(ServerError),
    Rejected(ServerError),
}

pub struct ExecutionWrapper {
    registry: Arc<ToolRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    categorizer: Arc<dyn ErrorCategorizer>,
    cache: Arc<ResultCache>,
    request_timeout: Duration,
    log_errors: bool,
    failure_sink: RwLock<Option<Weak<dyn FailureSink>>>,
}

impl ExecutionWrapper {
    pub fn new(
        registry: Arc<ToolRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        categorizer: Arc<dyn ErrorCategorizer>,
        cache: Arc<ResultCache>,
        request_timeout: Duration,
        log_errors: bool,
    ) -> Self {
        Self {
            registry,
            breakers,
            categorizer,
            cache,
            request_timeout,
            log_errors,
            failure_sink: RwLock::new(None),
        }
    }

    /// Route budget-relevant failures to `sink` from now on.
    pub fn set_failure_sink(&self, sink: Weak<dyn FailureSink>) {
        *self.failure_sink.write() = Some(sink);
    }

    fn report_failure(&self, name: &str, err: &ServerError) {
        let sink = self.failure_sink.read().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.record_failure(err, &format!("tool:{}", name));
        }
    }

    /// Invoke a tool by name. Always yields an outcome.
    pub async fn execute(&self, name: &str, params: Value) -> ToolOutcome {
        let started = Instant::now();
        let invocation_id = Uuid::new_v4();
        debug!(tool = %name, %invocation_id, "Tool call started");

        let result = match self.registry.resolve(name) {
            None => Err(ServerError::tool_not_found(name)),
            Some(tool) if !tool.is_active => Err(ServerError::validation(
                format!("Tool '{}' is inactive", name),
                vec!["Activate it with registry_activate_tool".to_string()],
            )),
            Some(tool) => self.run(tool, params).await,
        };

        self.registry.record_tool_usage(name);

        let meta = |cached: bool| CallMeta {
            tool: name.to_string(),
            invocation_id,
            duration_ms: started.elapsed().as_millis() as u64,
            cached,
            timestamp: Utc::now(),
        };

        match result {
            Ok((data, cached)) => ToolOutcome::Success {
                data,
                meta: meta(cached),
            },
            Err(err) => {
                let categorized = self.categorizer.categorize(&err, Some(name), "execute");
                self.log_failure(name, &categorized);
                if err.counts_toward_budget() {
                    self.report_failure(name, &err);
                }
                ToolOutcome::Error {
                    error: categorized,
                    meta: meta(false),
                }
            }
        }
    }

    async fn run(&self, tool: ResolvedTool, params: Value) -> Result<(Value, bool), ServerError> {
        if let Err(details) = tool.schema.validate(&params) {
            return Err(ServerError::validation(
                format!("Invalid parameters for tool '{}'", tool.name),
                details,
            ));
        }

        let cache_key = tool
            .cacheable
            .then(|| ResultCache::key_for(&tool.name, &params));
        if let Some(hit) = cache_key.as_deref().and_then(|k| self.cache.get(k)) {
            return Ok((hit, true));
        }

        let handler = tool.handler.clone();
        let timeout = self.request_timeout;
        let name = tool.name.clone();
        let attempt = self
            .breakers
            .with_breaker_scored(
                &tool.name,
                || async move {
                    match run_isolated(handler, params, timeout, &name).await {
                        Ok(value) => Ok(Attempt::Completed(value)),
                        Err(err) if !err.counts_toward_budget() => Ok(Attempt::CallerError(err)),
                        Err(err) => Err(err),
                    }
                },
                Attempt::Rejected,
                |result| match result {
                    Ok(Attempt::CallerError(_)) => Verdict::Neutral,
                    Ok(_) => Verdict::Success,
                    Err(_) => Verdict::Failure,
                },
            )
            .await?;

        match attempt {
            Attempt::Completed(value) => {
                if let Some(key) = cache_key {
                    self.cache.insert(key, value.clone());
                }
                Ok((value, false))
            }
            Attempt::CallerError(err) | Attempt::Rejected(err) => Err(err),
        }
    }

    fn log_failure(&self, name: &str, err: &CategorizedError) {
        if !self.log_errors {
            return;
        }
        match err.severity {
            ErrorSeverity::High | ErrorSeverity::Critical => error!(
                tool = %name,
                code = %err.code,
                category = ?err.category,
                retryable = err.retryable,
                "Tool call failed: {}",
                err.message
            ),
            _ => warn!(
                tool = %name,
                code = %err.code,
                category = ?err.category,
                "Tool call rejected: {}",
                err.message
            ),
        }
    }
}

/// Run the handler on its own task so a panic or a hung future cannot take
/// the caller down with it.
async fn run_isolated(
    handler: Arc<dyn ToolHandler>,
    params: Value,
    timeout: Duration,
    name: &str,
) -> Result<Value, ServerError> {
    let mut task = tokio::spawn(async move { handler.call(params).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => Err(ServerError::execution(format!(
            "Tool '{}' panicked during execution",
            name
        ))),
        Ok(Err(join_err)) => Err(ServerError::execution(format!(
            "Tool '{}' was cancelled: {}",
            name, join_err
        ))),
        Err(_) => {
            task.abort();
            Err(ServerError::Timeout {
                operation: format!("Tool '{}'", name),
                timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::{DefaultErrorCategorizer, ErrorCategory};
    use crate::resilience::CircuitConfig;
    use crate::tools::metadata::ToolMetadata;
    use crate::tools::registry::{RegisterOptions, handler_fn};
    use crate::tools::schema::ParamSchema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wrapper_with(registry: Arc<ToolRegistry>, failure_threshold: u32) -> ExecutionWrapper {
        ExecutionWrapper::new(
            registry,
            Arc::new(CircuitBreakerRegistry::new(CircuitConfig {
                failure_threshold,
                success_threshold: 1,
                open_duration: Duration::from_secs(60),
            })),
            Arc::new(DefaultErrorCategorizer::new()),
            Arc::new(ResultCache::new(&CacheConfig::default())),
            Duration::from_secs(5),
            true,
        )
    }

    fn message_schema() -> ParamSchema {
        ParamSchema::new(json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
            "required": ["message"]
        }))
        .unwrap()
    }

    fn register(
        registry: &ToolRegistry,
        name: &str,
        handler: Arc<dyn ToolHandler>,
        options: RegisterOptions,
    ) {
        registry
            .register_tool(
                ToolMetadata::new(name, "test tool", "1.0.0", "util"),
                message_schema(),
                handler,
                options,
            )
            .unwrap();
    }

    fn counting_handler(calls: Arc<AtomicUsize>) -> Arc<dyn ToolHandler> {
        handler_fn(move |params| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ServerError>(json!({ "echo": params["message"] }))
            }
        })
    }

    #[tokio::test]
    async fn test_success_records_usage() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        register(&registry, "echo", counting_handler(calls.clone()), RegisterOptions::default());
        let wrapper = wrapper_with(registry.clone(), 5);

        let outcome = wrapper.execute("echo", json!({"message": "hi"})).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.data().unwrap(), &json!({"echo": "hi"}));
        assert_eq!(outcome.meta().tool, "echo");
        assert_eq!(registry.get_tool("echo").unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_params_skip_handler_but_count_usage() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        register(&registry, "echo", counting_handler(calls.clone()), RegisterOptions::default());
        let wrapper = wrapper_with(registry.clone(), 5);

        let outcome = wrapper.execute("echo", json!({"msg": "typo"})).await;
        let err = outcome.error().unwrap();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(!err.details.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.get_tool("echo").unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let wrapper = wrapper_with(Arc::new(ToolRegistry::new()), 5);
        let outcome = wrapper.execute("nope", json!({})).await;
        assert_eq!(outcome.error().unwrap().code, "TOOL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_inactive_tool_is_rejected() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        register(&registry, "echo", counting_handler(calls.clone()), RegisterOptions::default());
        registry.set_tool_active("echo", false).unwrap();
        let wrapper = wrapper_with(registry, 5);

        let outcome = wrapper.execute("echo", json!({"message": "hi"})).await;
        assert!(outcome.error().unwrap().message.contains("inactive"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_categorized() {
        let registry = Arc::new(ToolRegistry::new());
        register(
            &registry,
            "flaky",
            handler_fn(|_| async { Err(ServerError::execution("connection reset by peer")) }),
            RegisterOptions::default(),
        );
        let wrapper = wrapper_with(registry.clone(), 5);

        let outcome = wrapper.execute("flaky", json!({"message": "x"})).await;
        let err = outcome.error().unwrap();
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.retryable);
        assert_eq!(registry.get_tool("flaky").unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let registry = Arc::new(ToolRegistry::new());
        register(
            &registry,
            "boom",
            handler_fn(|_| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<_, ServerError>(Value::Null)
            }),
            RegisterOptions::default(),
        );
        let wrapper = wrapper_with(registry, 5);

        let outcome = wrapper.execute("boom", json!({"message": "x"})).await;
        assert!(outcome.error().unwrap().message.contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let registry = Arc::new(ToolRegistry::new());
        register(
            &registry,
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, ServerError>(Value::Null)
            }),
            RegisterOptions::default(),
        );
        let wrapper = wrapper_with(registry, 5);

        let outcome = wrapper.execute("slow", json!({"message": "x"})).await;
        assert_eq!(outcome.error().unwrap().category, ErrorCategory::Timeout);
    }

    #[tokio::test]
    async fn test_open_breaker_uses_fallback_without_calling_handler() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        register(
            &registry,
            "failing",
            handler_fn(move |_| {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(ServerError::execution("boom"))
                }
            }),
            RegisterOptions::default(),
        );
        let wrapper = wrapper_with(registry.clone(), 2);

        for _ in 0..2 {
            wrapper.execute("failing", json!({"message": "x"})).await;
        }
        let outcome = wrapper.execute("failing", json!({"message": "x"})).await;

        let err = outcome.error().unwrap();
        assert_eq!(err.category, ErrorCategory::CircuitOpen);
        assert_eq!(err.code, "TOOL_TEMPORARILY_UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get_tool("failing").unwrap().usage_count, 3);
    }

    #[tokio::test]
    async fn test_cacheable_tool_served_from_cache() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        register(
            &registry,
            "cached",
            counting_handler(calls.clone()),
            RegisterOptions {
                cacheable: true,
                ..Default::default()
            },
        );
        let wrapper = wrapper_with(registry, 5);

        let first = wrapper.execute("cached", json!({"message": "a"})).await;
        let second = wrapper.execute("cached", json!({"message": "a"})).await;
        let other = wrapper.execute("cached", json!({"message": "b"})).await;

        assert!(!first.meta().cached);
        assert!(second.meta().cached);
        assert!(!other.meta().cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_outcome_envelope_is_tagged() {
        let outcome = ToolOutcome::Success {
            data: json!(1),
            meta: CallMeta {
                tool: "t".into(),
                invocation_id: Uuid::nil(),
                duration_ms: 0,
                cached: false,
                timestamp: Utc::now(),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"], 1);
        assert_eq!(json["meta"]["invocationId"], Uuid::nil().to_string());
    }

    fn mode_handler(calls: Arc<AtomicUsize>) -> Arc<dyn ToolHandler> {
        handler_fn(move |params| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match params["message"].as_str() {
                    Some("fail") => Err(ServerError::execution("backend exploded")),
                    Some("bad") => Err(ServerError::validation("unsupported message", vec![])),
                    _ => Ok(json!("ok")),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_caller_error_from_handler_does_not_reset_breaker() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        register(&registry, "moody", mode_handler(calls.clone()), RegisterOptions::default());
        let wrapper = wrapper_with(registry, 2);

        wrapper.execute("moody", json!({"message": "fail"})).await;
        let rejected = wrapper.execute("moody", json!({"message": "bad"})).await;
        assert_eq!(rejected.error().unwrap().category, ErrorCategory::Validation);
        wrapper.execute("moody", json!({"message": "fail"})).await;

        let outcome = wrapper.execute("moody", json!({"message": "ok"})).await;
        assert_eq!(outcome.error().unwrap().code, "TOOL_TEMPORARILY_UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[derive(Default)]
    struct RecordingSink {
        failures: parking_lot::Mutex<Vec<String>>,
    }

    impl FailureSink for RecordingSink {
        fn record_failure(self: Arc<Self>, err: &ServerError, operation: &str) {
            self.failures.lock().push(format!("{}: {}", operation, err));
        }
    }

    #[tokio::test]
    async fn test_only_server_side_failures_reach_the_sink() {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        register(&registry, "moody", mode_handler(calls), RegisterOptions::default());
        let wrapper = wrapper_with(registry, 5);
        let sink = Arc::new(RecordingSink::default());
        let weak = Arc::downgrade(&sink);
        wrapper.set_failure_sink(weak);

        wrapper.execute("moody", json!({"message": "ok"})).await;
        wrapper.execute("moody", json!({"message": "bad"})).await;
        wrapper.execute("moody", json!({"msg": "typo"})).await;
        wrapper.execute("ghost", json!({})).await;
        wrapper.execute("moody", json!({"message": "fail"})).await;

        let failures = sink.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("tool:moody"));
        assert!(failures[0].contains("backend exploded"));
    }

    #[tokio::test]
    async fn test_dropped_sink_is_ignored() {
        let registry = Arc::new(ToolRegistry::new());
        register(
            &registry,
            "moody",
            mode_handler(Arc::new(AtomicUsize::new(0))),
            RegisterOptions::default(),
        );
        let wrapper = wrapper_with(registry, 5);
        let sink = Arc::new(RecordingSink::default());
        let weak = Arc::downgrade(&sink);
        wrapper.set_failure_sink(weak);
        drop(sink);

        let outcome = wrapper.execute("moody", json!({"message": "fail"})).await;
        assert!(!outcome.is_success());
    }
}
