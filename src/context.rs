//! Per-process server context.
//!
//! Built once at startup and passed by reference to everything that needs
//! the registry, the result cache or the error collaborators.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::cache::ResultCache;
use crate::config::{ConfigError, ServerConfig};
use crate::error::{DefaultErrorCategorizer, ErrorCategorizer};
use crate::resilience::{CircuitBreakerRegistry, CircuitConfig};
use crate::tools::registry::ToolRegistry;
use crate::tools::wrapper::ExecutionWrapper;

/// Counts live protocol sessions.
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: AtomicUsize,
    total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active: usize,
    pub total: u64,
}

impl SessionTracker {
    /// Register a session; it ends when the returned guard is dropped.
    pub fn open(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        let id = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(session = id, "Session opened");
        SessionGuard {
            tracker: self.clone(),
            id,
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.active.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(session = self.id, "Session closed");
    }
}

pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ToolRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub categorizer: Arc<dyn ErrorCategorizer>,
    pub cache: Arc<ResultCache>,
    pub sessions: Arc<SessionTracker>,
    pub executor: ExecutionWrapper,
}

impl ServerContext {
    /// Build the context. Fails when `config` does not validate.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        Self::with_categorizer(config, Arc::new(DefaultErrorCategorizer::new()))
    }

    pub fn with_categorizer(
        config: ServerConfig,
        categorizer: Arc<dyn ErrorCategorizer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(ToolRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitConfig::from(
            &config.circuit_breaker,
        )));
        let cache = Arc::new(ResultCache::new(&config.cache));
        let executor = ExecutionWrapper::new(
            registry.clone(),
            breakers.clone(),
            categorizer.clone(),
            cache.clone(),
            config.request_timeout(),
            config.error_handling.log_errors,
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            breakers,
            categorizer,
            cache,
            sessions: Arc::new(SessionTracker::default()),
            executor,
        })
    }
}
