//! Server configuration.
//!
//! `ServerConfig` is validated eagerly: every public constructor runs
//! [`ServerConfig::validate`], so an invalid configuration never reaches the
//! lifecycle controller.

use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

pub const MIN_STARTUP_TIMEOUT_MS: u64 = 5_000;
pub const MIN_SHUTDOWN_TIMEOUT_MS: u64 = 1_000;
pub const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;
pub const MIN_RETRY_DELAY_MS: u64 = 1_000;
pub const MIN_ERROR_RECOVERY_DELAY_MS: u64 = 1_000;

const CONFIG_ENV_VAR: &str = "MCP_SERVER_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "mcp-server.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Wire transport carrying protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio,
    Http {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_http_port")]
        port: u16,
        #[serde(default = "default_mcp_path")]
        path: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Stdio
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    pub startup_timeout: u64,
    pub shutdown_timeout: u64,
    pub health_check_interval: u64,
    pub max_retries: u32,
    pub retry_delay: u64,
    /// Pause between stopping and restarting during a recovery attempt.
    pub recovery_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout: 30_000,
            shutdown_timeout: 15_000,
            health_check_interval: 30_000,
            max_retries: 3,
            retry_delay: 5_000,
            recovery_grace_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorHandlingConfig {
    pub enable_recovery: bool,
    pub log_errors: bool,
    pub max_consecutive_errors: u32,
    pub error_recovery_delay: u64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            enable_recovery: true,
            log_errors: true,
            max_consecutive_errors: 5,
            error_recovery_delay: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub ready_path: String,
    pub live_path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: 3001,
            health_path: "/health".to_string(),
            ready_path: "/ready".to_string(),
            live_path: "/live".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 300_000,
            max_entries: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub transport: TransportConfig,
    /// Per-request timeout in milliseconds.
    pub timeout: u64,
    pub lifecycle: LifecycleConfig,
    pub error_handling: ErrorHandlingConfig,
    pub health_check: HealthCheckConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-testing-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "MCP server exposing testing tools with lifecycle management and health probes"
                .to_string(),
            transport: TransportConfig::default(),
            timeout: 30_000,
            lifecycle: LifecycleConfig::default(),
            error_handling: ErrorHandlingConfig::default(),
            health_check: HealthCheckConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate an already-built config and hand it back.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(config)
    }

    /// See [`load_server_config`].
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        load_server_config(explicit)
    }

    /// Parse and validate a JSON document. `${VAR}` references inside string
    /// values are expanded from the environment first.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut value: serde_json::Value = serde_json::from_str(raw)?;
        expand_value(&mut value);
        let config: ServerConfig = serde_json::from_value(value)?;
        Self::new(config)
    }

    /// Check every invariant and report all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if semver::Version::parse(&self.version).is_err() {
            errors.push(format!(
                "version '{}' is not a valid semantic version",
                self.version
            ));
        }
        if self.timeout == 0 {
            errors.push("timeout must be greater than 0".to_string());
        }

        let lc = &self.lifecycle;
        if lc.startup_timeout < MIN_STARTUP_TIMEOUT_MS {
            errors.push(format!(
                "lifecycle.startupTimeout must be >= {}ms",
                MIN_STARTUP_TIMEOUT_MS
            ));
        }
        if lc.shutdown_timeout < MIN_SHUTDOWN_TIMEOUT_MS {
            errors.push(format!(
                "lifecycle.shutdownTimeout must be >= {}ms",
                MIN_SHUTDOWN_TIMEOUT_MS
            ));
        }
        if lc.health_check_interval < MIN_HEALTH_CHECK_INTERVAL_MS {
            errors.push(format!(
                "lifecycle.healthCheckInterval must be >= {}ms",
                MIN_HEALTH_CHECK_INTERVAL_MS
            ));
        }
        if lc.retry_delay < MIN_RETRY_DELAY_MS {
            errors.push(format!(
                "lifecycle.retryDelay must be >= {}ms",
                MIN_RETRY_DELAY_MS
            ));
        }

        let eh = &self.error_handling;
        if eh.max_consecutive_errors < 1 {
            errors.push("errorHandling.maxConsecutiveErrors must be >= 1".to_string());
        }
        if eh.error_recovery_delay < MIN_ERROR_RECOVERY_DELAY_MS {
            errors.push(format!(
                "errorHandling.errorRecoveryDelay must be >= {}ms",
                MIN_ERROR_RECOVERY_DELAY_MS
            ));
        }

        let hc = &self.health_check;
        if hc.enabled && hc.port < 1024 {
            errors.push(format!(
                "healthCheck.port {} must be within [1024, 65535]",
                hc.port
            ));
        }
        for (field, path) in [
            ("healthPath", &hc.health_path),
            ("readyPath", &hc.ready_path),
            ("livePath", &hc.live_path),
        ] {
            if !path.starts_with('/') {
                errors.push(format!("healthCheck.{} must start with '/'", field));
            }
        }

        if let TransportConfig::Http { port, path, .. } = &self.transport {
            if *port < 1024 {
                errors.push(format!("transport.port {} must be within [1024, 65535]", port));
            }
            if !path.starts_with('/') {
                errors.push("transport.path must start with '/'".to_string());
            }
        }

        if self.circuit_breaker.failure_threshold < 1 {
            errors.push("circuitBreaker.failureThreshold must be >= 1".to_string());
        }
        if self.circuit_breaker.success_threshold < 1 {
            errors.push("circuitBreaker.successThreshold must be >= 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle.startup_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle.shutdown_timeout)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.lifecycle.health_check_interval)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.lifecycle.retry_delay)
    }

    pub fn recovery_grace(&self) -> Duration {
        Duration::from_millis(self.lifecycle.recovery_grace_ms)
    }

    pub fn error_recovery_delay(&self) -> Duration {
        Duration::from_millis(self.error_handling.error_recovery_delay)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    3942
}

fn default_mcp_path() -> String {
    "/mcp".to_string()
}

/// Locate the config file: explicit path, then `MCP_SERVER_CONFIG`, then
/// `./mcp-server.json` when present.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }

    if let Ok(p) = env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Load the server configuration from file (if any), apply environment
/// overrides, and validate the result.
pub fn load_server_config(explicit: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => {
            let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let mut value: serde_json::Value = serde_json::from_str(&raw)?;
            expand_value(&mut value);
            serde_json::from_value::<ServerConfig>(value)?
        }
        None => ServerConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    ServerConfig::new(config)
}

fn apply_env_overrides(config: &mut ServerConfig) -> Result<(), ConfigError> {
    if let Ok(name) = env::var("MCP_SERVER_NAME") {
        config.name = name;
    }
    if let Ok(port) = env::var("MCP_HEALTH_PORT") {
        config.health_check.port = port.parse().map_err(|_| {
            ConfigError::Invalid(vec![format!("MCP_HEALTH_PORT '{}' is not a port", port)])
        })?;
    }
    if let Ok(enabled) = env::var("MCP_HEALTH_ENABLED") {
        config.health_check.enabled = parse_bool("MCP_HEALTH_ENABLED", &enabled)?;
    }
    if let Ok(log_errors) = env::var("MCP_LOG_ERRORS") {
        config.error_handling.log_errors = parse_bool("MCP_LOG_ERRORS", &log_errors)?;
    }
    Ok(())
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(vec![format!(
            "{} '{}' is not a boolean",
            var, raw
        )])),
    }
}

fn expand_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = expand_env_vars(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(expand_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(expand_value),
        _ => {}
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}
