//! Error taxonomy and error categorization.
//!
//! Every failure the server sees, whether it comes from a tool handler, a
//! lifecycle operation, or a health check, is expressed as a [`ServerError`].
//! An [`ErrorCategorizer`] turns it into a [`CategorizedError`]: the payload
//! callers receive, carrying category, severity, suggestions and a
//! `retryable` flag.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised anywhere in the server.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// Invalid construction-time settings. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad tool metadata at registration, or bad caller parameters.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    /// A handler or a lifecycle operation failed.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Startup or shutdown exceeded its budget.
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The circuit breaker rejected the call.
    #[error("Circuit open for '{key}', retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { key: String, retry_after: Duration },

    /// Unknown tool name or registry entry.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// `start()` called while the server is already running.
    #[error("Server is already running")]
    AlreadyRunning,
}

impl ServerError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn validation(message: impl Into<String>, details: Vec<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details,
        }
    }

    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Tool",
            name: name.into(),
        }
    }

    /// Whether this error counts toward the server-level consecutive-error budget.
    ///
    /// Caller mistakes (bad parameters, unknown names) never do.
    pub fn counts_toward_budget(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::NotFound { .. })
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Execution(format!("{:#}", err))
    }
}

/// Broad classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Timeout,
    CircuitOpen,
    Configuration,
    Execution,
    Network,
    Permission,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured error payload returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub code: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// Collaborator that classifies errors for the execution wrapper and the
/// lifecycle controller.
pub trait ErrorCategorizer: Send + Sync {
    fn categorize(
        &self,
        error: &ServerError,
        tool_name: Option<&str>,
        operation: &str,
    ) -> CategorizedError;
}

/// Categorizer mapping the error taxonomy onto categories, with keyword
/// heuristics for free-form handler failures.
#[derive(Debug, Default, Clone)]
pub struct DefaultErrorCategorizer;

impl DefaultErrorCategorizer {
    pub fn new() -> Self {
        Self
    }

    fn classify_execution(message: &str) -> (ErrorCategory, ErrorSeverity, &'static str, bool) {
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            (ErrorCategory::Timeout, ErrorSeverity::Medium, "EXECUTION_TIMEOUT", true)
        } else if lower.contains("permission denied") || lower.contains("access denied") {
            (ErrorCategory::Permission, ErrorSeverity::High, "PERMISSION_DENIED", false)
        } else if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("unreachable")
        {
            (ErrorCategory::Network, ErrorSeverity::Medium, "NETWORK_ERROR", true)
        } else if lower.contains("not found") || lower.contains("no such file") {
            (ErrorCategory::NotFound, ErrorSeverity::Low, "RESOURCE_NOT_FOUND", false)
        } else {
            (ErrorCategory::Execution, ErrorSeverity::High, "EXECUTION_ERROR", true)
        }
    }

    fn suggestions_for(category: ErrorCategory) -> Vec<String> {
        let hints: &[&str] = match category {
            ErrorCategory::Validation => &[
                "Check the parameters against the tool's input schema",
                "Use tool_discovery to inspect the tool's examples",
            ],
            ErrorCategory::NotFound => &[
                "Verify the name is spelled correctly",
                "Use tool_discovery to list available tools",
            ],
            ErrorCategory::Timeout => &[
                "Retry the operation",
                "Reduce the size of the request if possible",
            ],
            ErrorCategory::CircuitOpen => &[
                "Wait for the circuit breaker to reset before retrying",
                "Check health_check for the tool's recent failures",
            ],
            ErrorCategory::Configuration => &[
                "Fix the server configuration and restart the server",
            ],
            ErrorCategory::Execution => &[
                "Retry the operation",
                "Check the server logs for details",
            ],
            ErrorCategory::Network => &[
                "Check network connectivity to dependent services",
                "Retry the operation after a short delay",
            ],
            ErrorCategory::Permission => &[
                "Check file and directory permissions",
            ],
            ErrorCategory::Internal => &[
                "Check the server logs for details",
            ],
        };
        hints.iter().map(|s| s.to_string()).collect()
    }
}

impl ErrorCategorizer for DefaultErrorCategorizer {
    fn categorize(
        &self,
        error: &ServerError,
        tool_name: Option<&str>,
        operation: &str,
    ) -> CategorizedError {
        let mut details = Vec::new();
        let (category, severity, code, retryable) = match error {
            ServerError::Configuration(_) => (
                ErrorCategory::Configuration,
                ErrorSeverity::Critical,
                "CONFIGURATION_ERROR",
                false,
            ),
            ServerError::Validation { details: d, .. } => {
                details = d.clone();
                (
                    ErrorCategory::Validation,
                    ErrorSeverity::Low,
                    "VALIDATION_ERROR",
                    false,
                )
            }
            ServerError::Execution(message) => Self::classify_execution(message),
            ServerError::Timeout { .. } => {
                (ErrorCategory::Timeout, ErrorSeverity::High, "TIMEOUT", true)
            }
            ServerError::CircuitOpen { .. } => (
                ErrorCategory::CircuitOpen,
                ErrorSeverity::Medium,
                "TOOL_TEMPORARILY_UNAVAILABLE",
                true,
            ),
            ServerError::NotFound { kind, .. } => (
                ErrorCategory::NotFound,
                ErrorSeverity::Low,
                if *kind == "Tool" {
                    "TOOL_NOT_FOUND"
                } else {
                    "NOT_FOUND"
                },
                false,
            ),
            ServerError::AlreadyRunning => (
                ErrorCategory::Internal,
                ErrorSeverity::Low,
                "ALREADY_RUNNING",
                false,
            ),
        };

        CategorizedError {
            category,
            severity,
            code: code.to_string(),
            message: error.to_string(),
            suggestions: Self::suggestions_for(category),
            retryable,
            tool_name: tool_name.map(str::to_string),
            operation: Some(operation.to_string()),
            details,
        }
    }
}
