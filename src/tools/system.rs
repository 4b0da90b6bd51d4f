//! Built-in system tools: health, server info, registry management and
//! lifecycle control.
//!
//! Handlers hold a `Weak` reference to the lifecycle controller; the
//! controller owns the registry that owns these handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crate::error::ServerError;
use crate::lifecycle::LifecycleController;
use crate::tools::metadata::{
    Complexity, MetadataPatch, PerformanceHints, ResourceUsage, ToolExample, ToolMetadata,
};
use crate::tools::registry::{
    DiscoveryFilter, RegisterOptions, RegistryError, ToolHandler, ToolInfo, ToolRegistry,
    handler_fn, typed_handler,
};
use crate::tools::schema::ParamSchema;

pub const SYSTEM_CATEGORY: &str = "system";

const SYSTEM_TOOL_VERSION: &str = "1.0.0";

pub struct SystemTool {
    pub metadata: ToolMetadata,
    pub schema: ParamSchema,
    pub handler: Arc<dyn ToolHandler>,
}

fn controller(lifecycle: &Weak<LifecycleController>) -> Result<Arc<LifecycleController>, ServerError> {
    lifecycle
        .upgrade()
        .ok_or_else(|| ServerError::execution("Server is shutting down"))
}

fn metadata(name: &str, description: &str, tags: &[&str], example_input: Value) -> ToolMetadata {
    ToolMetadata::new(name, description, SYSTEM_TOOL_VERSION, SYSTEM_CATEGORY)
        .with_tags(tags.iter().copied())
        .with_documentation(description)
        .with_example(ToolExample {
            title: format!("Call {}", name),
            description: description.to_string(),
            input: example_input,
            output: None,
        })
        .with_performance(PerformanceHints {
            expected_response_time: Some(50),
            complexity: Some(Complexity::Low),
            resource_usage: Some(ResourceUsage::Light),
        })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthCheckParams {
    #[serde(default)]
    detailed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateParams {
    tool_name: String,
    is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMetadataParams {
    tool_name: String,
    metadata: MetadataPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Restart,
    ResetErrors,
    ToggleHealthMonitoring,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LifecycleParams {
    action: LifecycleAction,
    #[serde(default)]
    enabled: Option<bool>,
}

/// Compact view returned by `tool_discovery`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub category: String,
    pub version: String,
    pub tags: BTreeSet<String>,
    pub is_active: bool,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub complexity: Option<Complexity>,
    pub has_examples: bool,
}

impl From<ToolInfo> for ToolSummary {
    fn from(info: ToolInfo) -> Self {
        let complexity = info.metadata.complexity();
        Self {
            has_examples: !info.metadata.examples.is_empty(),
            name: info.metadata.name,
            description: info.metadata.description,
            category: info.metadata.category,
            version: info.metadata.version,
            tags: info.metadata.tags,
            is_active: info.is_active,
            usage_count: info.usage_count,
            last_used: info.last_used,
            complexity,
        }
    }
}

fn health_check(lifecycle: Weak<LifecycleController>) -> Result<SystemTool, RegistryError> {
    Ok(SystemTool {
        metadata: metadata(
            "health_check",
            "Report server, registry, cache and session health",
            &["health", "monitoring"],
            json!({ "detailed": true }),
        ),
        schema: ParamSchema::new(json!({
            "type": "object",
            "properties": {
                "detailed": {
                    "type": "boolean",
                    "description": "Include runtime state, usage statistics and circuit breakers"
                }
            },
            "additionalProperties": false
        }))?,
        handler: typed_handler(move |params: HealthCheckParams| {
            let lifecycle = lifecycle.clone();
            async move { Ok(controller(&lifecycle)?.reporter().report(params.detailed)) }
        }),
    })
}

fn server_info(lifecycle: Weak<LifecycleController>) -> SystemTool {
    SystemTool {
        metadata: metadata(
            "server_info",
            "Describe the server: version, transport, state and configuration",
            &["server", "info"],
            json!({}),
        ),
        schema: ParamSchema::no_params(),
        handler: handler_fn(move |_| {
            let lifecycle = lifecycle.clone();
            async move {
                let controller = controller(&lifecycle)?;
                let ctx = controller.context();
                let config = &ctx.config;
                let runtime = controller.runtime_state();
                let stats = ctx.registry.get_usage_statistics();
                Ok(json!({
                    "name": config.name,
                    "version": config.version,
                    "description": config.description,
                    "transport": controller.transport_kind(),
                    "state": runtime.server_state,
                    "isRunning": runtime.is_running,
                    "startTime": runtime.start_time,
                    "uptimeSeconds": runtime.uptime_seconds(),
                    "capabilities": ["tools"],
                    "tools": {
                        "total": stats.total_tools,
                        "active": stats.active_tools,
                        "categories": ctx.registry.get_categories(),
                    },
                    "sessions": ctx.sessions.stats(),
                    "config": {
                        "timeoutMs": config.timeout,
                        "lifecycle": config.lifecycle,
                        "errorHandling": config.error_handling,
                        "healthCheck": config.health_check,
                        "cache": config.cache,
                    },
                }))
            }
        }),
    }
}

fn tool_discovery(lifecycle: Weak<LifecycleController>) -> Result<SystemTool, RegistryError> {
    Ok(SystemTool {
        metadata: metadata(
            "tool_discovery",
            "Find registered tools by category, name, tags, activity, examples or complexity",
            &["registry", "discovery"],
            json!({ "category": "system", "isActive": true }),
        ),
        schema: ParamSchema::new(json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "name": { "type": "string", "description": "Case-insensitive substring" },
                "isActive": { "type": "boolean" },
                "hasExamples": { "type": "boolean" },
                "complexity": { "type": "string", "enum": ["low", "medium", "high"] },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "additionalProperties": false
        }))?,
        handler: typed_handler(move |filter: DiscoveryFilter| {
            let lifecycle = lifecycle.clone();
            async move {
                let controller = controller(&lifecycle)?;
                let tools: Vec<ToolSummary> = controller
                    .context()
                    .registry
                    .discover_tools(&filter)
                    .into_iter()
                    .map(ToolSummary::from)
                    .collect();
                Ok(json!({
                    "count": tools.len(),
                    "filter": filter,
                    "tools": tools,
                }))
            }
        }),
    })
}

fn registry_status(lifecycle: Weak<LifecycleController>) -> SystemTool {
    SystemTool {
        metadata: metadata(
            "registry_status",
            "Registry health, usage statistics and known categories and tags",
            &["registry", "statistics"],
            json!({}),
        ),
        schema: ParamSchema::no_params(),
        handler: handler_fn(move |_| {
            let lifecycle = lifecycle.clone();
            async move {
                let controller = controller(&lifecycle)?;
                let registry = &controller.context().registry;
                Ok(json!({
                    "health": registry.get_health_status(),
                    "statistics": registry.get_usage_statistics(),
                    "categories": registry.get_categories(),
                    "tags": registry.get_tags(),
                }))
            }
        }),
    }
}

fn registry_activate_tool(lifecycle: Weak<LifecycleController>) -> Result<SystemTool, RegistryError> {
    Ok(SystemTool {
        metadata: metadata(
            "registry_activate_tool",
            "Activate or deactivate a registered tool",
            &["registry", "management"],
            json!({ "toolName": "echo", "isActive": false }),
        ),
        schema: ParamSchema::new(json!({
            "type": "object",
            "properties": {
                "toolName": { "type": "string", "minLength": 1 },
                "isActive": { "type": "boolean" }
            },
            "required": ["toolName", "isActive"],
            "additionalProperties": false
        }))?,
        handler: typed_handler(move |params: ActivateParams| {
            let lifecycle = lifecycle.clone();
            async move {
                let controller = controller(&lifecycle)?;
                let ctx = controller.context();
                ctx.registry.set_tool_active(&params.tool_name, params.is_active)?;
                ctx.cache.invalidate_tool(&params.tool_name);
                Ok(json!({
                    "toolName": params.tool_name,
                    "isActive": params.is_active,
                }))
            }
        }),
    })
}

fn registry_update_metadata(lifecycle: Weak<LifecycleController>) -> Result<SystemTool, RegistryError> {
    Ok(SystemTool {
        metadata: metadata(
            "registry_update_metadata",
            "Partially update a tool's metadata; omitted fields are kept",
            &["registry", "management"],
            json!({ "toolName": "echo", "metadata": { "tags": ["text"] } }),
        ),
        schema: ParamSchema::new(json!({
            "type": "object",
            "properties": {
                "toolName": { "type": "string", "minLength": 1 },
                "metadata": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "version": { "type": "string" },
                        "category": { "type": "string" },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "author": { "type": "string" },
                        "documentation": { "type": "string" },
                        "examples": { "type": "array" },
                        "dependencies": { "type": "array", "items": { "type": "string" } },
                        "performance": { "type": "object" }
                    },
                    "additionalProperties": false
                }
            },
            "required": ["toolName", "metadata"],
            "additionalProperties": false
        }))?,
        handler: typed_handler(move |params: UpdateMetadataParams| {
            let lifecycle = lifecycle.clone();
            async move {
                let controller = controller(&lifecycle)?;
                let ctx = controller.context();
                let updated = ctx
                    .registry
                    .update_tool_metadata(&params.tool_name, params.metadata)?;
                ctx.cache.invalidate_tool(&params.tool_name);
                Ok(json!({
                    "toolName": params.tool_name,
                    "tool": ToolSummary::from(updated),
                }))
            }
        }),
    })
}

fn server_lifecycle(lifecycle: Weak<LifecycleController>) -> Result<SystemTool, RegistryError> {
    Ok(SystemTool {
        metadata: metadata(
            "server_lifecycle",
            "Restart the server, reset error counters or toggle health monitoring",
            &["server", "lifecycle", "management"],
            json!({ "action": "reset_errors" }),
        ),
        schema: ParamSchema::new(json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["restart", "reset_errors", "toggle_health_monitoring"]
                },
                "enabled": {
                    "type": "boolean",
                    "description": "Target state for toggle_health_monitoring; omitted flips it"
                }
            },
            "required": ["action"],
            "additionalProperties": false
        }))?,
        handler: typed_handler(move |params: LifecycleParams| {
            let lifecycle = lifecycle.clone();
            async move {
                let controller = controller(&lifecycle)?;
                match params.action {
                    LifecycleAction::Restart => {
                        // The reply travels over the transport being restarted,
                        // so the restart runs after this call returns.
                        let target = controller.clone();
                        tokio::spawn(async move {
                            if let Err(e) = target.restart().await {
                                tracing::error!("Requested restart failed: {}", e);
                            }
                        });
                        Ok(json!({
                            "action": params.action,
                            "scheduled": true,
                            "state": controller.server_state(),
                        }))
                    }
                    LifecycleAction::ResetErrors => Ok(json!({
                        "action": params.action,
                        "runtime": controller.reset_errors(),
                    })),
                    LifecycleAction::ToggleHealthMonitoring => Ok(json!({
                        "action": params.action,
                        "enabled": controller.toggle_health_monitoring(params.enabled),
                        "active": controller.is_monitoring(),
                    })),
                }
            }
        }),
    })
}

/// Build the built-in tools, bound to `lifecycle`.
pub fn system_tools(lifecycle: Weak<LifecycleController>) -> Result<Vec<SystemTool>, RegistryError> {
    Ok(vec![
        health_check(lifecycle.clone())?,
        server_info(lifecycle.clone()),
        tool_discovery(lifecycle.clone())?,
        registry_status(lifecycle.clone()),
        registry_activate_tool(lifecycle.clone())?,
        registry_update_metadata(lifecycle.clone())?,
        server_lifecycle(lifecycle)?,
    ])
}

/// Metadata of the built-in tools, without binding them to a server.
pub fn catalog() -> Result<Vec<ToolMetadata>, RegistryError> {
    Ok(system_tools(Weak::new())?
        .into_iter()
        .map(|t| t.metadata)
        .collect())
}

pub fn register_system_tools(
    registry: &ToolRegistry,
    lifecycle: Weak<LifecycleController>,
) -> Result<(), RegistryError> {
    for tool in system_tools(lifecycle)? {
        registry.register_tool(tool.metadata, tool.schema, tool.handler, RegisterOptions::default())?;
    }
    Ok(())
}
