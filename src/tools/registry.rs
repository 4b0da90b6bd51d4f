//! Tool registry: catalog, discovery, validation state and usage statistics.
//!
//! Provides the `ToolHandler` capability implemented by every tool and the
//! `ToolRegistry` that owns registered tools keyed by name. The registry is
//! shared by every concurrent invocation: usage recording only takes a read
//! lock and bumps atomics, so concurrent completions never lose updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use thiserror::Error;

use crate::error::ServerError;
use crate::tools::metadata::{
    Complexity, MetadataPatch, ToolMetadata, ValidationReport, validate_metadata,
};
use crate::tools::schema::{ParamSchema, SchemaError};

/// A tool's business logic: accept validated parameters, produce a result or fail.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value, ServerError>;
}

/// Adapter turning an async closure over raw JSON into a `ToolHandler`.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ServerError>> + Send,
{
    async fn call(&self, params: Value) -> Result<Value, ServerError> {
        (self.f)(params).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ServerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Adapter deserializing the (already schema-validated) parameters into `P`
/// before calling the closure.
pub struct TypedHandler<P, F> {
    f: F,
    _params: PhantomData<fn(P)>,
}

#[async_trait]
impl<P, F, Fut, R> ToolHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, ServerError>> + Send,
    R: Serialize,
{
    async fn call(&self, params: Value) -> Result<Value, ServerError> {
        let typed: P = serde_json::from_value(params).map_err(|e| {
            ServerError::validation("Parameters do not match the expected shape", vec![e.to_string()])
        })?;
        let result = (self.f)(typed).await?;
        serde_json::to_value(result)
            .map_err(|e| ServerError::execution(format!("Failed to serialize tool result: {}", e)))
    }
}

pub fn typed_handler<P, F, Fut, R>(f: F) -> Arc<dyn ToolHandler>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ServerError>> + Send + 'static,
    R: Serialize + 'static,
{
    Arc::new(TypedHandler {
        f,
        _params: PhantomData,
    })
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Tool '{name}' failed validation: {}", .errors.join("; "))]
    ValidationFailed { name: String, errors: Vec<String> },
    #[error("Tool '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl From<RegistryError> for ServerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => ServerError::tool_not_found(name),
            RegistryError::ValidationFailed { ref errors, .. } => {
                ServerError::validation(err.to_string(), errors.clone())
            }
            RegistryError::AlreadyRegistered(_) | RegistryError::Schema(_) => {
                ServerError::validation(err.to_string(), vec![])
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterOptions {
    pub replace_existing: bool,
    pub validate_on_registration: bool,
    pub auto_activate: bool,
    /// Cache successful results keyed by parameters.
    pub cacheable: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            replace_existing: false,
            validate_on_registration: true,
            auto_activate: true,
            cacheable: false,
        }
    }
}

impl RegisterOptions {
    pub fn replacing() -> Self {
        Self {
            replace_existing: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct UsageCounter {
    count: AtomicU64,
    /// Microseconds since the epoch; 0 when never used.
    last_used_micros: AtomicI64,
}

impl UsageCounter {
    fn record(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now().timestamp_micros().max(1);
        self.last_used_micros.fetch_max(now, Ordering::SeqCst);
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    fn last_used(&self) -> Option<DateTime<Utc>> {
        match self.last_used_micros.load(Ordering::SeqCst) {
            0 => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }
}

struct RegisteredTool {
    metadata: ToolMetadata,
    schema: Arc<ParamSchema>,
    handler: Arc<dyn ToolHandler>,
    registered_at: DateTime<Utc>,
    sequence: u64,
    is_active: bool,
    cacheable: bool,
    validation: Option<ValidationReport>,
    usage: UsageCounter,
}

impl RegisteredTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            metadata: self.metadata.clone(),
            input_schema: self.schema.as_json_object().clone(),
            registered_at: self.registered_at,
            last_used: self.usage.last_used(),
            usage_count: self.usage.count(),
            is_active: self.is_active,
            validation_results: self.validation.clone(),
        }
    }

    fn matches(&self, filter: &DiscoveryFilter) -> bool {
        if let Some(category) = &filter.category {
            if &self.metadata.category != category {
                return false;
            }
        }
        if let Some(name) = &filter.name {
            if !self
                .metadata
                .name
                .to_lowercase()
                .contains(&name.to_lowercase())
            {
                return false;
            }
        }
        if let Some(is_active) = filter.is_active {
            if self.is_active != is_active {
                return false;
            }
        }
        if let Some(has_examples) = filter.has_examples {
            if self.metadata.examples.is_empty() == has_examples {
                return false;
            }
        }
        if let Some(complexity) = filter.complexity {
            if self.metadata.complexity() != Some(complexity) {
                return false;
            }
        }
        if let Some(tags) = &filter.tags {
            if !tags.iter().all(|t| self.metadata.tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

/// Read-only view of a registered tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    #[serde(flatten)]
    pub metadata: ToolMetadata,
    pub input_schema: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub is_active: bool,
    pub validation_results: Option<ValidationReport>,
}

/// What the execution wrapper needs to run a tool.
#[derive(Clone)]
pub struct ResolvedTool {
    pub name: String,
    pub handler: Arc<dyn ToolHandler>,
    pub schema: Arc<ParamSchema>,
    pub is_active: bool,
    pub cacheable: bool,
}

/// Conjunctive discovery filter; absent fields match everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub has_examples: Option<bool>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsage {
    pub name: String,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatistics {
    pub total_tools: usize,
    pub active_tools: usize,
    pub total_usage: u64,
    pub most_used_tool: Option<ToolUsage>,
    pub least_used_tool: Option<ToolUsage>,
    pub category_counts: BTreeMap<String, usize>,
    pub tag_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryHealthStatus {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHealth {
    pub status: RegistryHealthStatus,
    pub total_tools: usize,
    pub active_tools: usize,
    pub inactive_tools: usize,
    pub invalid_tools: usize,
    pub issues: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    tools: HashMap<String, RegisteredTool>,
    /// Accumulate-only: never pruned when tools are removed.
    categories: BTreeSet<String>,
    /// Accumulate-only: never pruned when tools are removed.
    tags: BTreeSet<String>,
}

impl RegistryInner {
    fn absorb_facets(&mut self, metadata: &ToolMetadata) {
        self.categories.insert(metadata.category.clone());
        self.tags.extend(metadata.tags.iter().cloned());
    }

    /// Tools in registration order.
    fn ordered(&self) -> Vec<&RegisteredTool> {
        let mut tools: Vec<&RegisteredTool> = self.tools.values().collect();
        tools.sort_by_key(|t| t.sequence);
        tools
    }
}

/// Registry for managing tools.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
    next_sequence: AtomicU64,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate metadata and schema without registering anything.
    ///
    /// The schema has already been compiled by the time it reaches here, so
    /// only metadata rules can fail.
    pub fn validate_tool(&self, metadata: &ToolMetadata, _schema: &ParamSchema) -> ValidationReport {
        validate_metadata(metadata)
    }

    /// Register a tool.
    pub fn register_tool(
        &self,
        metadata: ToolMetadata,
        schema: ParamSchema,
        handler: Arc<dyn ToolHandler>,
        options: RegisterOptions,
    ) -> Result<ValidationReport, RegistryError> {
        let report = self.validate_tool(&metadata, &schema);
        if options.validate_on_registration && !report.is_valid {
            return Err(RegistryError::ValidationFailed {
                name: metadata.name.clone(),
                errors: report.errors.clone(),
            });
        }

        let mut inner = self.inner.write();
        if inner.tools.contains_key(&metadata.name) && !options.replace_existing {
            return Err(RegistryError::AlreadyRegistered(metadata.name));
        }

        inner.absorb_facets(&metadata);
        let name = metadata.name.clone();
        let tool = RegisteredTool {
            metadata,
            schema: Arc::new(schema),
            handler,
            registered_at: Utc::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            is_active: options.auto_activate,
            cacheable: options.cacheable,
            validation: Some(report.clone()),
            usage: UsageCounter::default(),
        };
        let replaced = inner.tools.insert(name.clone(), tool).is_some();
        drop(inner);

        tracing::info!(
            tool = %name,
            replaced,
            active = options.auto_activate,
            warnings = report.warnings.len(),
            "Tool registered"
        );
        Ok(report)
    }

    pub fn unregister_tool(&self, name: &str) -> Result<(), RegistryError> {
        match self.inner.write().tools.remove(name) {
            Some(_) => {
                tracing::info!(tool = %name, "Tool unregistered");
                Ok(())
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Find tools matching every present filter field, sorted by name.
    pub fn discover_tools(&self, filter: &DiscoveryFilter) -> Vec<ToolInfo> {
        let inner = self.inner.read();
        let mut found: Vec<ToolInfo> = inner
            .tools
            .values()
            .filter(|t| t.matches(filter))
            .map(RegisteredTool::info)
            .collect();
        found.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        found
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolInfo> {
        self.inner.read().tools.get(name).map(RegisteredTool::info)
    }

    /// All tools, sorted by name.
    pub fn get_all_tools(&self) -> Vec<ToolInfo> {
        self.discover_tools(&DiscoveryFilter::default())
    }

    pub fn get_categories(&self) -> Vec<String> {
        self.inner.read().categories.iter().cloned().collect()
    }

    pub fn get_tags(&self) -> Vec<String> {
        self.inner.read().tags.iter().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        self.inner.read().tools.get(name).map(|t| ResolvedTool {
            name: name.to_string(),
            handler: t.handler.clone(),
            schema: t.schema.clone(),
            is_active: t.is_active,
            cacheable: t.cacheable,
        })
    }

    /// Shallow-merge `patch` into the tool's metadata.
    pub fn update_tool_metadata(
        &self,
        name: &str,
        patch: MetadataPatch,
    ) -> Result<ToolInfo, RegistryError> {
        let mut inner = self.inner.write();
        let tool = inner
            .tools
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        tool.metadata.apply(patch);
        let info = tool.info();
        inner.absorb_facets(&info.metadata);
        Ok(info)
    }

    pub fn set_tool_active(&self, name: &str, is_active: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let tool = inner
            .tools
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        tool.is_active = is_active;
        tracing::info!(tool = %name, is_active, "Tool activation changed");
        Ok(())
    }

    /// Count one use of `name`. Unknown names are ignored.
    pub fn record_tool_usage(&self, name: &str) {
        if let Some(tool) = self.inner.read().tools.get(name) {
            tool.usage.record();
        }
    }

    pub fn get_usage_statistics(&self) -> UsageStatistics {
        let inner = self.inner.read();
        let tools = inner.ordered();

        let mut category_counts = BTreeMap::new();
        let mut tag_counts = BTreeMap::new();
        for tool in &tools {
            *category_counts
                .entry(tool.metadata.category.clone())
                .or_insert(0) += 1;
            for tag in &tool.metadata.tags {
                *tag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        // Stable sort over registration order: ties keep that order.
        let mut used: Vec<ToolUsage> = tools
            .iter()
            .map(|t| ToolUsage {
                name: t.metadata.name.clone(),
                usage_count: t.usage.count(),
            })
            .filter(|u| u.usage_count > 0)
            .collect();
        used.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));

        UsageStatistics {
            total_tools: tools.len(),
            active_tools: tools.iter().filter(|t| t.is_active).count(),
            total_usage: tools.iter().map(|t| t.usage.count()).sum(),
            most_used_tool: used.first().cloned(),
            least_used_tool: used.last().cloned(),
            category_counts,
            tag_counts,
        }
    }

    pub fn get_health_status(&self) -> RegistryHealth {
        let inner = self.inner.read();
        let tools = inner.ordered();
        let total = tools.len();
        let active = tools.iter().filter(|t| t.is_active).count();
        let inactive = total - active;

        let invalid: Vec<&str> = tools
            .iter()
            .filter(|t| t.validation.as_ref().is_some_and(|v| !v.is_valid))
            .map(|t| t.metadata.name.as_str())
            .collect();

        let mut issues = Vec::new();
        if !invalid.is_empty() {
            issues.push(format!(
                "{} tool(s) failed validation: {}",
                invalid.len(),
                invalid.join(", ")
            ));
        }
        if inactive > active {
            issues.push(format!(
                "More inactive tools ({}) than active tools ({})",
                inactive, active
            ));
        }

        let status = if !invalid.is_empty() {
            RegistryHealthStatus::Error
        } else if inactive > active {
            RegistryHealthStatus::Warning
        } else {
            RegistryHealthStatus::Healthy
        };

        RegistryHealth {
            status,
            total_tools: total,
            active_tools: active,
            inactive_tools: inactive,
            invalid_tools: invalid.len(),
            issues,
        }
    }
}
