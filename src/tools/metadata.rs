//! Tool metadata and registration-time validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceUsage {
    Light,
    Moderate,
    Heavy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceHints {
    /// Expected response time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExample {
    pub title: String,
    pub description: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ToolExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceHints>,
}

impl ToolMetadata {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: version.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_documentation(mut self, documentation: impl Into<String>) -> Self {
        self.documentation = Some(documentation.into());
        self
    }

    pub fn with_example(mut self, example: ToolExample) -> Self {
        self.examples.push(example);
        self
    }

    pub fn with_performance(mut self, performance: PerformanceHints) -> Self {
        self.performance = Some(performance);
        self
    }

    pub fn complexity(&self) -> Option<Complexity> {
        self.performance.as_ref().and_then(|p| p.complexity)
    }

    /// Shallow merge: every field present in `patch` replaces the current one.
    pub fn apply(&mut self, patch: MetadataPatch) {
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(version) = patch.version {
            self.version = version;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if let Some(author) = patch.author {
            self.author = Some(author);
        }
        if let Some(documentation) = patch.documentation {
            self.documentation = Some(documentation);
        }
        if let Some(examples) = patch.examples {
            self.examples = examples;
        }
        if let Some(dependencies) = patch.dependencies {
            self.dependencies = Some(dependencies);
        }
        if let Some(performance) = patch.performance {
            self.performance = Some(performance);
        }
    }
}

/// Partial metadata update. The tool name is not patchable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetadataPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub examples: Option<Vec<ToolExample>>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub performance: Option<PerformanceHints>,
}

/// Snapshot of a registration-time validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate metadata. Errors block registration, warnings do not.
pub fn validate_metadata(metadata: &ToolMetadata) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if metadata.name.trim().is_empty() {
        errors.push("Tool name is required".to_string());
    } else if !is_valid_tool_name(&metadata.name) {
        errors.push(format!(
            "Tool name '{}' must contain only letters, numbers, underscores, and hyphens",
            metadata.name
        ));
    }

    if metadata.description.trim().is_empty() {
        errors.push("Tool description is required".to_string());
    }
    if metadata.category.trim().is_empty() {
        errors.push("Tool category is required".to_string());
    }

    if metadata.version.trim().is_empty() {
        errors.push("Tool version is required".to_string());
    } else if semver::Version::parse(&metadata.version).is_err() {
        warnings.push(format!(
            "Tool version '{}' should follow semantic versioning (x.y.z)",
            metadata.version
        ));
    }

    if metadata.examples.is_empty() {
        warnings.push("Tool should include usage examples".to_string());
    }
    if metadata.documentation.is_none() {
        warnings.push("Tool should include documentation".to_string());
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        validated_at: Utc::now(),
    }
}
