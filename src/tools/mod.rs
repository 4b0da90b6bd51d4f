//! Tool registry, execution wrapper and the built-in system tools.
//!
//! Tools are registered once with metadata, a parameter schema and a
//! handler; every call goes through [`ExecutionWrapper`] so validation,
//! caching, circuit breaking and error categorization apply uniformly.

pub mod metadata;
pub mod registry;
pub mod schema;
pub mod system;
pub mod wrapper;

pub use metadata::{MetadataPatch, ToolExample, ToolMetadata, ValidationReport};
pub use registry::{
    DiscoveryFilter, RegisterOptions, RegistryError, ToolHandler, ToolInfo, ToolRegistry,
    handler_fn, typed_handler,
};
pub use schema::ParamSchema;
pub use system::register_system_tools;
pub use wrapper::{CallMeta, ExecutionWrapper, ToolOutcome};
