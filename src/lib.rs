pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod resilience;
pub mod server;
pub mod tools;

pub use config::{ConfigError, ServerConfig, TransportConfig};
pub use context::ServerContext;
pub use error::{CategorizedError, ServerError};
pub use lifecycle::{LifecycleController, ServerState, Transport};
pub use server::{HttpTransport, McpServer, StdioTransport};
pub use tools::{RegisterOptions, ToolMetadata, ToolRegistry};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A fully wired server, ready to be started.
pub struct ServerHandle {
    pub controller: Arc<LifecycleController>,
    /// Cancelled when a stdio client disconnects. `None` for HTTP.
    pub session_closed: Option<CancellationToken>,
}

impl ServerHandle {
    pub fn context(&self) -> &Arc<ServerContext> {
        self.controller.context()
    }
}

/// Convenience function to create a fully configured MCP server.
///
/// Validates the config, builds the shared context, picks the transport named
/// by the config and registers the built-in system tools against the new
/// controller.
pub fn create_server(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let context = Arc::new(ServerContext::new(config)?);

    let (transport, session_closed): (Arc<dyn Transport>, _) = match &context.config.transport {
        TransportConfig::Stdio => {
            let stdio = Arc::new(StdioTransport::new(context.clone()));
            let closed = stdio.closed();
            (stdio, Some(closed))
        }
        TransportConfig::Http { host, port, path } => (
            Arc::new(HttpTransport::new(context.clone(), host.clone(), *port, path.clone())),
            None,
        ),
    };

    Ok(ServerHandle {
        controller: with_transport(context, transport)?,
        session_closed,
    })
}

/// Wire a controller over an arbitrary transport and register the system tools.
pub fn with_transport(
    context: Arc<ServerContext>,
    transport: Arc<dyn Transport>,
) -> Result<Arc<LifecycleController>, ServerError> {
    let controller = LifecycleController::new(context.clone(), transport);
    tools::register_system_tools(&context.registry, Arc::downgrade(&controller))?;
    Ok(controller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_server_registers_system_tools() {
        let handle = create_server(ServerConfig::default()).unwrap();
        assert!(handle.session_closed.is_some());
        assert_eq!(handle.controller.transport_kind(), "stdio");
        assert_eq!(handle.context().registry.len(), 7);
        assert!(handle.context().registry.contains("server_lifecycle"));
    }

    #[test]
    fn test_create_server_over_http() {
        let config = ServerConfig {
            transport: TransportConfig::Http {
                host: "127.0.0.1".to_string(),
                port: 3942,
                path: "/mcp".to_string(),
            },
            ..Default::default()
        };
        let handle = create_server(config).unwrap();
        assert!(handle.session_closed.is_none());
        assert_eq!(handle.controller.transport_kind(), "http");
    }

    #[test]
    fn test_create_server_rejects_invalid_config() {
        let mut config = ServerConfig::default();
        config.version = "not-a-version".to_string();
        config.error_handling.max_consecutive_errors = 0;

        let err = create_server(config).err().unwrap();
        assert!(matches!(err, ServerError::Configuration(_)));
        let message = err.to_string();
        assert!(message.contains("version"));
        assert!(message.contains("maxConsecutiveErrors"));
    }

    #[test]
    fn test_http_port_below_range_is_rejected() {
        let config = ServerConfig {
            transport: TransportConfig::Http {
                host: "127.0.0.1".to_string(),
                port: 80,
                path: "/mcp".to_string(),
            },
            ..Default::default()
        };
        assert!(ServerContext::new(config).is_err());
    }
}
