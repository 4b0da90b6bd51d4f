//! MCP protocol adapter using rmcp, and the stdio / streamable-HTTP
//! transports the lifecycle controller drives.

use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer, ServiceExt},
    transport::{StreamableHttpServerConfig, stdio},
};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{ServerContext, SessionGuard};
use crate::error::ServerError;
use crate::lifecycle::Transport;
use crate::tools::registry::DiscoveryFilter;
use crate::tools::wrapper::ToolOutcome;

const TOOLS_PAGE_SIZE: usize = 50;

/// MCP server handling protocol requests for one session.
///
/// Every tool call goes through the context's execution wrapper, so a
/// failing tool yields an error envelope rather than a protocol error.
#[derive(Clone)]
pub struct McpServer {
    context: Arc<ServerContext>,
    /// Held for the lifetime of the session; dropping the last clone closes it.
    _session: Arc<SessionGuard>,
}

impl McpServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        let session = Arc::new(context.sessions.open());
        Self {
            context,
            _session: session,
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Active tools as MCP descriptors, one page at a time.
    pub fn list_tool_page(&self, cursor: Option<&str>) -> (Vec<Tool>, Option<String>) {
        let active = DiscoveryFilter {
            is_active: Some(true),
            ..Default::default()
        };
        let tools = self.context.registry.discover_tools(&active);
        let offset = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);

        let page: Vec<Tool> = tools
            .iter()
            .skip(offset)
            .take(TOOLS_PAGE_SIZE)
            .map(|info| Tool {
                name: Cow::Owned(info.metadata.name.clone()),
                title: None,
                description: Some(Cow::Owned(info.metadata.description.clone())),
                input_schema: Arc::new(info.input_schema.clone()),
                output_schema: None,
                annotations: None,
                icons: None,
                meta: None,
            })
            .collect();

        let next = offset + page.len();
        let next_cursor = (next < tools.len()).then(|| next.to_string());
        (page, next_cursor)
    }

    /// Run a tool through the execution wrapper and render the envelope.
    pub async fn dispatch(&self, name: &str, arguments: Option<JsonObject>) -> CallToolResult {
        let params = serde_json::Value::Object(arguments.unwrap_or_default());
        let outcome = self.context.executor.execute(name, params).await;
        render_outcome(&outcome)
    }
}

fn render_outcome(outcome: &ToolOutcome) -> CallToolResult {
    let structured = serde_json::to_value(outcome).ok();
    let text = serde_json::to_string_pretty(outcome)
        .unwrap_or_else(|_| "internal serialization error".to_string());
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: structured,
        is_error: Some(!outcome.is_success()),
        meta: None,
    }
}

impl ServerHandler for McpServer {
    fn ping(
        &self,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn list_tools(
        &self,
        request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let cursor = request.as_ref().and_then(|r| r.cursor.as_deref());
        let (tools, next_cursor) = self.list_tool_page(cursor);
        let result = ListToolsResult {
            tools,
            next_cursor,
            ..Default::default()
        };
        std::future::ready(Ok(result))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_name = request.name.to_string();
        let args = request.arguments;

        async move { Ok(self.dispatch(&tool_name, args).await) }
    }

    fn get_info(&self) -> ServerInfo {
        let config = &self.context.config;
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: config.name.clone(),
                version: config.version.clone(),
                ..Default::default()
            },
            instructions: Some(format!(
                "{}. Use tool_discovery to find tools, health_check for server health, \
                 and server_lifecycle to reset errors or restart.",
                config.description
            )),
        }
    }
}

struct RunningSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Serves a single MCP session over stdin/stdout.
pub struct StdioTransport {
    context: Arc<ServerContext>,
    session: Mutex<Option<RunningSession>>,
    closed: CancellationToken,
}

impl StdioTransport {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            session: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Cancelled when the client ends the session (stdin closed).
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn start(&self) -> Result<(), ServerError> {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let ct = cancel.clone();
        let closed = self.closed.clone();
        let server = McpServer::new(self.context.clone());
        let task = tokio::spawn(async move {
            match server.serve_with_ct(stdio(), ct.clone()).await {
                Ok(service) => match service.waiting().await {
                    Ok(reason) => tracing::info!(?reason, "MCP stdio session ended"),
                    Err(e) => tracing::error!("MCP stdio session failed: {:?}", e),
                },
                Err(e) => tracing::error!("serving error: {:?}", e),
            }
            if !ct.is_cancelled() {
                closed.cancel();
            }
        });

        *slot = Some(RunningSession { cancel, task });
        tracing::info!("MCP stdio transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };
        session.cancel.cancel();
        session
            .task
            .await
            .map_err(|e| ServerError::execution(format!("stdio session task failed: {}", e)))?;
        tracing::info!("MCP stdio transport stopped");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ServerError> {
        match self.session.lock().as_ref() {
            None => Err(ServerError::execution("stdio session is not running")),
            Some(s) if s.task.is_finished() => Err(ServerError::execution("stdio session has ended")),
            Some(_) => Ok(()),
        }
    }
}

struct RunningHttp {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Serves MCP over Streamable HTTP at `path` on `host:port`.
pub struct HttpTransport {
    context: Arc<ServerContext>,
    host: String,
    port: u16,
    path: String,
    server: Mutex<Option<RunningHttp>>,
}

impl HttpTransport {
    pub fn new(context: Arc<ServerContext>, host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            context,
            host: host.into(),
            port,
            path: path.into(),
            server: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.addr)
    }

    fn router(&self) -> (Router, CancellationToken) {
        let http_config = StreamableHttpServerConfig::default();
        let service_ct = http_config.cancellation_token.clone();
        let context = self.context.clone();
        let service = StreamableHttpService::new(
            move || Ok(McpServer::new(context.clone())),
            LocalSessionManager::default().into(),
            http_config,
        );
        (Router::new().nest_service(&self.path, service), service_ct)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn start(&self) -> Result<(), ServerError> {
        if self.server.lock().is_some() {
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                ServerError::execution(format!("Failed to bind {}:{}: {}", self.host, self.port, e))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::execution(format!("Failed to read bound address: {}", e)))?;

        let (router, service_ct) = self.router();
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    signal.cancelled().await;
                    service_ct.cancel();
                })
                .await;
            if let Err(e) = served {
                tracing::error!("MCP HTTP server failed: {}", e);
            }
        });

        *self.server.lock() = Some(RunningHttp {
            addr,
            shutdown,
            task,
        });
        tracing::info!("MCP HTTP server listening on http://{}{}", addr, self.path);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        let running = self.server.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        running.shutdown.cancel();
        running
            .task
            .await
            .map_err(|e| ServerError::execution(format!("HTTP server task failed: {}", e)))?;
        tracing::info!(addr = %running.addr, "MCP HTTP server stopped");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ServerError> {
        match self.server.lock().as_ref() {
            None => Err(ServerError::execution("HTTP server is not running")),
            Some(s) if s.task.is_finished() => Err(ServerError::execution("HTTP server has exited")),
            Some(_) => Ok(()),
        }
    }
}
