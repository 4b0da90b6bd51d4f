use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use mcp_testing_server::{ServerConfig, TransportConfig, create_server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-testing-server")]
#[command(about = "MCP server with tool registry, lifecycle management and health probes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportKind {
    Stdio,
    Http,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server until interrupted or the client disconnects
    Serve {
        /// Path to a JSON config file (falls back to MCP_SERVER_CONFIG, then ./mcp-server.json)
        #[arg(short, long, env = "MCP_SERVER_CONFIG")]
        config: Option<PathBuf>,
        /// Override the configured transport
        #[arg(long, value_enum)]
        transport: Option<TransportKind>,
        /// Bind address for the HTTP transport, e.g. 0.0.0.0:3942
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Enable the probe endpoints on this port
        #[arg(long)]
        health_port: Option<u16>,
    },
    /// Load and validate the configuration, then print it
    CheckConfig {
        #[arg(short, long, env = "MCP_SERVER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the built-in tool catalog
    ListTools,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mcp_testing_server=info".parse()?)
                .add_directive("rmcp=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            transport,
            bind,
            health_port,
        } => {
            let mut config = ServerConfig::load(config.as_deref())?;
            apply_overrides(&mut config, transport, bind, health_port);
            let config = ServerConfig::new(config)?;
            info!(
                "Starting {} v{} over {:?}",
                config.name, config.version, config.transport
            );

            let handle = create_server(config)?;
            handle.controller.start().await?;

            let session_closed = handle.session_closed.clone();
            tokio::select! {
                _ = shutdown_signal() => info!("Shutdown signal received"),
                _ = async {
                    match session_closed {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                } => info!("Client session ended"),
            }

            if let Err(e) = handle.controller.stop().await {
                warn!("Shutdown did not complete cleanly: {}", e);
            }
            info!("Server stopped");
        }
        Commands::CheckConfig { config } => {
            let config = ServerConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::ListTools => {
            for metadata in mcp_testing_server::tools::system::catalog()? {
                println!("{:<26} {}", metadata.name, metadata.description);
            }
        }
    }

    Ok(())
}

fn apply_overrides(
    config: &mut ServerConfig,
    transport: Option<TransportKind>,
    bind: Option<SocketAddr>,
    health_port: Option<u16>,
) {
    match transport {
        Some(TransportKind::Stdio) => config.transport = TransportConfig::Stdio,
        Some(TransportKind::Http) if !matches!(config.transport, TransportConfig::Http { .. }) => {
            config.transport = TransportConfig::Http {
                host: "127.0.0.1".to_string(),
                port: 3942,
                path: "/mcp".to_string(),
            };
        }
        _ => {}
    }
    if let (Some(addr), TransportConfig::Http { host, port, .. }) = (bind, &mut config.transport) {
        *host = addr.ip().to_string();
        *port = addr.port();
    }
    if let Some(p) = health_port {
        config.health_check.enabled = true;
        config.health_check.port = p;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
