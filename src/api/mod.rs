//! HTTP probe endpoints for external orchestration: health, readiness and
//! liveness.

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{MethodRouter, get},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::HealthCheckConfig;
use crate::health::{HealthReporter, HealthStatus};

const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

#[derive(Clone)]
pub struct ProbeState {
    reporter: HealthReporter,
    endpoints: Arc<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    detailed: Option<String>,
}

impl HealthQuery {
    fn is_detailed(&self) -> bool {
        matches!(self.detailed.as_deref(), Some("true" | "1" | "yes"))
    }
}

pub fn probe_router(reporter: HealthReporter, config: &HealthCheckConfig) -> Router {
    let state = ProbeState {
        reporter,
        endpoints: Arc::new(vec![
            config.health_path.clone(),
            config.ready_path.clone(),
            config.live_path.clone(),
        ]),
    };

    Router::new()
        .route(&config.health_path, probe(get(health)))
        .route(&config.ready_path, probe(get(ready)))
        .route(&config.live_path, probe(get(live)))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// GET (and implicitly HEAD) plus OPTIONS; anything else is a 405.
fn probe(route: MethodRouter<ProbeState>) -> MethodRouter<ProbeState> {
    route.options(preflight).fallback(method_not_allowed)
}

async fn health(State(state): State<ProbeState>, Query(query): Query<HealthQuery>) -> Response {
    let report = state.reporter.report(query.is_detailed());
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
        HealthStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}

async fn ready(State(state): State<ProbeState>) -> Response {
    let readiness = state.reporter.readiness();
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

async fn live(State(state): State<ProbeState>) -> Response {
    let liveness = state.reporter.liveness();
    let status = if liveness.alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(liveness)).into_response()
}

async fn preflight() -> Response {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOWED_METHODS),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type"),
            ),
            (header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS)),
        ],
    )
        .into_response()
}

async fn method_not_allowed(method: Method, uri: Uri) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS))],
        Json(json!({
            "error": "Method Not Allowed",
            "message": format!("Method {} is not allowed for {}", method, uri.path()),
            "allowedMethods": ["GET", "HEAD", "OPTIONS"],
        })),
    )
        .into_response()
}

async fn not_found(State(state): State<ProbeState>, method: Method, uri: Uri) -> Response {
    if method == Method::OPTIONS {
        return preflight().await;
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "message": format!("No endpoint at {}", uri.path()),
            "availableEndpoints": state.endpoints.as_slice(),
        })),
    )
        .into_response()
}

/// A running probe server.
pub struct ProbeListener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ProbeListener {
    pub async fn bind(reporter: HealthReporter, config: &HealthCheckConfig) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let router = probe_router(reporter, config);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("Probe listener failed: {}", e);
            }
        });

        tracing::info!("Probe endpoints listening on http://{}", addr);
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight probes to finish.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown.cancel();
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            tracing::warn!(addr = %self.addr, "Probe listener did not shut down in time");
            task.abort();
        } else {
            tracing::info!(addr = %self.addr, "Probe listener stopped");
        }
    }
}
