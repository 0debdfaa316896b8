//! HTTP mode: an axum app running with request-scoped sessions.
//!
//! Every request gets its own `RequestScope` through the request hook; sessions
//! opened while handling it are closed when the response is produced.

use crate::error::{SessionError, SessionResult};
use crate::hook;
use crate::scope::RequestScope;
use crate::session::SessionManager;
use crate::transport::Transport;
use crate::transport::worker::PROBE_SQL;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct HttpServer {
    manager: Arc<SessionManager>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpServer {
    pub fn new(manager: Arc<SessionManager>, host: impl Into<String>, port: u16) -> Self {
        Self {
            manager,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize)]
pub struct BackendSummary {
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub backend: String,
    pub session_id: String,
    pub request_id: String,
    pub mode: String,
}

/// `SessionError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
            SessionError::DuplicateKey { .. } => StatusCode::CONFLICT,
            SessionError::Connection { .. } => StatusCode::BAD_GATEWAY,
            SessionError::Config { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Fatal { .. } | SessionError::Database { .. } | SessionError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "suggestion": self.0.suggestion(),
        });
        (status, Json(body)).into_response()
    }
}

async fn list_backends(State(manager): State<Arc<SessionManager>>) -> Json<Vec<BackendSummary>> {
    let backends = manager
        .backend_names()
        .into_iter()
        .map(|name| BackendSummary {
            aliases: manager.aliases_of(&name),
            name,
        })
        .collect();
    Json(backends)
}

async fn ping_backend(
    State(manager): State<Arc<SessionManager>>,
    scope: RequestScope,
    Path(name): Path<String>,
) -> Result<Json<PingResponse>, ApiError> {
    let guard = manager.transaction(&scope, &name, None).await?;
    let backend = guard.name().to_string();
    let session_id = guard.session().id().to_string();
    guard.session().execute(PROBE_SQL).await?;
    guard.commit().await?;

    Ok(Json(PingResponse {
        backend,
        session_id,
        request_id: scope.context().id().to_string(),
        mode: manager.session_mode(&scope).to_string(),
    }))
}

/// Build the application router with the request hook installed.
pub fn router(manager: Arc<SessionManager>) -> Router {
    let app = Router::new()
        .route("/backends", get(list_backends))
        .route("/backends/{name}/ping", get(ping_backend))
        .with_state(Arc::clone(&manager));
    hook::attach(app, manager)
}

impl Transport for HttpServer {
    async fn run(&self) -> SessionResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting HTTP server on {}", bind_addr);

        self.manager.configure().await?;
        let app = router(Arc::clone(&self.manager));

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SessionError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        // Force exit after a timeout once shutdown begins
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(SessionError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for requests to finish (send signal again to force exit)..."
                );
                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        info!("Closing session factories");
        self.manager.close_factories().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
