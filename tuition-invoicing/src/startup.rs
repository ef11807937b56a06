//! Application startup and lifecycle management.

use crate::config::InvoicingConfig;
use crate::handlers;
use crate::services::metrics::HTTP_REQUESTS_TOTAL;
use crate::services::{get_metrics, init_metrics, Database, ReconciliationCommitter, TransactionalStore};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState<S> {
    pub committer: ReconciliationCommitter<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            committer: self.committer.clone(),
        }
    }
}

impl<S: TransactionalStore> AppState<S> {
    pub fn new(committer: ReconciliationCommitter<S>) -> Self {
        Self { committer }
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check<S: TransactionalStore + 'static>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    match state.committer.store().health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "tuition-invoicing",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "tuition-invoicing",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check<S: TransactionalStore + 'static>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    match state.committer.store().health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let response = next.run(req).await;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), response.status().as_str()])
        .inc();
    response
}

/// HTTP routes over any transactional store.
pub fn router<S: TransactionalStore + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_check::<S>))
        .route("/ready", get(readiness_check::<S>))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/invoices/:invoice_id/line-items",
            get(handlers::get_line_items::<S>).put(handlers::save_line_items::<S>),
        )
        .route(
            "/api/invoices/:invoice_id/total",
            post(handlers::recompute_total::<S>),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState<Database>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: InvoicingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    pub async fn build_without_migrations(config: InvoicingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: InvoicingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let committer = ReconciliationCommitter::new(Arc::new(db), config.commit.default_mode);
        let state = AppState::new(committer);

        let http_addr = config.common.bind_address();
        let http_listener = TcpListener::bind(&http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            commit_mode = config.commit.default_mode.as_str(),
            "Tuition invoicing listener bound"
        );

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        self.state.committer.store()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let http_router = router(self.state);

        tracing::info!(
            service = "tuition-invoicing",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, http_router)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
