//! Application startup and lifecycle management.

use crate::config::{FeeLedgerConfig, StoreBackend};
use crate::handlers::{fees, finance, verify};
use crate::services::{
    get_metrics, init_metrics, BillingManager, Database, HttpDispatcher, LedgerStore,
    LogDispatcher, MemoryLedgerStore, NotificationDispatcher, Notifier, PaymentRecorder,
    ReportingAggregator,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware::from_fn,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: FeeLedgerConfig,
    pub store: Arc<dyn LedgerStore>,
    pub billing: BillingManager,
    pub payments: PaymentRecorder,
    pub reports: ReportingAggregator,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": state.config.service_version
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - ledger store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready" })),
            )
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

/// Build the HTTP router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/fees",
            get(fees::list_fees)
                .post(fees::create_fee)
                .patch(fees::patch_fees)
                .put(fees::record_payment),
        )
        .route("/fees/students/:student_id", get(fees::student_statement))
        .route("/finance/dashboard", get(finance::dashboard))
        .route(
            "/finance/payments",
            get(finance::list_payments)
                .post(finance::submit_payment)
                .patch(finance::update_payment_status),
        )
        .route("/verify-payment", post(verify::verify_payment))
        .route_layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration, connecting to
    /// the configured ledger store and notification service.
    pub async fn build(config: FeeLedgerConfig) -> Result<Self, AppError> {
        let store: Arc<dyn LedgerStore> = match &config.store {
            StoreBackend::Postgres(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Arc::new(db)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory ledger store; data does not survive restarts");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let dispatcher: Arc<dyn NotificationDispatcher> = match &config.notification.url {
            Some(url) => Arc::new(HttpDispatcher::new(url)),
            None => {
                tracing::info!("Notification service URL not configured - notices are logged only");
                Arc::new(LogDispatcher)
            }
        };

        Self::build_with_store(config, store, dispatcher).await
    }

    /// Build the application over an existing store and dispatcher.
    pub async fn build_with_store(
        config: FeeLedgerConfig,
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let notifier = Notifier::new(dispatcher);
        let state = AppState {
            billing: BillingManager::new(store.clone(), notifier.clone(), config.balance),
            payments: PaymentRecorder::new(store.clone(), notifier),
            reports: ReportingAggregator::new(store.clone()),
            store,
            config: config.clone(),
        };

        // Port 0 picks a random port, used by tests
        let addr = config.common.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Fee ledger service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the application state.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = router(self.state);
        tracing::info!(port = self.port, "Starting HTTP server");
        axum::serve(self.listener, router).await
    }
}
