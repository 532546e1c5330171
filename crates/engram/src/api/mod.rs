//! HTTP API
//!
//! A small axum surface over the store. Every route except the health probe
//! requires the configured bearer token. Errors map onto a stable JSON shape
//! so clients can branch on the `error` field without parsing messages.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header::AUTHORIZATION};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::BriefConfig;
use crate::embedding::Embedder;
use crate::error::{EngramError, Result};
use crate::maintenance::MaintenanceRunner;
use crate::storage::{LanceStore, TtlCache};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LanceStore>,
    pub embedder: Arc<dyn Embedder>,
    pub cache: Arc<TtlCache>,
    pub runner: Arc<MaintenanceRunner>,
    /// Serializes maintenance runs; the scheduler skips when held
    pub maintenance_guard: Arc<Mutex<()>>,
    pub auth_token: String,
    pub embed_timeout: Duration,
    pub brief: BriefConfig,
    pub record_summary: bool,
}

impl IntoResponse for EngramError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            EngramError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            EngramError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngramError::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage"),
            EngramError::Embedding(_) => (StatusCode::SERVICE_UNAVAILABLE, "embedding"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = axum::Json(json!({
            "error": code,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.auth_token.is_empty() {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.auth_token);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({
                "error": "unauthorized",
                "message": "missing or invalid bearer token",
            })),
        )
            .into_response()
    }
}

/// Build the full router, auth and middleware included
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let protected = Router::new()
        .route("/memory/add", post(handlers::add))
        .route("/memory/search", get(handlers::search))
        .route("/memory/pin", post(handlers::pin))
        .route("/memory/forget", post(handlers::forget))
        .route("/memory/maintenance", post(handlers::maintenance))
        .route("/daily_brief", get(handlers::daily_brief))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(protected)
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Serve until ctrl-c
pub async fn serve(router: Router, listen_addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
