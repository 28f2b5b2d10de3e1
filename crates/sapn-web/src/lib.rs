//! Axum surface for manual checks and the stored-event audit trail.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use sapn_core::{CanonicalEvent, ReconciliationResult};
use sapn_storage::StoreError;
use sapn_sync::{build_driver, maybe_build_scheduler, AppConfig, ReconciliationDriver, RunOverrides};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "sapn-web";
const DEFAULT_EVENTS_LIMIT: u32 = 50;
const MAX_EVENTS_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<ReconciliationDriver>,
}

impl AppState {
    pub fn new(driver: Arc<ReconciliationDriver>) -> Self {
        Self { driver }
    }
}

/// Body of `/api/check`, identical on success and failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub new_absences: usize,
    pub new_behavior_alerts: usize,
    pub retried_events: usize,
    pub email_sent: bool,
    pub error: Option<String>,
}

impl CheckResponse {
    pub fn success(result: &ReconciliationResult) -> Self {
        Self {
            status: "success".to_string(),
            timestamp: result.timestamp,
            new_absences: result.new_absences,
            new_behavior_alerts: result.new_behavior_alerts,
            retried_events: result.retried_events,
            email_sent: result.email_sent,
            error: None,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            status: "error".to_string(),
            timestamp: Utc::now(),
            new_absences: 0,
            new_behavior_alerts: 0,
            retried_events: 0,
            email_sent: false,
            error: Some(message),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/check", get(check_handler).post(check_handler))
        .route("/api/events", get(events_handler))
        .route("/api/events/pending", get(pending_events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Builds the live driver from the environment, starts the optional
/// scheduler alongside it and serves until the listener fails.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let driver = Arc::new(build_driver(&config, &RunOverrides::default()).await?);
    let scheduler = maybe_build_scheduler(&config, Arc::clone(&driver)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
    }
    serve(AppState::new(driver), config.web_port).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn check_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.driver.run().await {
        Ok(result) => (StatusCode::OK, Json(CheckResponse::success(&result))).into_response(),
        Err(err) => {
            error!(error = %err, "manual check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CheckResponse::failure(err.to_string())),
            )
                .into_response()
        }
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .clamp(1, MAX_EVENTS_LIMIT);
    events_response(state.driver.store().list_recent(limit).await)
}

async fn pending_events_handler(State(state): State<Arc<AppState>>) -> Response {
    events_response(state.driver.store().pending_notification().await)
}

fn events_response(events: Result<Vec<CanonicalEvent>, StoreError>) -> Response {
    match events {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "event store query failed");
    let status = if err.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
