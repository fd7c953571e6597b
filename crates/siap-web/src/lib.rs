//! Axum JSON API over the sync engine: sync invocations, status queries and
//! schedule management. Rendering lives elsewhere; these routes only forward
//! to the engine and always answer with a structured body.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use siap_core::SyncUnit;
use siap_storage::SchedulePatch;
use siap_sync::{StatusFilter, SyncEngine, SyncError, SyncOptions};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "siap-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    dataset_id: String,
    period: String,
    batch_size: Option<usize>,
    max_pages: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusQuery {
    dataset_id: Option<String>,
    period: Option<String>,
    verify: Option<bool>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/datasets", get(datasets_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync/status", get(status_handler))
        .route("/api/schedule", get(schedule_get_handler).put(schedule_put_handler))
        .route("/api/schedule/run", post(schedule_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SIAP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let config = siap_sync::SyncConfig::from_env();
    let engine = Arc::new(siap_sync::build_engine(&config)?);

    if let Some(scheduler) = siap_sync::maybe_build_scheduler(engine.clone(), &config).await? {
        scheduler.start().await?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving sync api");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn datasets_handler() -> Response {
    let datasets: Vec<_> = siap_api::syncable_datasets().collect();
    Json(datasets).into_response()
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    if !siap_api::is_syncable(&request.dataset_id) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("dataset {} is not syncable", request.dataset_id),
        );
    }

    let defaults = SyncOptions::default();
    let opts = SyncOptions {
        batch_size: request.batch_size.unwrap_or(defaults.batch_size),
        max_pages: request.max_pages.unwrap_or(defaults.max_pages),
    };
    let unit = SyncUnit::new(request.dataset_id, request.period);

    match state.engine.sync_unit(&unit, &opts).await {
        Ok(report) => Json(report).into_response(),
        Err(err @ SyncError::AlreadyInProgress { .. }) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let filter = StatusFilter {
        dataset_id: query.dataset_id,
        period: query.period,
    };
    // Explicit refresh calls verify by default; initial loads pass
    // verify=false to skip the per-entry store hits.
    let verify = query.verify.unwrap_or(true);
    match state.engine.list_status(&filter, verify).await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn schedule_get_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.state_store().get_schedule().await).into_response()
}

async fn schedule_put_handler(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SchedulePatch>,
) -> Response {
    match state.engine.state_store().update_schedule(patch).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn schedule_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.state_store().mark_run(Utc::now()).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
