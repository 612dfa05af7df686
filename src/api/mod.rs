//! Control-surface HTTP routes, axum idiom: `Router` with `.route(path,
//! get/post(handler))`, `State<AppState>` extractor, `IntoResponse` error
//! enum mapping `BridgeError` variants to status codes.

pub mod websocket;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::BridgeError;
use crate::manager::Manager;
use crate::model::{DeviceDescriptor, Sample, Summary, Workout, WorkoutId};
use crate::source::Source;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub source: Arc<Source>,
    pub manager: Arc<Manager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(discover_devices))
        .route("/api/devices/:address/connect", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/status", get(status))
        .route("/api/workouts", get(list_workouts).post(start_workout))
        .route("/api/workouts/:id", get(get_workout))
        .route("/api/workouts/:id/end", post(end_workout))
        .route("/api/workouts/:id/samples", get(get_samples))
        .route("/api/workouts/:id/fit", get(export_fit))
        .route("/ws/live", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    scan_secs: Option<u64>,
}

async fn discover_devices(
    State(state): State<AppState>,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Vec<DeviceDescriptor>>, ApiError> {
    let devices = state.source.discover(query.scan_secs).await?;
    Ok(Json(devices))
}

async fn connect(State(state): State<AppState>, Path(address): Path<String>) -> Result<StatusCode, ApiError> {
    state.source.connect(&address).await?;
    info!("connected to {address}");
    Ok(StatusCode::OK)
}

async fn disconnect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.source.disconnect().await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    connected_device: Option<DeviceDescriptor>,
    workout_active: bool,
    latest_sample: Option<Sample>,
    summary: Option<Summary>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connected_device: state.source.connected_device().await,
        workout_active: state.manager.is_active().await,
        latest_sample: state.manager.latest_sample().await,
        summary: state.manager.active_summary().await,
    })
}

#[derive(Debug, Deserialize)]
struct StartWorkoutRequest {
    #[allow(dead_code)]
    device_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartWorkoutResponse {
    workout_id: WorkoutId,
}

async fn start_workout(
    State(state): State<AppState>,
    Json(_req): Json<StartWorkoutRequest>,
) -> Result<Json<StartWorkoutResponse>, ApiError> {
    let device = state.source.connected_device().await.ok_or(BridgeError::NotConnected)?;
    let kind = device.kind;
    let workout_id = state.manager.start_workout(device, kind).await?;
    Ok(Json(StartWorkoutResponse { workout_id }))
}

async fn end_workout(State(state): State<AppState>) -> Result<Json<StartWorkoutResponse>, ApiError> {
    let workout_id = state.manager.end_workout().await?;
    Ok(Json(StartWorkoutResponse { workout_id }))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct WorkoutWithSummary {
    workout: Workout,
    summary: Option<Summary>,
}

async fn list_workouts(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<WorkoutWithSummary>>, ApiError> {
    let rows = state
        .store
        .list_workouts(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await
        .map_err(BridgeError::Internal)?;
    Ok(Json(rows.into_iter().map(|(workout, summary)| WorkoutWithSummary { workout, summary }).collect()))
}

async fn get_workout(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<WorkoutWithSummary>, ApiError> {
    let (workout, summary) = state
        .store
        .get_workout(WorkoutId(id))
        .await
        .map_err(BridgeError::Internal)?
        .ok_or(BridgeError::WorkoutNotFound)?;
    Ok(Json(WorkoutWithSummary { workout, summary }))
}

async fn get_samples(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Vec<Sample>>, ApiError> {
    state
        .store
        .get_workout(WorkoutId(id))
        .await
        .map_err(BridgeError::Internal)?
        .ok_or(BridgeError::WorkoutNotFound)?;
    let samples = state.store.get_samples(WorkoutId(id)).await.map_err(BridgeError::Internal)?;
    Ok(Json(samples))
}

async fn export_fit(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response, ApiError> {
    let (workout, summary) = state
        .store
        .get_workout(WorkoutId(id))
        .await
        .map_err(BridgeError::Internal)?
        .ok_or(BridgeError::WorkoutNotFound)?;
    if workout.state != crate::model::WorkoutState::Ended {
        return Err(BridgeError::NotEnded.into());
    }
    let samples = state.store.get_samples(WorkoutId(id)).await.map_err(BridgeError::Internal)?;
    let summary = summary.unwrap_or_default();
    let bytes = crate::fit::encode(&workout, &summary, &samples);
    let filename = crate::fit::suggested_filename(&workout);

    Ok((
        StatusCode::OK,
        [
            (axum::http::header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (axum::http::header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response())
}

struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::NotFound | BridgeError::WorkoutNotFound => StatusCode::NOT_FOUND,
            BridgeError::Unsupported => StatusCode::BAD_REQUEST,
            BridgeError::Transport(_) => StatusCode::BAD_GATEWAY,
            BridgeError::AlreadyConnected
            | BridgeError::NotConnected
            | BridgeError::AlreadyActive
            | BridgeError::NotActive
            | BridgeError::NotEnded => StatusCode::CONFLICT,
            BridgeError::Store(_) | BridgeError::Encoding(_) | BridgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
