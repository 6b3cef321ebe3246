//! JSON API over the controller: status, manual pump control, mode switch
//! and fertilizer pump toggles.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::fertilizer::FertilizerMonitor;
use crate::pump::{PumpController, PumpState, WateringSession};
use crate::scheduler::{IrrigationScheduler, Mode};
use crate::state::{EventKind, FertilizerState, SharedState, SystemEvent};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub pump: PumpController,
    pub scheduler: IrrigationScheduler,
    pub fertilizer: FertilizerMonitor,
    pub default_duration: NonZeroU32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub enum ApiError {
    Controller(ControllerError),
    BadRequest(String),
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self::Controller(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Controller(err) => {
                let status = match &err {
                    ControllerError::StoreUnavailable(_) => StatusCode::BAD_GATEWAY,
                    ControllerError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
                    ControllerError::ControllerConflict(_) => StatusCode::CONFLICT,
                    ControllerError::UnknownFertilizer(_) => StatusCode::NOT_FOUND,
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

/// Record a failed manual action for the UI before handing the error back.
async fn manual<T>(
    state: &AppState,
    action: &str,
    result: Result<T, ControllerError>,
) -> Result<T, ApiError> {
    match result {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(action, "manual action failed: {e}");
            let mut st = state.shared.write().await;
            st.notify(EventKind::ManualError, format!("{action} failed: {e}"));
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/pump/start", post(api_pump_start))
        .route("/api/pump/stop", post(api_pump_stop))
        .route("/api/mode", put(api_set_mode))
        .route("/api/refresh", post(api_refresh))
        .route("/api/fertilizer/{id}/pump/toggle", post(api_fertilizer_toggle))
        .with_state(state)
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    store_reachable: bool,
    pump: PumpState,
    session: Option<WateringSession>,
    mode: Mode,
    schedule: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    next_trigger: Option<OffsetDateTime>,
    next_trigger_display: Option<String>,
    fertilizer: BTreeMap<String, FertilizerState>,
    events: Vec<SystemEvent>,
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let pump = state.pump.state().await;
    let session = state.pump.session().await;
    let mode = state.scheduler.mode().await;
    let schedule = state
        .scheduler
        .schedule()
        .await
        .targets()
        .iter()
        .map(ToString::to_string)
        .collect();
    let next_trigger = state.scheduler.next_trigger().await;
    let next_trigger_display = state.scheduler.next_trigger_display().await;

    let st = state.shared.read().await;
    Json(StatusResponse {
        uptime_secs: st.started_at.elapsed().as_secs(),
        store_reachable: st.store_reachable,
        pump,
        session,
        mode,
        schedule,
        next_trigger,
        next_trigger_display,
        fertilizer: st.fertilizer.clone(),
        events: st.recent_events(),
    })
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct StartRequest {
    duration_min: Option<u32>,
}

#[derive(Serialize)]
struct PumpResponse {
    pump: PumpState,
}

async fn api_pump_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<PumpResponse>, ApiError> {
    let duration = match req.duration_min {
        None => state.default_duration,
        Some(n) => NonZeroU32::new(n)
            .ok_or_else(|| ApiError::BadRequest("duration_min must be at least 1".into()))?,
    };

    let result = state.pump.start(duration).await;
    manual(&state, "manual start", result).await?;
    info!(duration_min = duration.get(), "manual watering started");
    Ok(Json(PumpResponse {
        pump: state.pump.state().await,
    }))
}

async fn api_pump_stop(State(state): State<AppState>) -> Result<Json<PumpResponse>, ApiError> {
    let result = state.pump.stop().await;
    manual(&state, "manual stop", result).await?;
    Ok(Json(PumpResponse {
        pump: state.pump.state().await,
    }))
}

#[derive(Deserialize, Serialize)]
struct ModeBody {
    mode: Mode,
}

async fn api_set_mode(
    State(state): State<AppState>,
    Json(req): Json<ModeBody>,
) -> Result<Json<ModeBody>, ApiError> {
    let result = state.scheduler.set_mode(req.mode).await;
    manual(&state, "mode change", result).await?;
    Ok(Json(ModeBody {
        mode: state.scheduler.mode().await,
    }))
}

/// Fertilizer channels are polled even when the irrigation nodes are
/// unreadable; the irrigation error is reported afterwards.
async fn api_refresh(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let result = state.scheduler.refresh().await;
    state.fertilizer.poll_once().await;
    manual(&state, "refresh", result).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ToggleResponse {
    id: String,
    pump_on: bool,
}

async fn api_fertilizer_toggle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let result = state.fertilizer.toggle_pump(&id).await;
    let pump_on = manual(&state, "fertilizer pump toggle", result).await?;
    Ok(Json(ToggleResponse { id, pump_on }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
