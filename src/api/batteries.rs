//! Battery control endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::{
    controller::BatteryStatus,
    domain::{BatteryConfig, BatteryReconfig},
    simulation::{EnvironmentalScenario, ScenarioInfo},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    batteries: usize,
    subscribers: usize,
}

/// GET /health
pub async fn health(State(st): State<AppState>) -> impl IntoResponse {
    let status = if st.manager.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status,
        timestamp: chrono::Utc::now(),
        batteries: st.manager.len(),
        subscribers: st.manager.hub().subscriber_count(),
    })
}

/// GET /scenarios
pub async fn list_scenarios() -> Json<Vec<ScenarioInfo>> {
    Json(EnvironmentalScenario::catalogue())
}

/// GET /batteries
pub async fn list_batteries(State(st): State<AppState>) -> Json<Vec<BatteryStatus>> {
    Json(st.manager.list_statuses())
}

/// POST /batteries
pub async fn create_battery(
    State(st): State<AppState>,
    Json(config): Json<BatteryConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let id = st.manager.create(config)?;
    Ok((StatusCode::CREATED, Json(st.manager.status(&id)?)))
}

/// GET /batteries/:id
pub async fn get_battery(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatteryStatus>, ApiError> {
    Ok(Json(st.manager.status(&id)?))
}

/// DELETE /batteries/:id
pub async fn remove_battery(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    st.manager.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /batteries/:id/start
pub async fn start_battery(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatteryStatus>, ApiError> {
    st.manager.start(&id)?;
    Ok(Json(st.manager.status(&id)?))
}

/// POST /batteries/:id/pause
pub async fn pause_battery(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatteryStatus>, ApiError> {
    st.manager.pause(&id)?;
    Ok(Json(st.manager.status(&id)?))
}

/// POST /batteries/:id/stop
pub async fn stop_battery(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatteryStatus>, ApiError> {
    st.manager.stop(&id)?;
    Ok(Json(st.manager.status(&id)?))
}

/// PUT /batteries/:id/config
pub async fn reconfigure_battery(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<BatteryReconfig>,
) -> Result<Json<BatteryConfig>, ApiError> {
    Ok(Json(st.manager.reconfigure(&id, &patch)?))
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRequest {
    pub scenario: EnvironmentalScenario,
    /// Pins ambient temperature (°C)
    #[serde(default)]
    pub ambient_temp_c: Option<f64>,
}

fn check_ambient(ambient_temp_c: Option<f64>) -> Result<(), ApiError> {
    match ambient_temp_c {
        Some(ambient) if !(-10.0..=60.0).contains(&ambient) => Err(ApiError::ValidationError(
            format!("ambient_temp_c must be within -10..=60, got {ambient}"),
        )),
        _ => Ok(()),
    }
}

/// An explicit but empty target list is almost certainly a client bug.
fn check_targets(battery_ids: Option<&[String]>) -> Result<(), ApiError> {
    match battery_ids {
        Some([]) => Err(ApiError::BadRequest(
            "battery_ids must not be empty; omit it to target every battery".into(),
        )),
        _ => Ok(()),
    }
}

/// POST /batteries/:id/scenario
pub async fn apply_scenario(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScenarioRequest>,
) -> Result<Json<BatteryStatus>, ApiError> {
    check_ambient(req.ambient_temp_c)?;
    st.manager
        .apply_scenario(&id, req.scenario, req.ambient_temp_c)?;
    Ok(Json(st.manager.status(&id)?))
}

/// DELETE /batteries/:id/scenario
pub async fn clear_scenario(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatteryStatus>, ApiError> {
    st.manager.clear_scenario(&id)?;
    Ok(Json(st.manager.status(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct FleetScenarioRequest {
    pub scenario: EnvironmentalScenario,
    #[serde(default)]
    pub ambient_temp_c: Option<f64>,
    /// Omit to target every battery that is not stopped
    #[serde(default)]
    pub battery_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetClearRequest {
    #[serde(default)]
    pub battery_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct FleetResponse {
    pub batteries: Vec<String>,
}

/// POST /scenario
pub async fn apply_fleet_scenario(
    State(st): State<AppState>,
    Json(req): Json<FleetScenarioRequest>,
) -> Result<Json<FleetResponse>, ApiError> {
    check_ambient(req.ambient_temp_c)?;
    check_targets(req.battery_ids.as_deref())?;
    let batteries = st.manager.apply_scenario_fleet(
        req.battery_ids.as_deref(),
        req.scenario,
        req.ambient_temp_c,
    )?;
    Ok(Json(FleetResponse { batteries }))
}

/// POST /scenario/clear
pub async fn clear_fleet_scenario(
    State(st): State<AppState>,
    body: Option<Json<FleetClearRequest>>,
) -> Result<Json<FleetResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    check_targets(req.battery_ids.as_deref())?;
    let batteries = st.manager.clear_scenario_fleet(req.battery_ids.as_deref())?;
    Ok(Json(FleetResponse { batteries }))
}
