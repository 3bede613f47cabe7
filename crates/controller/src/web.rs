//! HTTP API: CRUD for zones, sequences and schedules, manual zone
//! control, weather, winter mode, daily-check settings, and the
//! WebSocket event feed.
//!
//! Handlers are boundary glue only: validation happens before any
//! mutation, control flows through the actuator/scheduler, and every
//! error surfaces as `{"error": reason}` JSON via `ControlError`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::actuator::{start_with_auto_off, ZoneActuator};
use crate::db::{Db, Schedule, Sequence, SequenceStep, SchedulePatch, Zone, ZonePatch};
use crate::error::ControlError;
use crate::notify::{Event, Notifier};
use crate::scheduler::{parse_time, Scheduler};
use crate::sequence;
use crate::timers::TimerRegistry;
use crate::weather::WeatherService;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub weather: Arc<WeatherService>,
    pub actuator: Arc<ZoneActuator>,
    pub timers: Arc<TimerRegistry>,
    pub scheduler: Scheduler,
    pub notifier: Notifier,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/zones", get(list_zones).post(create_zone))
        .route("/api/zones/stopall", post(stop_all_zones))
        .route("/api/zones/{id}", put(update_zone).delete(delete_zone))
        .route("/api/zones/{id}/start", post(start_zone))
        .route("/api/zones/{id}/stop", post(stop_zone))
        .route("/api/sequences", get(list_sequences).post(create_sequence))
        .route("/api/sequences/{id}", axum::routing::delete(delete_sequence))
        .route("/api/sequences/{id}/start", post(start_sequence))
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/{id}", put(update_schedule).delete(delete_schedule))
        .route("/api/weather/current", get(weather_current))
        .route("/api/weather/refresh", post(weather_refresh))
        .route("/api/winter-mode", get(winter_mode_get).post(winter_mode_set))
        .route(
            "/api/settings/daily-check",
            get(daily_check_get).post(daily_check_set),
        )
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------------

async fn list_zones(State(state): State<AppState>) -> Result<Json<Vec<Zone>>, ControlError> {
    Ok(Json(state.db.list_zones().await?))
}

#[derive(Debug, Deserialize)]
struct CreateZone {
    name: String,
    #[serde(default)]
    position: Option<i64>,
    relay_output: String,
    #[serde(default)]
    sensor_input: Option<String>,
}

async fn create_zone(
    State(state): State<AppState>,
    Json(body): Json<CreateZone>,
) -> Result<(StatusCode, Json<Zone>), ControlError> {
    if body.name.trim().is_empty() {
        return Err(ControlError::Validation("name is required".into()));
    }
    if body.relay_output.trim().is_empty() {
        return Err(ControlError::Validation("relay_output is required".into()));
    }

    let id = state
        .db
        .insert_zone(
            body.name.trim(),
            body.position.unwrap_or(0),
            body.relay_output.trim(),
            body.sensor_input.as_deref().unwrap_or(""),
        )
        .await?;
    let zone = state
        .db
        .get_zone(id)
        .await?
        .ok_or(ControlError::ZoneNotFound(id))?;
    Ok((StatusCode::CREATED, Json(zone)))
}

async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<ZonePatch>,
) -> Result<Json<Zone>, ControlError> {
    if patch.is_empty() {
        return Err(ControlError::Validation("no fields to update".into()));
    }
    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            return Err(ControlError::Validation("name must not be empty".into()));
        }
    }
    if let Some(d) = patch.default_duration {
        if d < 1 {
            return Err(ControlError::Validation(
                "default_duration must be at least 1 minute".into(),
            ));
        }
    }

    if state.db.update_zone(id, &patch).await? == 0 {
        return Err(ControlError::ZoneNotFound(id));
    }
    let zone = state
        .db
        .get_zone(id)
        .await?
        .ok_or(ControlError::ZoneNotFound(id))?;
    Ok(Json(zone))
}

async fn delete_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ControlError> {
    state.timers.cancel(id);
    if state.db.delete_zone(id).await? == 0 {
        return Err(ControlError::ZoneNotFound(id));
    }
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Default, Deserialize)]
struct StartZone {
    #[serde(default)]
    duration: Option<i64>,
}

async fn start_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<StartZone>>,
) -> Result<Json<Zone>, ControlError> {
    let requested = body.and_then(|Json(b)| b.duration);
    if let Some(d) = requested {
        if d < 1 {
            return Err(ControlError::Validation(
                "duration must be at least 1 minute".into(),
            ));
        }
    }

    let zone = state
        .db
        .get_zone(id)
        .await?
        .ok_or(ControlError::ZoneNotFound(id))?;
    let minutes = requested.unwrap_or(zone.default_duration);
    let zone = start_with_auto_off(&state.actuator, &state.timers, id, minutes).await?;
    Ok(Json(zone))
}

async fn stop_zone(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Zone>, ControlError> {
    state.timers.cancel(id);
    let zone = state.actuator.set_zone_state(id, false).await?;
    Ok(Json(zone))
}

async fn stop_all_zones(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ControlError> {
    state.timers.cancel_all();
    let stopped = state.actuator.stop_all().await?;
    Ok(Json(json!({ "stopped": stopped })))
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

/// Sequence with its steps decoded, the shape the API always returns.
#[derive(Debug, Serialize)]
struct SequenceOut {
    id: i64,
    name: String,
    steps: Vec<SequenceStep>,
    created_at: String,
}

fn sequence_out(seq: Sequence) -> Result<SequenceOut, ControlError> {
    let steps = seq.parsed_steps().map_err(ControlError::Internal)?;
    Ok(SequenceOut {
        id: seq.id,
        name: seq.name,
        steps,
        created_at: seq.created_at,
    })
}

async fn list_sequences(
    State(state): State<AppState>,
) -> Result<Json<Vec<SequenceOut>>, ControlError> {
    let rows = state.db.list_sequences().await?;
    let out = rows
        .into_iter()
        .map(sequence_out)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct CreateSequence {
    name: String,
    steps: Vec<SequenceStep>,
}

async fn create_sequence(
    State(state): State<AppState>,
    Json(body): Json<CreateSequence>,
) -> Result<(StatusCode, Json<SequenceOut>), ControlError> {
    if body.name.trim().is_empty() {
        return Err(ControlError::Validation("name is required".into()));
    }
    if body.steps.is_empty() {
        return Err(ControlError::Validation(
            "a sequence needs at least one step".into(),
        ));
    }
    for step in &body.steps {
        if step.duration < 1 {
            return Err(ControlError::Validation(format!(
                "step for zone {} has duration below 1 minute",
                step.zone_id
            )));
        }
    }

    let id = state.db.insert_sequence(body.name.trim(), &body.steps).await?;
    let seq = state
        .db
        .get_sequence(id)
        .await?
        .ok_or(ControlError::SequenceNotFound(id))?;
    Ok((StatusCode::CREATED, Json(sequence_out(seq)?)))
}

async fn delete_sequence(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ControlError> {
    if state.db.delete_sequence(id).await? == 0 {
        return Err(ControlError::SequenceNotFound(id));
    }
    Ok(Json(json!({ "deleted": id })))
}

async fn start_sequence(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ControlError> {
    if state.actuator.winter().is_enabled() {
        return Err(ControlError::WinterLock);
    }
    let seq = state
        .db
        .get_sequence(id)
        .await?
        .ok_or(ControlError::SequenceNotFound(id))?;
    let steps = seq.parsed_steps().map_err(ControlError::Internal)?;

    info!(sequence = id, name = %seq.name, "sequence started via api");
    tokio::spawn(sequence::run(Arc::clone(&state.actuator), steps));
    Ok(Json(json!({ "started": id })))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ScheduleOut {
    id: i64,
    name: Option<String>,
    sequence_id: i64,
    days: Vec<u8>,
    time: String,
    enabled: bool,
}

fn schedule_out(s: Schedule) -> Result<ScheduleOut, ControlError> {
    let days = s.parsed_days().map_err(ControlError::Internal)?;
    Ok(ScheduleOut {
        id: s.id,
        name: s.name,
        sequence_id: s.sequence_id,
        days,
        time: s.time,
        enabled: s.enabled,
    })
}

fn validate_days(days: &[u8]) -> Result<(), ControlError> {
    if days.is_empty() {
        return Err(ControlError::Validation("days must not be empty".into()));
    }
    if days.iter().any(|d| *d > 6) {
        return Err(ControlError::Validation(
            "days must be 0 (Sunday) through 6 (Saturday)".into(),
        ));
    }
    Ok(())
}

fn validate_clock(time: &str) -> Result<(), ControlError> {
    if parse_time(time).is_none() {
        return Err(ControlError::Validation(format!(
            "time '{time}' is not HH:MM"
        )));
    }
    Ok(())
}

async fn list_schedules(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduleOut>>, ControlError> {
    let rows = state.db.list_schedules().await?;
    let out = rows
        .into_iter()
        .map(schedule_out)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct CreateSchedule {
    #[serde(default)]
    name: Option<String>,
    sequence_id: i64,
    days: Vec<u8>,
    time: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<CreateSchedule>,
) -> Result<(StatusCode, Json<ScheduleOut>), ControlError> {
    validate_days(&body.days)?;
    validate_clock(&body.time)?;
    if state.db.get_sequence(body.sequence_id).await?.is_none() {
        return Err(ControlError::SequenceNotFound(body.sequence_id));
    }

    let id = state
        .db
        .insert_schedule(
            body.name.as_deref(),
            body.sequence_id,
            &body.days,
            &body.time,
            body.enabled,
        )
        .await?;
    state.scheduler.reload().await.map_err(ControlError::Internal)?;

    let schedule = state
        .db
        .get_schedule(id)
        .await?
        .ok_or(ControlError::ScheduleNotFound(id))?;
    Ok((StatusCode::CREATED, Json(schedule_out(schedule)?)))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<SchedulePatch>,
) -> Result<Json<ScheduleOut>, ControlError> {
    if patch.is_empty() {
        return Err(ControlError::Validation("no fields to update".into()));
    }
    if let Some(days) = &patch.days {
        validate_days(days)?;
    }
    if let Some(time) = &patch.time {
        validate_clock(time)?;
    }
    if let Some(seq_id) = patch.sequence_id {
        if state.db.get_sequence(seq_id).await?.is_none() {
            return Err(ControlError::SequenceNotFound(seq_id));
        }
    }

    if state.db.update_schedule(id, &patch).await? == 0 {
        return Err(ControlError::ScheduleNotFound(id));
    }
    state.scheduler.reload().await.map_err(ControlError::Internal)?;

    let schedule = state
        .db
        .get_schedule(id)
        .await?
        .ok_or(ControlError::ScheduleNotFound(id))?;
    Ok(Json(schedule_out(schedule)?))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ControlError> {
    if state.db.delete_schedule(id).await? == 0 {
        return Err(ControlError::ScheduleNotFound(id));
    }
    state.scheduler.reload().await.map_err(ControlError::Internal)?;
    Ok(Json(json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

async fn weather_current(State(state): State<AppState>) -> impl IntoResponse {
    match state.weather.current().await {
        Some(snap) => Json(snap).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "weather data unavailable" })),
        )
            .into_response(),
    }
}

async fn weather_refresh(State(state): State<AppState>) -> impl IntoResponse {
    match state.weather.refresh().await {
        Some(snap) => Json(snap).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "weather data unavailable" })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Winter mode
// ---------------------------------------------------------------------------

async fn winter_mode_get(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.actuator.winter().state())
}

#[derive(Debug, Deserialize)]
struct SetWinterMode {
    enabled: bool,
}

async fn winter_mode_set(
    State(state): State<AppState>,
    Json(body): Json<SetWinterMode>,
) -> Result<impl IntoResponse, ControlError> {
    let st = state.actuator.winter().set(body.enabled);

    // Mirror to settings so the flag survives restarts.
    state
        .db
        .set_setting("winter_mode_enabled", if st.enabled { "1" } else { "0" })
        .await
        .map_err(ControlError::Internal)?;
    let stamp = st
        .activated_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    state
        .db
        .set_setting("winter_mode_activated_at", &stamp)
        .await
        .map_err(ControlError::Internal)?;

    info!(enabled = st.enabled, "winter mode changed");
    Ok(Json(st))
}

/// Settings-table values back into the in-process flag at startup.
pub async fn restore_winter_mode(db: &Db, actuator: &ZoneActuator) -> anyhow::Result<()> {
    let enabled = matches!(
        db.get_setting("winter_mode_enabled").await?,
        Some(v) if v == "1"
    );
    let activated_at = db
        .get_setting("winter_mode_activated_at")
        .await?
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc));
    actuator.winter().restore(enabled, activated_at);
    if enabled {
        info!("winter mode restored from settings");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Daily check settings
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct DailyCheckSettings {
    enabled: bool,
    #[serde(default)]
    time: Option<String>,
}

async fn daily_check_get(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let enabled = matches!(
        state.db.get_setting("daily_check_enabled").await.map_err(ControlError::Internal)?,
        Some(v) if v == "1" || v.eq_ignore_ascii_case("true")
    );
    let time = state
        .db
        .get_setting("daily_check_time")
        .await
        .map_err(ControlError::Internal)?
        .unwrap_or_else(|| "04:00".to_string());
    Ok(Json(json!({ "enabled": enabled, "time": time })))
}

async fn daily_check_set(
    State(state): State<AppState>,
    Json(body): Json<DailyCheckSettings>,
) -> Result<Json<serde_json::Value>, ControlError> {
    if let Some(time) = &body.time {
        validate_clock(time)?;
    }

    state
        .db
        .set_setting("daily_check_enabled", if body.enabled { "1" } else { "0" })
        .await
        .map_err(ControlError::Internal)?;
    if let Some(time) = &body.time {
        state
            .db
            .set_setting("daily_check_time", time)
            .await
            .map_err(ControlError::Internal)?;
    }
    state.scheduler.reschedule_daily_check().await;

    daily_check_get(State(state)).await
}

// ---------------------------------------------------------------------------
// WebSocket event feed
// ---------------------------------------------------------------------------

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.notifier.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(mut socket: WebSocket, mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    return; // client gone
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "websocket client lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;
    info!(%addr, "http api listening");
    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::WinterMode;
    use crate::config::WeatherConfig;
    use crate::relay::{MockRelay, RelayBackend};
    use axum::body::Body;
    use axum::http::{header, Request, Response};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.init_schema().await.unwrap();
        let weather = Arc::new(WeatherService::new(
            WeatherConfig {
                enabled: false,
                ..Default::default()
            },
            db.clone(),
        ));
        let notifier = Notifier::new();
        let actuator = ZoneActuator::new(
            db.clone(),
            RelayBackend::Mock(MockRelay::new()),
            notifier.clone(),
            WinterMode::default(),
            None,
        );
        let timers = TimerRegistry::new();
        let scheduler = Scheduler::new(
            db.clone(),
            Arc::clone(&weather),
            Arc::clone(&actuator),
            Arc::clone(&timers),
        );
        AppState {
            db,
            weather,
            actuator,
            timers,
            scheduler,
            notifier,
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(resp: Response<Body>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -- Zones --------------------------------------------------------------

    #[tokio::test]
    async fn zones_list_returns_seeded_layout() {
        let state = test_state().await;
        let app = router(state);

        let resp = send(&app, "GET", "/api/zones", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 12);
        assert_eq!(body[0]["name"], "Zone 1");
    }

    #[tokio::test]
    async fn zone_create_requires_name_and_output() {
        let state = test_state().await;
        let app = router(state);

        let resp = send(
            &app,
            "POST",
            "/api/zones",
            Some(json!({ "name": " ", "relay_output": "V13" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            "POST",
            "/api/zones",
            Some(json!({ "name": "Herbs", "relay_output": "V13" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["name"], "Herbs");
    }

    #[tokio::test]
    async fn zone_update_is_partial() {
        let state = test_state().await;
        let app = router(state.clone());

        let resp = send(
            &app,
            "PUT",
            "/api/zones/1",
            Some(json!({ "moisture_threshold": 25 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["moisture_threshold"], 25);
        assert_eq!(body["moisture_optimal"], 60);

        let resp = send(&app, "PUT", "/api/zones/1", Some(json!({}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn zone_start_and_stop_roundtrip() {
        let state = test_state().await;
        let app = router(state.clone());

        let resp = send(&app, "POST", "/api/zones/3/start", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.db.get_zone(3).await.unwrap().unwrap().is_active);
        assert!(state.timers.is_armed(3));

        let resp = send(&app, "POST", "/api/zones/3/stop", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!state.db.get_zone(3).await.unwrap().unwrap().is_active);
        assert!(!state.timers.is_armed(3));
    }

    #[tokio::test]
    async fn zone_start_with_zero_duration_rejected() {
        let state = test_state().await;
        let app = router(state);

        let resp = send(
            &app,
            "POST",
            "/api/zones/3/start",
            Some(json!({ "duration": 0 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn concurrent_zone_start_conflicts_with_409() {
        let state = test_state().await;
        let app = router(state);

        send(&app, "POST", "/api/zones/1/start", None).await;
        let resp = send(&app, "POST", "/api/zones/2/start", None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = json_body(resp).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("already running"));
    }

    #[tokio::test]
    async fn unknown_zone_is_404() {
        let state = test_state().await;
        let app = router(state);
        let resp = send(&app, "POST", "/api/zones/99/start", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stopall_clears_active_zone_and_timers() {
        let state = test_state().await;
        let app = router(state.clone());

        send(&app, "POST", "/api/zones/5/start", None).await;
        let resp = send(&app, "POST", "/api/zones/stopall", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["stopped"], 1);
        assert!(state.timers.is_empty());
        assert!(state.db.active_zone_ids().await.unwrap().is_empty());
    }

    // -- Winter mode --------------------------------------------------------

    #[tokio::test]
    async fn winter_mode_blocks_start_and_persists() {
        let state = test_state().await;
        let app = router(state.clone());

        let resp = send(
            &app,
            "POST",
            "/api/winter-mode",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(&app, "POST", "/api/zones/1/start", None).await;
        assert_eq!(resp.status(), StatusCode::LOCKED);

        assert_eq!(
            state.db.get_setting("winter_mode_enabled").await.unwrap(),
            Some("1".into())
        );

        // Restore round-trip.
        state.actuator.winter().restore(false, None);
        restore_winter_mode(&state.db, &state.actuator).await.unwrap();
        assert!(state.actuator.winter().is_enabled());
    }

    // -- Sequences ----------------------------------------------------------

    #[tokio::test]
    async fn sequence_create_validates_steps() {
        let state = test_state().await;
        let app = router(state);

        let resp = send(
            &app,
            "POST",
            "/api/sequences",
            Some(json!({ "name": "x", "steps": [] })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            "POST",
            "/api/sequences",
            Some(json!({ "name": "x", "steps": [{ "zone_id": 1, "duration": 0 }] })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            "POST",
            "/api/sequences",
            Some(json!({ "name": "x", "steps": [{ "zone_id": 1, "duration": 5 }] })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["steps"][0]["duration"], 5);
    }

    #[tokio::test]
    async fn sequence_start_is_fire_and_forget() {
        let state = test_state().await;
        let app = router(state.clone());

        let resp = send(
            &app,
            "POST",
            "/api/sequences",
            Some(json!({ "name": "run", "steps": [{ "zone_id": 2, "duration": 1 }] })),
        )
        .await;
        let id = json_body(resp).await["id"].as_i64().unwrap();

        let resp = send(&app, "POST", &format!("/api/sequences/{id}/start"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // The spawned run has started its first step.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(state.db.get_zone(2).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn sequence_start_missing_is_404() {
        let state = test_state().await;
        let app = router(state);
        let resp = send(&app, "POST", "/api/sequences/77/start", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -- Schedules ----------------------------------------------------------

    async fn seed_sequence(state: &AppState) -> i64 {
        state
            .db
            .insert_sequence(
                "seq",
                &[SequenceStep {
                    zone_id: 1,
                    duration: 1,
                }],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn schedule_create_registers_trigger() {
        let state = test_state().await;
        let seq = seed_sequence(&state).await;
        let app = router(state.clone());

        let resp = send(
            &app,
            "POST",
            "/api/schedules",
            Some(json!({ "sequence_id": seq, "days": [1, 3, 5], "time": "06:30" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(state.scheduler.trigger_count(), 1);
    }

    #[tokio::test]
    async fn schedule_create_rejects_bad_input() {
        let state = test_state().await;
        let seq = seed_sequence(&state).await;
        let app = router(state);

        for (days, time) in [
            (json!([]), "06:30"),
            (json!([7]), "06:30"),
            (json!([1]), "25:00"),
            (json!([1]), "morning"),
        ] {
            let resp = send(
                &app,
                "POST",
                "/api/schedules",
                Some(json!({ "sequence_id": seq, "days": days, "time": time })),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "days/time case");
        }

        let resp = send(
            &app,
            "POST",
            "/api/schedules",
            Some(json!({ "sequence_id": 999, "days": [1], "time": "06:30" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_delete_reloads_triggers() {
        let state = test_state().await;
        let seq = seed_sequence(&state).await;
        let app = router(state.clone());

        let resp = send(
            &app,
            "POST",
            "/api/schedules",
            Some(json!({ "sequence_id": seq, "days": [2], "time": "07:00" })),
        )
        .await;
        let id = json_body(resp).await["id"].as_i64().unwrap();
        assert_eq!(state.scheduler.trigger_count(), 1);

        let resp = send(&app, "DELETE", &format!("/api/schedules/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.scheduler.trigger_count(), 0);
    }

    #[tokio::test]
    async fn schedule_disable_via_update_drops_trigger() {
        let state = test_state().await;
        let seq = seed_sequence(&state).await;
        let app = router(state.clone());

        let resp = send(
            &app,
            "POST",
            "/api/schedules",
            Some(json!({ "sequence_id": seq, "days": [2], "time": "07:00" })),
        )
        .await;
        let id = json_body(resp).await["id"].as_i64().unwrap();

        let resp = send(
            &app,
            "PUT",
            &format!("/api/schedules/{id}"),
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.scheduler.trigger_count(), 0);
    }

    // -- Weather ------------------------------------------------------------

    #[tokio::test]
    async fn weather_unavailable_is_503() {
        let state = test_state().await;
        let app = router(state);

        let resp = send(&app, "GET", "/api/weather/current", None).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    // -- Daily check settings ------------------------------------------------

    #[tokio::test]
    async fn daily_check_settings_roundtrip() {
        let state = test_state().await;
        let app = router(state.clone());

        let resp = send(&app, "GET", "/api/settings/daily-check", None).await;
        let body = json_body(resp).await;
        assert_eq!(body["enabled"], false);
        assert_eq!(body["time"], "04:00");

        let resp = send(
            &app,
            "POST",
            "/api/settings/daily-check",
            Some(json!({ "enabled": true, "time": "05:30" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["enabled"], true);
        assert_eq!(body["time"], "05:30");

        let resp = send(
            &app,
            "POST",
            "/api/settings/daily-check",
            Some(json!({ "enabled": true, "time": "24:00" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
