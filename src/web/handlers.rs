//! HTTP request handlers.

use std::convert::Infallible;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde::Deserialize;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

use super::AppState;
use crate::db::{AlertEvent, AlertRule, Device, TestKind};
use crate::events::Event;
use crate::notify::NotificationSettingsUpdate;
use crate::scheduler::parse_duration;

// --- Devices ---

pub async fn get_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_devices() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

pub async fn create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> impl IntoResponse {
    if req.name.is_empty() || req.hostname.is_empty() {
        return (StatusCode::BAD_REQUEST, "name and hostname are required").into_response();
    }

    let mut device = Device {
        id: 0,
        name: req.name,
        hostname: req.hostname,
        ip: req.ip,
        ssh_user: req.ssh_user,
        ssh_port: req.ssh_port,
    };
    match state.store.add_device(&mut device) {
        Ok(_) => Json(device).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_device(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// --- Schedules ---

pub async fn get_schedules(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_schedules() {
        Ok(schedules) => Json(schedules).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    #[serde(rename = "type")]
    pub kind: TestKind,
    pub interval: String,
    pub enabled: bool,
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Json(req): Json<UpdateScheduleRequest>,
) -> impl IntoResponse {
    if let Err(e) = parse_duration(&req.interval) {
        return (StatusCode::BAD_REQUEST, format!("invalid interval: {}", e)).into_response();
    }

    match state.store.upsert_schedule(req.kind, &req.interval, req.enabled) {
        Ok(()) => {
            state.scheduler.clone().reload();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_schedule_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.schedule_info())
}

// --- Results ---

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).clamp(1, 10_000);
    match state.store.history(limit) {
        Ok(results) => Json(results).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_latest(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.latest() {
        Ok(results) => Json(results).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// --- Manual triggers & queue ---

pub async fn run_ping(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.trigger_ping_all();
    StatusCode::ACCEPTED
}

pub async fn run_speed(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.trigger_speed_all();
    StatusCode::ACCEPTED
}

pub async fn get_queue_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.queue_status())
}

// --- Alert rules ---

pub async fn get_alert_rules(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_alert_rules() {
        Ok(rules) => Json(rules).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn validate_rule(rule: &AlertRule) -> Result<(), &'static str> {
    if rule.name.is_empty() {
        return Err("rule name is required");
    }
    if rule.event_type != AlertEvent::TestError && rule.threshold.is_none() {
        return Err("threshold is required for this event type");
    }
    Ok(())
}

pub async fn create_alert_rule(
    State(state): State<AppState>,
    Json(mut rule): Json<AlertRule>,
) -> impl IntoResponse {
    if let Err(e) = validate_rule(&rule) {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    match state.store.create_alert_rule(&mut rule) {
        Ok(_) => Json(rule).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn update_alert_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut rule): Json<AlertRule>,
) -> impl IntoResponse {
    if let Err(e) = validate_rule(&rule) {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    rule.id = id;
    match state.store.update_alert_rule(&rule) {
        Ok(()) => Json(rule).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn delete_alert_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_alert_rule(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// --- Notification settings ---

pub async fn get_notification_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.notifier.settings())
}

pub async fn update_notification_settings(
    State(state): State<AppState>,
    Json(update): Json<NotificationSettingsUpdate>,
) -> impl IntoResponse {
    match state.notifier.update_settings(update) {
        Ok(()) => Json(state.notifier.settings()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// --- Live events ---

/// Server-sent events: the bus relayed as line-delimited JSON payloads.
pub async fn sse_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| match event {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(SseEvent::default().data(data))),
        // A lagged subscriber just skips what it missed.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// WebSocket: same payloads as SSE, plus an initial schedule snapshot.
pub async fn ws_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_loop(socket, state))
}

async fn ws_loop(mut socket: WebSocket, state: AppState) {
    let snapshot = Event::Schedule(state.scheduler.schedule_info());
    if let Ok(text) = serde_json::to_string(&snapshot) {
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    // Forward-only: a failed send is how a disconnected client is noticed.
    let mut rx = state.bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
