/**
 * API REST BREEZE - Façade HTTP du registre pour le dashboard
 *
 * ROUTES :
 * - GET  /health                          → "ok"
 * - GET  /system/health                   → uptime, compteurs devices, état du bus
 * - GET  /devices                         → liste triée par id
 * - GET  /devices/{id}                    → détail (404 si inconnu)
 * - POST /devices/{id}/command/{name}     → publie la commande (corps JSON optionnel)
 * - POST /devices/{id}/toggle             → set_state inverse de l'état connu
 *
 * Aucune logique ici : tout passe par DeviceRegistry et CommandDispatcher.
 */

use crate::bus::MessageBus;
use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::health::{kernel_health, KernelHealth};
use crate::models::DeviceRecord;
use crate::registry::DeviceRegistry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub record: DeviceRecord,
    /// Âge du dernier message, pour l'affichage ; aucun passage automatique offline
    pub seen_seconds_ago: i64,
}

fn to_view(record: DeviceRecord) -> DeviceView {
    let age = OffsetDateTime::now_utc() - record.last_seen;
    DeviceView {
        seen_seconds_ago: age.whole_seconds().max(0),
        record,
    }
}

#[derive(Clone)]
pub struct AppState<B> {
    pub registry: DeviceRegistry,
    pub dispatcher: CommandDispatcher<B>,
    pub started: Instant,
}

impl<B: MessageBus> AppState<B> {
    pub fn new(registry: DeviceRegistry, dispatcher: CommandDispatcher<B>) -> Self {
        Self { registry, dispatcher, started: Instant::now() }
    }
}

pub fn build_router<B: MessageBus>(app_state: AppState<B>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health::<B>))
        .route("/devices", get(list_devices::<B>))
        .route("/devices/{id}", get(get_device::<B>))
        .route("/devices/{id}/command/{name}", post(send_command::<B>))
        .route("/devices/{id}/toggle", post(toggle_device::<B>))
        .with_state(app_state)
}

// GET /devices
pub async fn list_devices<B: MessageBus>(State(app): State<AppState<B>>) -> Json<Vec<DeviceView>> {
    Json(app.registry.list().into_iter().map(to_view).collect())
}

// GET /devices/{id}
pub async fn get_device<B: MessageBus>(
    State(app): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    app.registry
        .get(&id)
        .map(|record| Json(to_view(record)))
        .ok_or(StatusCode::NOT_FOUND)
}

// POST /devices/{id}/command/{name}
pub async fn send_command<B: MessageBus>(
    State(app): State<AppState<B>>,
    Path((id, name)): Path<(String, String)>,
    body: Option<Json<serde_json::Value>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let payload = body.map(|Json(v)| v).unwrap_or_else(|| serde_json::json!({}));
    let result = app.dispatcher.try_send_command(&id, &name, payload).await;
    dispatch_response(&id, &name, result.map(|_| serde_json::Value::Null))
}

// POST /devices/{id}/toggle
pub async fn toggle_device<B: MessageBus>(
    State(app): State<AppState<B>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = app.dispatcher.toggle(&id).await;
    dispatch_response(&id, "toggle", result.map(|state| serde_json::json!(state)))
}

fn dispatch_response(
    id: &str,
    command: &str,
    result: Result<serde_json::Value, DispatchError>,
) -> (StatusCode, Json<serde_json::Value>) {
    let sent_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    match result {
        Ok(requested) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "ok": true, "device": id, "command": command, "requested": requested, "sent_at": sent_at
            })),
        ),
        Err(e) => {
            let code = match e {
                DispatchError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                DispatchError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Serialization(_) | DispatchError::Bus(_) => StatusCode::BAD_GATEWAY,
            };
            (code, Json(serde_json::json!({ "ok": false, "device": id, "command": command, "error": e.to_string() })))
        }
    }
}

// GET /system/health
pub async fn get_system_health<B: MessageBus>(State(app): State<AppState<B>>) -> Json<KernelHealth> {
    Json(kernel_health(app.started, &app.registry, app.dispatcher.bus().health()))
}
