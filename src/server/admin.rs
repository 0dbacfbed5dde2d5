// =============================================================================
// Admin Settings API — authenticated runtime reconfiguration
// =============================================================================
//
// GET returns the structured settings view (stored values merged over
// environment defaults). POST validates the payload in full, writes the
// present fields through the settings store (bumping the broker version so
// every service refetches), and returns the updated view.
// =============================================================================

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, info};

use crate::db::settings_store::SettingsMap;
use crate::server::auth::require_admin;
use crate::server::state::SharedState;
use crate::server::thresholds::thresholds_view;
use crate::server::validators::AdminSettingsRequest;
use crate::settings::Settings;
use crate::thresholds::{notifications_from_map, thresholds_from_map};
use crate::types::SettingsKey;

/// Structured response assembled from the flat settings map.
fn settings_view(map: &SettingsMap, env: &Settings) -> serde_json::Value {
    let thresholds = thresholds_from_map(map, &env.thresholds);
    let notifications = notifications_from_map(map, &env.notifications);
    let retention = map
        .get(&SettingsKey::RetentionDays)
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(env.retention_days);

    serde_json::json!({
        "thresholds": thresholds_view(&thresholds),
        "notifications": {
            "enabled": notifications.enabled,
            "backends": notifications.backends,
        },
        "cleanup": {
            "retentionDays": retention,
        },
    })
}

fn db_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": "Database unavailable"})),
    )
        .into_response()
}

/// `GET /api/admin/settings`
pub async fn get_settings(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state, &headers).await {
        return response;
    }

    match state.store.get_all().await {
        Ok(map) => Json(settings_view(&map, &state.env)).into_response(),
        Err(e) => {
            error!(error = %e, "admin: settings fetch failed");
            db_unavailable()
        }
    }
}

/// `POST /api/admin/settings`
pub async fn update_settings(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<AdminSettingsRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers).await {
        return response;
    }

    let Json(request) = match body {
        Ok(json) => json,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"errors": [rejection.body_text()]})),
            )
                .into_response();
        }
    };

    let errors = request.validate(&state.env);
    if !errors.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"errors": errors})),
        )
            .into_response();
    }

    let updates = request.to_updates();
    let map = if updates.is_empty() {
        state.store.get_all().await
    } else {
        let keys: Vec<String> = updates.keys().map(|k| k.as_str()).collect();
        let result = state.store.set_batch(updates).await;
        if result.is_ok() {
            info!(keys = ?keys, "admin settings updated");
        }
        result
    };

    match map {
        Ok(map) => Json(settings_view(&map, &state.env)).into_response(),
        Err(e) => {
            error!(error = %e, "admin: settings write failed");
            db_unavailable()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
