// =============================================================================
// Thresholds API — current effective thresholds
// =============================================================================

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::server::state::SharedState;
use crate::settings::ThresholdSettings;
use crate::thresholds::effective_thresholds;
use crate::types::PLANT_IDS;

/// Structured view shared with the admin API.
pub fn thresholds_view(thresholds: &ThresholdSettings) -> serde_json::Value {
    let moisture: serde_json::Map<String, serde_json::Value> = PLANT_IDS
        .iter()
        .map(|&plant_id| {
            (
                plant_id.to_string(),
                serde_json::json!(thresholds.moisture_threshold(plant_id)),
            )
        })
        .collect();

    serde_json::json!({
        "temperature": {
            "min": thresholds.min_temperature,
            "max": thresholds.max_temperature,
        },
        "humidity": {
            "min": thresholds.min_humidity,
            "max": thresholds.max_humidity,
        },
        "moisture": moisture,
    })
}

/// `GET /api/thresholds`
pub async fn get_thresholds(State(state): State<SharedState>) -> Response {
    match effective_thresholds(&state.store, &state.env).await {
        Ok(thresholds) => Json(thresholds_view(&thresholds)).into_response(),
        Err(e) => {
            error!(error = %e, "thresholds: settings fetch failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Database unavailable"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn view_contains_all_axes_and_plants() {
        let thresholds = ThresholdSettings {
            max_temperature: 25,
            min_temperature: 18,
            max_humidity: 65,
            min_humidity: 40,
            min_moisture: 30,
            plant_moisture: HashMap::from([(1, 30), (2, 45), (3, 30)]),
        };
        let view = thresholds_view(&thresholds);
        assert_eq!(view["temperature"]["min"], 18);
        assert_eq!(view["humidity"]["max"], 65);
        assert_eq!(view["moisture"]["2"], 45);
        assert_eq!(view["moisture"]["1"], 30);
    }
}
