// =============================================================================
// Dashboard API — initial snapshot for the SPA
// =============================================================================

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::db::queries::{
    bucket_size_sec, dht_chart, dht_latest, dht_stats, pico_chart, pico_latest, DhtRow, DhtStats,
    PicoRow,
};
use crate::server::state::SharedState;
use crate::server::validators::parse_hours;

#[derive(Serialize)]
struct DashboardResponse {
    hours: i64,
    data: Vec<DhtRow>,
    stats: DhtStats,
    latest: Option<DhtRow>,
    pico_data: Vec<PicoRow>,
    pico_latest: Vec<PicoRow>,
}

fn db_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": "Database unavailable"})),
    )
        .into_response()
}

/// `GET /api/dashboard?hours=N` — readings in the window, aggregate stats
/// and the latest sample for both sensor families.
pub async fn get_dashboard(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (hours, from_time) = match parse_hours(params.get("hours").map(String::as_str)) {
        Ok(parsed) => parsed,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            )
                .into_response();
        }
    };
    let bucket = bucket_size_sec(hours * 3600);

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "dashboard: failed to acquire connection");
            return db_unavailable();
        }
    };

    let response = async {
        Ok::<_, crate::db::DbError>(DashboardResponse {
            hours,
            data: dht_chart(&mut conn, from_time, bucket).await?,
            stats: dht_stats(&mut conn, from_time).await?,
            latest: dht_latest(&mut conn).await?,
            pico_data: pico_chart(&mut conn, from_time, bucket).await?,
            pico_latest: pico_latest(&mut conn).await?,
        })
    }
    .await;

    match response {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            error!(error = %e, "dashboard: query failed");
            db_unavailable()
        }
    }
}
