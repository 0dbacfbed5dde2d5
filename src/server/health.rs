// =============================================================================
// Health Endpoint — per-subsystem status
// =============================================================================
//
// 200 iff the database and the broker are both reachable; 503 otherwise.
// Sensor freshness (latest reading per family) rides along for operators
// but does not affect the status code: a silent sensor is a greenhouse
// problem, not a server problem.
// =============================================================================

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::time::timeout;
use tracing::error;

use crate::db::queries::{dht_latest, pico_latest};
use crate::server::state::SharedState;
use crate::utils::{format_recording_time, utc_now};

const BROKER_PING_TIMEOUT: Duration = Duration::from_secs(2);

async fn check_broker(state: &SharedState) -> (bool, String) {
    let result = async {
        let mut conn = state.redis.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await
    };
    match timeout(BROKER_PING_TIMEOUT, result).await {
        Ok(Ok(_)) => (true, "ok".to_string()),
        Ok(Err(e)) => {
            error!(error = %e, "broker health check failed");
            (false, e.to_string())
        }
        Err(_) => (false, "timeout".to_string()),
    }
}

/// `GET /health`
pub async fn health_check(State(state): State<SharedState>) -> Response {
    let (broker_ok, broker_status) = check_broker(&state).await;

    let (db_ok, db_status, dht_last, pico_last) = match state.pool.acquire().await {
        Ok(mut conn) => match conn.fetch_one("SELECT 1", vec![], |row| row.get::<_, i64>(0)).await
        {
            Ok(_) => {
                let dht_last = dht_latest(&mut conn)
                    .await
                    .ok()
                    .flatten()
                    .map(|row| row.recording_time);
                let pico_last = pico_latest(&mut conn)
                    .await
                    .ok()
                    .and_then(|rows| rows.first().map(|row| row.recording_time.clone()));
                (true, "ok".to_string(), dht_last, pico_last)
            }
            Err(e) => {
                error!(error = %e, "database health check failed");
                (false, e.to_string(), None, None)
            }
        },
        Err(e) => {
            error!(error = %e, "database health check failed");
            (false, e.to_string(), None, None)
        }
    };

    let healthy = db_ok && broker_ok;
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": format_recording_time(utc_now()),
        "checks": {
            "database": {"ok": db_ok, "status": db_status},
            "broker": {"ok": broker_ok, "status": broker_status},
            "dht_sensor": {"ok": dht_last.is_some(), "last_reading": dht_last},
            "pico_sensor": {"ok": pico_last.is_some(), "last_reading": pico_last},
        },
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
