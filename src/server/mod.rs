// =============================================================================
// HTTP / WebSocket Server — dashboard API, SSE and WS streams, admin API
// =============================================================================
//
// One axum process serving:
//   - REST: /health, /api/dashboard, /api/thresholds, /api/admin/settings
//   - SSE:  /sse/dht/latest, /sse/pico/latest, /sse/humidifier/state
//   - WS:   /dht/latest, /pico/latest, /alerts
//
// A single bus subscription feeds the broadcast manager for the WS
// endpoints; SSE clients each hold their own subscription. Database access
// goes through the bounded connection pool.
// =============================================================================

pub mod admin;
pub mod auth;
pub mod broadcast;
pub mod dashboard;
pub mod health;
pub mod sse;
pub mod state;
pub mod thresholds;
pub mod validators;
pub mod ws;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::eventbus::{EventSubscriber, Topic};
use crate::server::broadcast::Endpoint;
use crate::server::state::SharedState;
use crate::shutdown::Shutdown;

/// Build the full router with CORS middleware and shared state.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── REST ─────────────────────────────────────────────────────
        .route("/health", get(health::health_check))
        .route("/api/dashboard", get(dashboard::get_dashboard))
        .route("/api/thresholds", get(thresholds::get_thresholds))
        .route(
            "/api/admin/settings",
            get(admin::get_settings).post(admin::update_settings),
        )
        // ── SSE ──────────────────────────────────────────────────────
        .route("/sse/dht/latest", get(sse::dht_latest_stream))
        .route("/sse/pico/latest", get(sse::pico_latest_stream))
        .route("/sse/humidifier/state", get(sse::humidifier_state_stream))
        // ── WebSocket ────────────────────────────────────────────────
        .route("/dht/latest", get(ws::dht_latest_ws))
        .route("/pico/latest", get(ws::pico_latest_ws))
        .route("/alerts", get(ws::alerts_ws))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn endpoint_for(topic: Topic) -> Option<Endpoint> {
    match topic {
        Topic::DhtReading => Some(Endpoint::DhtLatest),
        Topic::PicoReading => Some(Endpoint::PicoLatest),
        Topic::Alert => Some(Endpoint::Alerts),
        Topic::HumidifierState => None,
    }
}

/// Single bus subscription fanning events out to WS clients.
async fn fanout_task(state: SharedState, shutdown: Shutdown) {
    let subscriber = match EventSubscriber::new(
        &state.env.redis_url,
        &[Topic::DhtReading, Topic::PicoReading, Topic::Alert],
    ) {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(error = %e, "ws fan-out: bad broker url, websocket pushes disabled");
            return;
        }
    };

    while !shutdown.is_requested() {
        let mut stream = match subscriber.stream().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "ws fan-out: broker connection failed, retrying in 5s");
                if shutdown.sleep_interruptible(Duration::from_secs(5)).await {
                    break;
                }
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.wait() => return,
            };
            let Some((topic, payload)) = next else {
                warn!("ws fan-out: stream ended, reconnecting in 5s");
                shutdown.sleep_interruptible(Duration::from_secs(5)).await;
                break;
            };
            if let Some(endpoint) = endpoint_for(topic) {
                state.broadcast.broadcast(endpoint, &payload.to_string());
            }
        }
    }
}

/// Bind, serve, and shut down gracefully when the flag flips.
pub async fn run(state: SharedState, shutdown: Shutdown) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&state.env.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.env.server.bind_addr))?;
    info!(addr = %state.env.server.bind_addr, "server listening");

    tokio::spawn(fanout_task(state.clone(), shutdown.clone()));

    let app = router(state.clone());
    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait().await })
        .await
        .context("server failed")?;

    state.pool.close().await;
    info!("server stopped");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
