// =============================================================================
// Server-Sent Events — per-client broker subscriptions
// =============================================================================
//
// Each SSE client gets its own broker subscription: an initial snapshot
// (when one exists) followed by one `data: <json>` frame per published
// event. Frames carry no event ids and no retry directive; dead clients
// are reaped by TCP keepalive, not application pings. The stream ends when
// the client disconnects or the broker connection drops.
// =============================================================================

use std::convert::Infallible;
use std::pin::Pin;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use redis::AsyncCommands;
use tracing::{error, warn};

use crate::db::queries::{dht_latest, pico_latest};
use crate::eventbus::{EventSubscriber, Topic};
use crate::humidifier::HUMIDIFIER_STATE_KEY;
use crate::server::state::SharedState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Snapshot-then-live stream for one topic.
async fn event_stream(
    state: &SharedState,
    topic: Topic,
    initial: Option<serde_json::Value>,
) -> Sse<SseStream> {
    let live: Pin<Box<dyn Stream<Item = (Topic, serde_json::Value)> + Send>> =
        match EventSubscriber::new(&state.env.redis_url, &[topic]) {
            Ok(subscriber) => match subscriber.stream().await {
                Ok(stream) => Box::pin(stream),
                Err(e) => {
                    error!(topic = %topic, error = %e, "sse: broker subscription failed");
                    Box::pin(stream::empty())
                }
            },
            Err(e) => {
                error!(topic = %topic, error = %e, "sse: bad broker url");
                Box::pin(stream::empty())
            }
        };

    let frames = stream::iter(initial)
        .map(|value| Ok::<_, Infallible>(Event::default().data(value.to_string())))
        .chain(live.map(|(_topic, value)| {
            Ok::<_, Infallible>(Event::default().data(value.to_string()))
        }));

    Sse::new(Box::pin(frames) as SseStream)
}

/// `GET /sse/dht/latest`
pub async fn dht_latest_stream(State(state): State<SharedState>) -> Sse<SseStream> {
    let initial = match state.pool.acquire().await {
        Ok(mut conn) => dht_latest(&mut conn)
            .await
            .ok()
            .flatten()
            .and_then(|row| serde_json::to_value(row).ok()),
        Err(e) => {
            warn!(error = %e, "sse: no initial dht snapshot");
            None
        }
    };
    event_stream(&state, Topic::DhtReading, initial).await
}

/// `GET /sse/pico/latest`
pub async fn pico_latest_stream(State(state): State<SharedState>) -> Sse<SseStream> {
    let initial = match state.pool.acquire().await {
        Ok(mut conn) => pico_latest(&mut conn)
            .await
            .ok()
            .filter(|rows| !rows.is_empty())
            .and_then(|rows| serde_json::to_value(rows).ok()),
        Err(e) => {
            warn!(error = %e, "sse: no initial pico snapshot");
            None
        }
    };
    event_stream(&state, Topic::PicoReading, initial).await
}

/// `GET /sse/humidifier/state`
pub async fn humidifier_state_stream(State(state): State<SharedState>) -> Sse<SseStream> {
    let initial = fetch_last_humidifier_state(&state).await;
    event_stream(&state, Topic::HumidifierState, initial).await
}

/// Last humidifier state stored by the humidifier service, if any.
async fn fetch_last_humidifier_state(state: &SharedState) -> Option<serde_json::Value> {
    let result = async {
        let mut conn = state.redis.get_multiplexed_async_connection().await?;
        conn.get::<_, Option<String>>(HUMIDIFIER_STATE_KEY).await
    }
    .await;
    match result {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "sse: stored humidifier state is not JSON");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "sse: failed to fetch humidifier state");
            None
        }
    }
}
