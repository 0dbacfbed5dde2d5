// =============================================================================
// Event Bus — Redis pub/sub fan-out between services
// =============================================================================
//
// Polling services publish readings and alert transitions; the web server,
// notifier, humidifier and display processes subscribe. Delivery is
// at-most-once and best-effort: nothing is persisted, late subscribers miss
// earlier events, and the broker may shed messages under pressure. The
// durable record lives in the reading tables, not here.
//
// Payloads are UTF-8 JSON with a fixed schema per topic.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use futures_util::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Namespace, SensorId};
use crate::utils::{epoch_ms, format_recording_time};

// =============================================================================
// Topics
// =============================================================================

/// The closed set of event bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    DhtReading,
    PicoReading,
    Alert,
    HumidifierState,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::DhtReading,
        Topic::PicoReading,
        Topic::Alert,
        Topic::HumidifierState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DhtReading => "dht.reading",
            Topic::PicoReading => "pico.reading",
            Topic::Alert => "alert",
            Topic::HumidifierState => "humidifier.state",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dht.reading" => Ok(Topic::DhtReading),
            "pico.reading" => Ok(Topic::PicoReading),
            "alert" => Ok(Topic::Alert),
            "humidifier.state" => Ok(Topic::HumidifierState),
            other => Err(format!("unknown topic: {other}")),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `dht.reading` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DhtReadingEvent {
    pub temperature: f64,
    pub humidity: f64,
    pub recording_time: String,
    pub epoch: i64,
}

impl DhtReadingEvent {
    pub fn new(temperature: f64, humidity: f64, recording_time: NaiveDateTime) -> Self {
        Self {
            temperature,
            humidity,
            recording_time: format_recording_time(recording_time),
            epoch: epoch_ms(recording_time),
        }
    }
}

/// One element of a `pico.reading` payload (published as an array).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PicoReadingEvent {
    pub plant_id: u32,
    pub moisture: f64,
    pub recording_time: String,
    pub epoch: i64,
}

impl PicoReadingEvent {
    pub fn new(plant_id: u32, moisture: f64, recording_time: NaiveDateTime) -> Self {
        Self {
            plant_id,
            moisture,
            recording_time: format_recording_time(recording_time),
            epoch: epoch_ms(recording_time),
        }
    }
}

/// `alert` payload: a committed alert or resolution transition.
/// `threshold` is null on resolutions. Events are immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub namespace: Namespace,
    pub sensor_name: SensorId,
    pub value: f64,
    pub unit: String,
    pub threshold: Option<f64>,
    pub recording_time: String,
    pub is_resolved: bool,
}

impl AlertEvent {
    /// Wire form of a committed tracker transition.
    pub fn from_transition(transition: &crate::alerts::AlertTransition) -> Self {
        Self {
            namespace: transition.namespace,
            sensor_name: transition.sensor_name.clone(),
            value: transition.value,
            unit: transition.unit.to_string(),
            threshold: transition.threshold,
            recording_time: format_recording_time(transition.recording_time),
            is_resolved: transition.is_resolved,
        }
    }

    pub fn sensor_label(&self) -> String {
        self.sensor_name.label()
    }
}

/// `humidifier.state` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumidifierStateEvent {
    pub is_on: bool,
    pub recording_time: String,
}

impl HumidifierStateEvent {
    pub fn new(is_on: bool, recording_time: NaiveDateTime) -> Self {
        Self {
            is_on,
            recording_time: format_recording_time(recording_time),
        }
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Publishes events to the bus. One instance per producer service is
/// enough; publishes are serialized through it.
///
/// Best-effort: a failed publish is logged and dropped, and the connection
/// is re-established on the next call.
pub struct EventPublisher {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
}

impl EventPublisher {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            conn: None,
        })
    }

    /// Eagerly connect; optional, `publish` connects lazily.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        if self.conn.is_none() {
            self.conn = Some(self.client.get_multiplexed_async_connection().await?);
            info!("event publisher connected");
        }
        Ok(())
    }

    /// Publish a single event.
    pub async fn publish<E: Serialize>(&mut self, topic: Topic, event: &E) {
        match serde_json::to_string(event) {
            Ok(payload) => self.publish_raw(topic, payload).await,
            Err(e) => warn!(topic = %topic, error = %e, "failed to serialize event"),
        }
    }

    /// Publish a list of events as one JSON array payload.
    pub async fn publish_batch<E: Serialize>(&mut self, topic: Topic, events: &[E]) {
        match serde_json::to_string(events) {
            Ok(payload) => self.publish_raw(topic, payload).await,
            Err(e) => warn!(topic = %topic, error = %e, "failed to serialize event batch"),
        }
    }

    async fn publish_raw(&mut self, topic: Topic, payload: String) {
        if self.conn.is_none() {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => self.conn = Some(conn),
                Err(e) => {
                    debug!(topic = %topic, error = %e, "broker unreachable, dropping event");
                    return;
                }
            }
        }

        if let Some(conn) = self.conn.as_mut() {
            let result: redis::RedisResult<i64> = conn.publish(topic.as_str(), &payload).await;
            match result {
                Ok(receivers) => {
                    debug!(topic = %topic, receivers, "published event");
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "publish failed, dropping event");
                    self.conn = None;
                }
            }
        }
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Subscribes to a set of topics and exposes a single consumer stream of
/// `(topic, decoded payload)` pairs in delivery order. Multi-reader
/// fan-out is the caller's responsibility.
pub struct EventSubscriber {
    client: redis::Client,
    topics: Vec<Topic>,
}

impl EventSubscriber {
    pub fn new(redis_url: &str, topics: &[Topic]) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            topics: topics.to_vec(),
        })
    }

    /// Connect and return the message stream. The stream ends when the
    /// broker connection drops; callers loop and resubscribe.
    pub async fn stream(
        &self,
    ) -> anyhow::Result<impl Stream<Item = (Topic, serde_json::Value)> + Unpin> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in &self.topics {
            pubsub.subscribe(topic.as_str()).await?;
            debug!(topic = %topic, "subscribed");
        }
        info!(topics = self.topics.len(), "event subscriber connected");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let topic = match msg.get_channel_name().parse::<Topic>() {
                Ok(topic) => topic,
                Err(e) => {
                    warn!(error = %e, "message on unexpected channel");
                    return None;
                }
            };
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "undecodable payload");
                    return None;
                }
            };
            match serde_json::from_str::<serde_json::Value>(&payload) {
                Ok(value) => Some((topic, value)),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "invalid JSON payload");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Parse an `alert` payload, logging and discarding malformed ones.
pub fn parse_alert_event(value: &serde_json::Value) -> Option<AlertEvent> {
    match serde_json::from_value(value.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "failed to parse alert event");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_recording_time;

    #[test]
    fn topic_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("dht.stats".parse::<Topic>().is_err());
    }

    #[test]
    fn dht_payload_schema_is_exact() {
        let ts = parse_recording_time("2025-06-01 10:00:00").unwrap();
        let event = DhtReadingEvent::new(21.5, 55.0, ts);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "temperature": 21.5,
                "humidity": 55.0,
                "recording_time": "2025-06-01 10:00:00",
                "epoch": 1_748_772_000_000i64,
            })
        );
    }

    #[test]
    fn alert_payload_sensor_name_is_string_or_int() {
        let named = AlertEvent {
            namespace: Namespace::Dht,
            sensor_name: SensorId::Named("humidity".into()),
            value: 35.0,
            unit: "%".into(),
            threshold: Some(40.0),
            recording_time: "2025-06-01 10:00:00".into(),
            is_resolved: false,
        };
        let json = serde_json::to_value(&named).unwrap();
        assert_eq!(json["sensor_name"], "humidity");
        assert_eq!(json["namespace"], "dht");

        let plant = AlertEvent {
            namespace: Namespace::Pico,
            sensor_name: SensorId::Plant(2),
            value: 20.0,
            unit: "%".into(),
            threshold: Some(30.0),
            recording_time: "2025-06-01 10:00:00".into(),
            is_resolved: false,
        };
        let json = serde_json::to_value(&plant).unwrap();
        assert_eq!(json["sensor_name"], 2);

        let back: AlertEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.sensor_name, SensorId::Plant(2));
    }

    #[test]
    fn resolution_has_null_threshold() {
        let event = AlertEvent {
            namespace: Namespace::Dht,
            sensor_name: SensorId::Named("temperature".into()),
            value: 23.0,
            unit: "°C".into(),
            threshold: None,
            recording_time: "2025-06-01 10:00:00".into(),
            is_resolved: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["threshold"].is_null());
        assert_eq!(json["is_resolved"], true);
    }

    #[test]
    fn parse_alert_event_discards_malformed() {
        assert!(parse_alert_event(&serde_json::json!({"namespace": "dht"})).is_none());
        let ok = serde_json::json!({
            "namespace": "pico",
            "sensor_name": 1,
            "value": 12.0,
            "unit": "%",
            "threshold": 30.0,
            "recording_time": "2025-06-01 10:00:00",
            "is_resolved": false,
        });
        assert!(parse_alert_event(&ok).is_some());
    }
}
