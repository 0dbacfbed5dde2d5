// =============================================================================
// Pico Moisture Reader — serial wire parsing, validation, alert feed
// =============================================================================
//
// The moisture board prints one JSON object per line on its USB serial
// port: keys are `plant-<digits>`, values are moisture percentages. Each
// polling cycle consumes one line, validates every entry (malformed keys
// and out-of-range values are logged and dropped), filters implausible
// jumps to 100 % (a known capacitive-sensor fault), feeds the survivors
// through the alert tracker against per-plant thresholds, persists them
// and publishes the batch on `pico.reading`.
//
// The serial driver itself is an external collaborator behind
// `PicoLineSource`; the mock implementation lives in `mock.rs`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::types::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, warn};

use crate::alerts::{AlertTracker, AlertTransition};
use crate::db::settings_store::SettingsStore;
use crate::db::{init_db, Database};
use crate::eventbus::{AlertEvent, EventPublisher, PicoReadingEvent, Topic};
use crate::polling::PollingService;
use crate::settings::{Settings, MOISTURE_BOUNDS};
use crate::thresholds::{effective_thresholds, moisture_rule};
use crate::types::{AlertState, Namespace, SensorId, Unit};
use crate::utils::{format_recording_time, utc_now};

/// A validated moisture reading from a single plant sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct MoistureReading {
    pub plant_id: u32,
    pub moisture: f64,
    pub recording_time: NaiveDateTime,
}

/// Abstract line-oriented serial source. `Ok(None)` is a read timeout.
#[async_trait]
pub trait PicoLineSource: Send {
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Close the port. Default no-op.
    fn close(&mut self) {}
}

/// Parse a wire key of the form `plant-<digits>`.
pub fn parse_plant_id(raw: &str) -> Option<u32> {
    let digits = raw.strip_prefix("plant-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Decode one serial line into validated readings.
///
/// `last_moisture` carries the previous accepted value per plant for the
/// spike filter: a jump to a saturated 100 % reading of more than
/// `spike_threshold` points is a sensor fault, not a watering event.
pub fn parse_line(
    line: &str,
    spike_threshold: f64,
    last_moisture: &mut HashMap<u32, f64>,
    recording_time: NaiveDateTime,
) -> Vec<MoistureReading> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    let parsed: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "invalid JSON line from moisture board");
            return Vec::new();
        }
    };
    let Some(object) = parsed.as_object() else {
        warn!("expected JSON object from moisture board");
        return Vec::new();
    };

    let (lo, hi) = MOISTURE_BOUNDS;
    let mut readings = Vec::new();
    for (key, value) in object {
        let Some(plant_id) = parse_plant_id(key) else {
            warn!(key = %key, "malformed plant id, dropped");
            continue;
        };
        let Some(moisture) = value.as_f64() else {
            warn!(plant = plant_id, "non-numeric moisture value, dropped");
            continue;
        };
        if moisture < lo as f64 || moisture > hi as f64 {
            warn!(plant = plant_id, moisture, "moisture outside [0, 100], dropped");
            continue;
        }
        if moisture >= hi as f64 {
            if let Some(previous) = last_moisture.get(&plant_id) {
                if moisture - previous > spike_threshold {
                    warn!(
                        plant = plant_id,
                        previous, "implausible jump to 100%, dropped as sensor fault"
                    );
                    continue;
                }
            }
        }

        last_moisture.insert(plant_id, moisture);
        readings.push(MoistureReading {
            plant_id,
            moisture,
            recording_time,
        });
    }
    readings
}

// =============================================================================
// Service
// =============================================================================

pub struct PicoService {
    source: Box<dyn PicoLineSource>,
    db: Database,
    publisher: EventPublisher,
    tracker: AlertTracker,
    store: Arc<SettingsStore>,
    env: Settings,
    last_moisture: HashMap<u32, f64>,
    alert_rx: UnboundedReceiver<AlertTransition>,
}

impl PicoService {
    pub fn new(
        source: Box<dyn PicoLineSource>,
        env: Settings,
        store: Arc<SettingsStore>,
    ) -> Result<Self> {
        let (alert_tx, alert_rx) = unbounded_channel();
        let mut tracker = AlertTracker::new(env.alerts.confirmation_count);
        tracker.register_callback(
            Namespace::Pico,
            Box::new(move |transition| {
                let _ = alert_tx.send(transition.clone());
            }),
        );

        Ok(Self {
            source,
            db: Database::from_settings(&env),
            publisher: EventPublisher::new(&env.redis_url)?,
            tracker,
            store,
            env,
            last_moisture: HashMap::new(),
            alert_rx,
        })
    }

    async fn flush_alerts(&mut self) {
        while let Ok(transition) = self.alert_rx.try_recv() {
            let event = AlertEvent::from_transition(&transition);
            self.publisher.publish(Topic::Alert, &event).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &AlertTracker {
        &self.tracker
    }
}

#[async_trait]
impl PollingService for PicoService {
    type Reading = Vec<MoistureReading>;

    fn name(&self) -> &str {
        "pico"
    }

    async fn initialize(&mut self) -> Result<()> {
        init_db(&mut self.db, &self.env).await?;
        self.store.connect().await?;
        if let Err(e) = self.publisher.connect().await {
            warn!(error = %e, "event bus unreachable at startup, publishing best-effort");
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<Vec<MoistureReading>>> {
        let Some(line) = self.source.read_line().await? else {
            debug!("read timeout, no data received");
            return Ok(None);
        };
        let readings = parse_line(
            &line,
            self.env.pico.spike_threshold,
            &mut self.last_moisture,
            utc_now(),
        );
        if readings.is_empty() {
            return Ok(None);
        }
        Ok(Some(readings))
    }

    async fn audit(&mut self, readings: &mut Vec<MoistureReading>) -> Result<bool> {
        let thresholds = effective_thresholds(&self.store, &self.env).await?;

        for reading in readings.iter() {
            let rule = moisture_rule(&thresholds, &self.env.hysteresis, reading.plant_id);
            let sensor_id = SensorId::Plant(reading.plant_id);
            let currently_in_alert =
                self.tracker.state(Namespace::Pico, &sensor_id) == AlertState::InAlert;
            let violated = rule.is_violated(reading.moisture, currently_in_alert);

            self.tracker.check(
                Namespace::Pico,
                sensor_id,
                reading.moisture,
                Unit::Percent,
                violated.then_some(rule.value as f64),
                violated,
                reading.recording_time,
            );
        }

        self.flush_alerts().await;
        Ok(!readings.is_empty())
    }

    async fn persist(&mut self, readings: &Vec<MoistureReading>) -> Result<()> {
        let rows = readings
            .iter()
            .map(|reading| {
                vec![
                    Value::from(reading.plant_id as i64),
                    Value::from(reading.moisture),
                    Value::from(format_recording_time(reading.recording_time)),
                ]
            })
            .collect();
        self.db
            .execute_many(
                "INSERT INTO pico_reading (plant_id, moisture, recording_time) VALUES (?1, ?2, ?3)",
                rows,
            )
            .await?;

        let events: Vec<PicoReadingEvent> = readings
            .iter()
            .map(|r| PicoReadingEvent::new(r.plant_id, r.moisture, r.recording_time))
            .collect();
        self.publisher.publish_batch(Topic::PicoReading, &events).await;
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.flush_alerts().await;
        self.db.close().await;
        self.source.close();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polling::PollingService as _;

    #[test]
    fn parse_plant_id_accepts_wire_format_only() {
        assert_eq!(parse_plant_id("plant-1"), Some(1));
        assert_eq!(parse_plant_id("plant-12"), Some(12));
        assert_eq!(parse_plant_id("plant-"), None);
        assert_eq!(parse_plant_id("plant-1a"), None);
        assert_eq!(parse_plant_id("shrub-1"), None);
        assert_eq!(parse_plant_id("plant--1"), None);
    }

    #[test]
    fn parse_line_drops_invalid_entries_and_keeps_valid() {
        let mut last = HashMap::new();
        let now = utc_now();
        let line = r#"{"plant-1": 45.5, "plant-x": 50.0, "plant-2": 140.0, "plant-3": "wet"}"#;
        let readings = parse_line(line, 20.0, &mut last, now);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].plant_id, 1);
        assert_eq!(readings[0].moisture, 45.5);
    }

    #[test]
    fn parse_line_rejects_malformed_json() {
        let mut last = HashMap::new();
        assert!(parse_line("not json", 20.0, &mut last, utc_now()).is_empty());
        assert!(parse_line("[1, 2]", 20.0, &mut last, utc_now()).is_empty());
        assert!(parse_line("", 20.0, &mut last, utc_now()).is_empty());
    }

    #[test]
    fn spike_to_full_scale_is_rejected() {
        let mut last = HashMap::new();
        let now = utc_now();

        parse_line(r#"{"plant-1": 55.0}"#, 20.0, &mut last, now);
        // 55 -> 100 is a 45-point jump to saturation: sensor fault.
        let readings = parse_line(r#"{"plant-1": 100.0}"#, 20.0, &mut last, now);
        assert!(readings.is_empty());

        // 85 -> 100 is within the allowed jump.
        parse_line(r#"{"plant-1": 85.0}"#, 20.0, &mut last, now);
        let readings = parse_line(r#"{"plant-1": 100.0}"#, 20.0, &mut last, now);
        assert_eq!(readings.len(), 1);
    }

    struct ScriptedSource {
        lines: Vec<Option<String>>,
        index: usize,
    }

    #[async_trait]
    impl PicoLineSource for ScriptedSource {
        async fn read_line(&mut self) -> Result<Option<String>> {
            let line = self.lines.get(self.index).cloned().flatten();
            self.index += 1;
            Ok(line)
        }
    }

    async fn service_with(lines: Vec<Option<String>>) -> (tempfile::TempDir, PicoService) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pico.sqlite3").to_string_lossy().into_owned();
        let env = Settings::for_tests(&db_path);
        let store_db = Database::from_settings(&env);
        let store = Arc::new(SettingsStore::new(store_db, &env.redis_url).unwrap());
        let source = Box::new(ScriptedSource { lines, index: 0 });
        let mut service = PicoService::new(source, env, store).unwrap();
        service.initialize().await.unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn poll_skips_timeouts_and_unparseable_lines() {
        let (_dir, mut service) = service_with(vec![
            None,
            Some("garbage".into()),
            Some(r#"{"plant-1": 42.0}"#.into()),
        ])
        .await;
        assert!(service.poll().await.unwrap().is_none());
        assert!(service.poll().await.unwrap().is_none());
        let readings = service.poll().await.unwrap().unwrap();
        assert_eq!(readings.len(), 1);
    }

    #[tokio::test]
    async fn dry_plant_commits_alert_after_confirmations() {
        // Test settings: plant 2 threshold 35, confirmation 3.
        let (_dir, mut service) = service_with(vec![]).await;
        for _ in 0..3 {
            let mut readings = vec![MoistureReading {
                plant_id: 2,
                moisture: 20.0,
                recording_time: utc_now(),
            }];
            assert!(service.audit(&mut readings).await.unwrap());
        }
        assert_eq!(
            service.tracker().state(Namespace::Pico, &SensorId::Plant(2)),
            AlertState::InAlert
        );
        // Other plants are unaffected.
        assert_eq!(
            service.tracker().state(Namespace::Pico, &SensorId::Plant(1)),
            AlertState::Ok
        );
    }

    #[tokio::test]
    async fn persist_writes_batch_rows() {
        let (_dir, mut service) = service_with(vec![]).await;
        let now = utc_now();
        let readings = vec![
            MoistureReading {
                plant_id: 1,
                moisture: 40.0,
                recording_time: now,
            },
            MoistureReading {
                plant_id: 2,
                moisture: 52.5,
                recording_time: now,
            },
        ];
        service.persist(&readings).await.unwrap();

        let count = service
            .db
            .fetch_one("SELECT COUNT(*) FROM pico_reading", vec![], |row| {
                row.get::<_, i64>(0)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 2);
    }
}
