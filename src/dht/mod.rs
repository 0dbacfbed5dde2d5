// =============================================================================
// DHT22 Polling Service — climate readings, bounds audit, alert feed
// =============================================================================
//
// A concrete instance of the polling skeleton. Each cycle reads one
// temperature/humidity pair, rejects physically impossible values, feeds
// both measures through the alert tracker against the effective threshold
// rules, persists the reading, and publishes it on `dht.reading`.
// Committed tracker transitions are published on `alert`.
//
// The sensor chip driver is an external collaborator hidden behind
// `DhtSensor`; the mock implementation lives in `mock.rs`.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::types::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::alerts::{AlertTracker, AlertTransition};
use crate::db::settings_store::SettingsStore;
use crate::db::{init_db, Database};
use crate::eventbus::{AlertEvent, DhtReadingEvent, EventPublisher, Topic};
use crate::polling::PollingService;
use crate::settings::{Settings, HUMIDITY_BOUNDS, TEMPERATURE_BOUNDS};
use crate::thresholds::{effective_thresholds, threshold_rules};
use crate::types::{AlertState, Measure, MeasureName, Namespace, SensorId, Unit};
use crate::utils::utc_now;

/// One climate sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub temperature: Measure,
    pub humidity: Measure,
    pub recording_time: NaiveDateTime,
}

impl Reading {
    pub fn new(temperature: f64, humidity: f64, recording_time: NaiveDateTime) -> Self {
        Self {
            temperature: Measure::new(temperature, Unit::Celsius),
            humidity: Measure::new(humidity, Unit::Percent),
            recording_time,
        }
    }

    fn measure_mut(&mut self, name: MeasureName) -> &mut Measure {
        match name {
            MeasureName::Temperature => &mut self.temperature,
            MeasureName::Humidity => &mut self.humidity,
        }
    }

    fn measure(&self, name: MeasureName) -> &Measure {
        match name {
            MeasureName::Temperature => &self.temperature,
            MeasureName::Humidity => &self.humidity,
        }
    }
}

/// Abstract DHT22 driver. `read` returns `(temperature °C, humidity %)`.
#[async_trait]
pub trait DhtSensor: Send {
    async fn read(&mut self) -> Result<(f64, f64)>;

    /// Release the chip. Default no-op for drivers without teardown.
    fn exit(&mut self) {}
}

// =============================================================================
// Service
// =============================================================================

pub struct DhtService {
    sensor: Box<dyn DhtSensor>,
    db: Database,
    publisher: EventPublisher,
    tracker: AlertTracker,
    store: Arc<SettingsStore>,
    env: Settings,
    alert_rx: UnboundedReceiver<AlertTransition>,
}

impl DhtService {
    pub fn new(
        sensor: Box<dyn DhtSensor>,
        env: Settings,
        store: Arc<SettingsStore>,
    ) -> Result<Self> {
        let (alert_tx, alert_rx) = unbounded_channel();
        let mut tracker = AlertTracker::new(env.alerts.confirmation_count);
        // The callback only forwards; publishing happens in the cycle.
        tracker.register_callback(
            Namespace::Dht,
            Box::new(move |transition| {
                let _ = alert_tx.send(transition.clone());
            }),
        );

        Ok(Self {
            sensor,
            db: Database::from_settings(&env),
            publisher: EventPublisher::new(&env.redis_url)?,
            tracker,
            store,
            env,
            alert_rx,
        })
    }

    /// The DHT22 cannot produce values outside its physical range; such a
    /// reading means the transfer was corrupted and must be dropped.
    fn within_bounds(reading: &Reading) -> bool {
        let (t_lo, t_hi) = TEMPERATURE_BOUNDS;
        let (h_lo, h_hi) = HUMIDITY_BOUNDS;
        (t_lo as f64..=t_hi as f64).contains(&reading.temperature.value)
            && (h_lo as f64..=h_hi as f64).contains(&reading.humidity.value)
    }

    /// Publish every transition the tracker committed during this cycle.
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
impl PollingService for DhtService {
    type Reading = Reading;

    fn name(&self) -> &str {
        "dht"
    }

    async fn initialize(&mut self) -> Result<()> {
        init_db(&mut self.db, &self.env).await?;
        self.store.connect().await?;
        if let Err(e) = self.publisher.connect().await {
            warn!(error = %e, "event bus unreachable at startup, publishing best-effort");
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<Reading>> {
        match self.sensor.read().await {
            Ok((temperature, humidity)) => {
                let reading = Reading::new(temperature, humidity, utc_now());
                info!(
                    temperature = %reading.temperature,
                    humidity = %reading.humidity,
                    "read sensor"
                );
                Ok(Some(reading))
            }
            Err(e) => {
                // Transient sensor errors (checksum, timing) are routine.
                debug!(error = %e, "sensor read failed, skipping cycle");
                Ok(None)
            }
        }
    }

    async fn audit(&mut self, reading: &mut Reading) -> Result<bool> {
        if !Self::within_bounds(reading) {
            warn!(
                temperature = reading.temperature.value,
                humidity = reading.humidity.value,
                "reading outside sensor bounds, dropped"
            );
            return Ok(false);
        }

        let thresholds = effective_thresholds(&self.store, &self.env).await?;
        let rules = threshold_rules(&thresholds, &self.env.hysteresis);

        for name in MeasureName::ALL {
            let sensor_id: SensorId = name.into();
            let currently_in_alert =
                self.tracker.state(Namespace::Dht, &sensor_id) == AlertState::InAlert;
            let measure = reading.measure(name);
            let violated_rule = rules[&name]
                .iter()
                .find(|rule| rule.is_violated(measure.value, currently_in_alert))
                .copied();

            let (value, unit) = (measure.value, measure.unit);
            let state = match violated_rule {
                Some(rule) => self.tracker.check(
                    Namespace::Dht,
                    sensor_id,
                    value,
                    unit,
                    Some(rule.value as f64),
                    true,
                    reading.recording_time,
                ),
                None => self.tracker.check(
                    Namespace::Dht,
                    sensor_id,
                    value,
                    unit,
                    None,
                    false,
                    reading.recording_time,
                ),
            };
            reading.measure_mut(name).state = state;
        }

        self.flush_alerts().await;
        Ok(true)
    }

    async fn persist(&mut self, reading: &Reading) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO reading (temperature, humidity, recording_time) VALUES (?1, ?2, ?3)",
                vec![
                    Value::from(reading.temperature.value),
                    Value::from(reading.humidity.value),
                    Value::from(crate::utils::format_recording_time(reading.recording_time)),
                ],
            )
            .await?;

        let event = DhtReadingEvent::new(
            reading.temperature.value,
            reading.humidity.value,
            reading.recording_time,
        );
        self.publisher.publish(Topic::DhtReading, &event).await;
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.flush_alerts().await;
        self.db.close().await;
        self.sensor.exit();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polling::PollingService as _;

    struct ScriptedSensor {
        readings: Vec<(f64, f64)>,
        index: usize,
    }

    #[async_trait]
    impl DhtSensor for ScriptedSensor {
        async fn read(&mut self) -> Result<(f64, f64)> {
            let reading = self.readings[self.index % self.readings.len()];
            self.index += 1;
            Ok(reading)
        }
    }

    async fn service_with(readings: Vec<(f64, f64)>) -> (tempfile::TempDir, DhtService) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dht.sqlite3").to_string_lossy().into_owned();
        let env = Settings::for_tests(&db_path);
        let store_db = Database::from_settings(&env);
        let store = Arc::new(SettingsStore::new(store_db, &env.redis_url).unwrap());
        let sensor = Box::new(ScriptedSensor { readings, index: 0 });
        let mut service = DhtService::new(sensor, env, store).unwrap();
        service.initialize().await.unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn out_of_bounds_reading_is_rejected_not_stored() {
        let (_dir, mut service) = service_with(vec![(120.0, 50.0)]).await;
        let mut reading = service.poll().await.unwrap().unwrap();
        assert!(!service.audit(&mut reading).await.unwrap());

        // Valid reading passes and persists.
        let mut reading = Reading::new(21.0, 50.0, utc_now());
        assert!(service.audit(&mut reading).await.unwrap());
        service.persist(&reading).await.unwrap();

        let count = service
            .db
            .fetch_one("SELECT COUNT(*) FROM reading", vec![], |row| {
                row.get::<_, i64>(0)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn negative_humidity_is_rejected() {
        let (_dir, mut service) = service_with(vec![(21.0, -1.0)]).await;
        let mut reading = service.poll().await.unwrap().unwrap();
        assert!(!service.audit(&mut reading).await.unwrap());
    }

    #[tokio::test]
    async fn audit_commits_alert_after_confirmation_and_marks_measure() {
        // Default test settings: MAX_TEMPERATURE 25, confirmation 3.
        let (_dir, mut service) = service_with(vec![]).await;

        for i in 0..3 {
            let mut reading = Reading::new(27.0, 50.0, utc_now());
            service.audit(&mut reading).await.unwrap();
            let expected = if i == 2 { AlertState::InAlert } else { AlertState::Ok };
            assert_eq!(reading.temperature.state, expected);
            assert_eq!(reading.humidity.state, AlertState::Ok);
        }
        assert_eq!(
            service
                .tracker()
                .state(Namespace::Dht, &SensorId::Named("temperature".into())),
            AlertState::InAlert
        );
    }

    #[tokio::test]
    async fn hysteresis_holds_alert_until_clear_band() {
        // Scenario S3: MAX 25, hysteresis 1, confirmation 3.
        let (_dir, mut service) = service_with(vec![]).await;
        let temp_id = SensorId::Named("temperature".into());

        for temperature in [26.0, 26.0, 26.0] {
            let mut reading = Reading::new(temperature, 50.0, utc_now());
            service.audit(&mut reading).await.unwrap();
        }
        assert_eq!(
            service.tracker().state(Namespace::Dht, &temp_id),
            AlertState::InAlert
        );

        // 25 sits inside the hysteresis band: still violated.
        for _ in 0..3 {
            let mut reading = Reading::new(25.0, 50.0, utc_now());
            service.audit(&mut reading).await.unwrap();
        }
        assert_eq!(
            service.tracker().state(Namespace::Dht, &temp_id),
            AlertState::InAlert
        );

        // 24 clears after three confirmations.
        for _ in 0..3 {
            let mut reading = Reading::new(24.0, 50.0, utc_now());
            service.audit(&mut reading).await.unwrap();
        }
        assert_eq!(service.tracker().state(Namespace::Dht, &temp_id), AlertState::Ok);
    }

    #[tokio::test]
    async fn persist_writes_row_in_wire_timestamp_format() {
        let (_dir, mut service) = service_with(vec![]).await;
        let reading = Reading::new(21.5, 55.0, utc_now());
        service.persist(&reading).await.unwrap();

        let stored = service
            .db
            .fetch_one(
                "SELECT temperature, humidity, recording_time FROM reading",
                vec![],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.0, 21.5);
        assert_eq!(stored.1, 55.0);
        assert_eq!(stored.2.len(), 19);
    }
}
