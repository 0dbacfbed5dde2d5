// =============================================================================
// Mock Sensors — development data without hardware
// =============================================================================
//
// Selected by `MOCK_SENSORS=1`. Values follow layered sine waves at
// different frequencies (a poor man's Perlin noise) plus a little random
// jitter, so charts and alert behaviour look like a real greenhouse.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use crate::dht::DhtSensor;
use crate::pico::PicoLineSource;
use crate::types::PLANT_IDS;

/// Smooth noise in [-1, 1] from three sine layers.
fn smooth_noise(t: f64, seed: f64) -> f64 {
    (t * 0.1 + seed).sin() * 0.5 + (t * 0.23 + seed * 2.0).sin() * 0.3
        + (t * 0.07 + seed * 3.0).sin() * 0.2
}

// =============================================================================
// DHT22
// =============================================================================

/// Mock DHT22: temperature around 21 °C, humidity around 52 %, with
/// correlated drift.
pub struct MockDhtSensor {
    start: Instant,
}

impl MockDhtSensor {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    fn t(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for MockDhtSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DhtSensor for MockDhtSensor {
    async fn read(&mut self) -> Result<(f64, f64)> {
        let t = self.t();
        let mut rng = rand::thread_rng();

        let temp_variation = smooth_noise(t, 1.0) * 3.0;
        let temperature = 21.0 + temp_variation + rng.gen_range(-0.1..0.1);

        let humidity_variation = smooth_noise(t, 2.0) * 12.0 - temp_variation * 1.5;
        let humidity =
            (52.0 + humidity_variation + rng.gen_range(-0.5..0.5)).clamp(30.0, 80.0);

        Ok(((temperature * 10.0).round() / 10.0, (humidity * 10.0).round() / 10.0))
    }
}

// =============================================================================
// Pico moisture board
// =============================================================================

struct PlantProfile {
    plant_id: u32,
    base: f64,
    variation: f64,
    seed: f64,
}

/// Mock serial source emitting one JSON line per polling interval, in the
/// board's wire format (`{"plant-1": 55.3, ...}`).
pub struct MockPicoLineSource {
    start: Instant,
    interval: Duration,
    profiles: Vec<PlantProfile>,
}

impl MockPicoLineSource {
    pub fn new(interval: Duration) -> Self {
        let profiles = PLANT_IDS
            .iter()
            .enumerate()
            .map(|(index, &plant_id)| PlantProfile {
                plant_id,
                base: [55.0, 42.0, 35.0][index % 3],
                variation: [15.0, 12.0, 10.0][index % 3],
                seed: 20.0 + index as f64,
            })
            .collect();
        Self {
            start: Instant::now(),
            interval,
            profiles,
        }
    }

    fn moisture_for(&self, profile: &PlantProfile) -> f64 {
        let t = self.start.elapsed().as_secs_f64();
        let mut rng = rand::thread_rng();
        let value = profile.base
            + smooth_noise(t, profile.seed) * profile.variation
            + rng.gen_range(-1.0..1.0);
        (value.clamp(5.0, 95.0) * 10.0).round() / 10.0
    }
}

#[async_trait]
impl PicoLineSource for MockPicoLineSource {
    async fn read_line(&mut self) -> Result<Option<String>> {
        tokio::time::sleep(self.interval).await;
        let mut payload = serde_json::Map::new();
        for profile in &self.profiles {
            payload.insert(
                format!("plant-{}", profile.plant_id),
                serde_json::json!(self.moisture_for(profile)),
            );
        }
        Ok(Some(serde_json::Value::Object(payload).to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_noise_stays_in_unit_band() {
        for i in 0..1000 {
            let value = smooth_noise(i as f64 * 0.37, 1.0);
            assert!((-1.0..=1.0).contains(&value));
        }
    }

    #[tokio::test]
    async fn mock_dht_reads_stay_within_physical_bounds() {
        let mut sensor = MockDhtSensor::new();
        for _ in 0..50 {
            let (temperature, humidity) = sensor.read().await.unwrap();
            assert!((-40.0..=80.0).contains(&temperature));
            assert!((0.0..=100.0).contains(&humidity));
        }
    }

    #[tokio::test]
    async fn mock_pico_emits_valid_wire_lines() {
        let mut source = MockPicoLineSource::new(Duration::from_millis(1));
        let line = source.read_line().await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        let object = parsed.as_object().unwrap();
        assert_eq!(object.len(), PLANT_IDS.len());
        for plant_id in PLANT_IDS {
            let value = object[&format!("plant-{plant_id}")].as_f64().unwrap();
            assert!((0.0..=100.0).contains(&value));
        }
    }
}
