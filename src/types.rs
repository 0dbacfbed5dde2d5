// =============================================================================
// Core Domain Types — Greenhouse Telemetry
// =============================================================================
//
// Shared enums and small value types used across every service: alert
// namespaces, sensor identifiers, measurement units, threshold kinds, the
// closed settings-key catalog and the notification backend set.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Namespaces & sensor identity
// =============================================================================

/// Top-level group for alert keys: ambient climate vs plant moisture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Dht,
    Pico,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Dht => write!(f, "dht"),
            Namespace::Pico => write!(f, "pico"),
        }
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dht" => Ok(Namespace::Dht),
            "pico" => Ok(Namespace::Pico),
            other => Err(format!("unknown namespace: {other}")),
        }
    }
}

/// Identifier for the sensor behind an alert key.
///
/// Climate sensors are named (`temperature`, `humidity`); moisture sensors
/// are numbered plants. One display function covers both, so formatting is
/// consistent across logs, events and displays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SensorId {
    Named(String),
    Plant(u32),
}

impl SensorId {
    /// Human-readable label used by notifications and displays.
    pub fn label(&self) -> String {
        match self {
            SensorId::Named(name) => {
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
            SensorId::Plant(id) => format!("Plant {id}"),
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorId::Named(name) => write!(f, "{name}"),
            SensorId::Plant(id) => write!(f, "{id}"),
        }
    }
}

impl From<MeasureName> for SensorId {
    fn from(name: MeasureName) -> Self {
        SensorId::Named(name.to_string())
    }
}

// On the wire a sensor name is either a JSON string (climate measure) or a
// JSON integer (plant id).
impl Serialize for SensorId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SensorId::Named(name) => serializer.serialize_str(name),
            SensorId::Plant(id) => serializer.serialize_u32(*id),
        }
    }
}

impl<'de> Deserialize<'de> for SensorId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Plant(u32),
            Named(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Plant(id) => SensorId::Plant(id),
            Raw::Named(name) => SensorId::Named(name),
        })
    }
}

// =============================================================================
// Measures
// =============================================================================

/// Measurement unit for sensor values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "°C")]
    Celsius,
    #[serde(rename = "%")]
    Percent,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Celsius => write!(f, "°C"),
            Unit::Percent => write!(f, "%"),
        }
    }
}

/// The two DHT22 measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureName {
    Temperature,
    Humidity,
}

impl MeasureName {
    pub const ALL: [MeasureName; 2] = [MeasureName::Temperature, MeasureName::Humidity];

    pub fn unit(&self) -> Unit {
        match self {
            MeasureName::Temperature => Unit::Celsius,
            MeasureName::Humidity => Unit::Percent,
        }
    }
}

impl fmt::Display for MeasureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureName::Temperature => write!(f, "temperature"),
            MeasureName::Humidity => write!(f, "humidity"),
        }
    }
}

/// Alert state for one sensor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertState {
    #[default]
    Ok,
    InAlert,
}

/// A single measured value with its unit and the display state derived by
/// the alert tracker. The state is never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub value: f64,
    pub unit: Unit,
    pub state: AlertState,
}

impl Measure {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self {
            value,
            unit,
            state: AlertState::Ok,
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Whether a threshold alerts below (`Min`) or above (`Max`) its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdKind {
    Min,
    Max,
}

// =============================================================================
// Notification backends
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationBackend {
    Gmail,
    Slack,
}

impl fmt::Display for NotificationBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationBackend::Gmail => write!(f, "gmail"),
            NotificationBackend::Slack => write!(f, "slack"),
        }
    }
}

impl FromStr for NotificationBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(NotificationBackend::Gmail),
            "slack" => Ok(NotificationBackend::Slack),
            other => Err(format!("unknown notification backend: {other}")),
        }
    }
}

// =============================================================================
// Settings keys
// =============================================================================

/// The closed catalog of runtime-configurable settings keys.
///
/// Unknown keys are rejected at the settings-store boundary; everything the
/// admin API can change is listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    TempMin,
    TempMax,
    HumidityMin,
    HumidityMax,
    MoistureDefault,
    MoisturePlant(u32),
    NotificationEnabled,
    NotificationBackends,
    RetentionDays,
}

/// Plants with a dedicated per-plant moisture threshold key.
pub const PLANT_IDS: [u32; 3] = [1, 2, 3];

impl SettingsKey {
    pub fn as_str(&self) -> String {
        match self {
            SettingsKey::TempMin => "threshold.temperature.min".to_string(),
            SettingsKey::TempMax => "threshold.temperature.max".to_string(),
            SettingsKey::HumidityMin => "threshold.humidity.min".to_string(),
            SettingsKey::HumidityMax => "threshold.humidity.max".to_string(),
            SettingsKey::MoistureDefault => "threshold.moisture.default".to_string(),
            SettingsKey::MoisturePlant(id) => format!("threshold.moisture.{id}"),
            SettingsKey::NotificationEnabled => "notification.enabled".to_string(),
            SettingsKey::NotificationBackends => "notification.backends".to_string(),
            SettingsKey::RetentionDays => "cleanup.retention_days".to_string(),
        }
    }

    /// Parse a stored key string back into the catalog. Returns `None` for
    /// keys outside the closed set.
    pub fn parse(raw: &str) -> Option<SettingsKey> {
        match raw {
            "threshold.temperature.min" => Some(SettingsKey::TempMin),
            "threshold.temperature.max" => Some(SettingsKey::TempMax),
            "threshold.humidity.min" => Some(SettingsKey::HumidityMin),
            "threshold.humidity.max" => Some(SettingsKey::HumidityMax),
            "threshold.moisture.default" => Some(SettingsKey::MoistureDefault),
            "notification.enabled" => Some(SettingsKey::NotificationEnabled),
            "notification.backends" => Some(SettingsKey::NotificationBackends),
            "cleanup.retention_days" => Some(SettingsKey::RetentionDays),
            other => {
                let id = other.strip_prefix("threshold.moisture.")?.parse().ok()?;
                if PLANT_IDS.contains(&id) {
                    Some(SettingsKey::MoisturePlant(id))
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_id_display_covers_both_variants() {
        assert_eq!(SensorId::Named("humidity".into()).to_string(), "humidity");
        assert_eq!(SensorId::Plant(2).to_string(), "2");
    }

    #[test]
    fn sensor_id_labels() {
        assert_eq!(SensorId::Named("temperature".into()).label(), "Temperature");
        assert_eq!(SensorId::Plant(3).label(), "Plant 3");
    }

    #[test]
    fn settings_key_round_trip() {
        let keys = [
            SettingsKey::TempMin,
            SettingsKey::TempMax,
            SettingsKey::HumidityMin,
            SettingsKey::HumidityMax,
            SettingsKey::MoistureDefault,
            SettingsKey::MoisturePlant(1),
            SettingsKey::MoisturePlant(3),
            SettingsKey::NotificationEnabled,
            SettingsKey::NotificationBackends,
            SettingsKey::RetentionDays,
        ];
        for key in keys {
            assert_eq!(SettingsKey::parse(&key.as_str()), Some(key));
        }
    }

    #[test]
    fn settings_key_rejects_unknown() {
        assert_eq!(SettingsKey::parse("threshold.moisture.9"), None);
        assert_eq!(SettingsKey::parse("threshold.pressure.min"), None);
        assert_eq!(SettingsKey::parse(""), None);
    }

    #[test]
    fn namespace_serde_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&Namespace::Dht).unwrap(), "\"dht\"");
        assert_eq!(serde_json::to_string(&Namespace::Pico).unwrap(), "\"pico\"");
    }

    #[test]
    fn backend_parse() {
        assert_eq!(
            "slack".parse::<NotificationBackend>().unwrap(),
            NotificationBackend::Slack
        );
        assert!("pager".parse::<NotificationBackend>().is_err());
    }
}
