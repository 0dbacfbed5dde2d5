// =============================================================================
// Request Validation — query params and admin settings payloads
// =============================================================================

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::db::settings_store::SettingsMap;
use crate::settings::{
    Settings, HUMIDITY_BOUNDS, MOISTURE_BOUNDS, TEMPERATURE_BOUNDS,
};
use crate::types::{NotificationBackend, SettingsKey, PLANT_IDS};
use crate::utils::utc_now;

pub const MIN_HOURS: i64 = 1;
pub const MAX_HOURS: i64 = 24;
pub const DEFAULT_HOURS: i64 = 3;

pub const RETENTION_RANGE: (i64, i64) = (1, 365);

/// Parse the `hours` query parameter. Missing means the default; anything
/// unparseable or out of range is a client error.
pub fn parse_hours(raw: Option<&str>) -> Result<(i64, NaiveDateTime), String> {
    let hours = match raw {
        None => DEFAULT_HOURS,
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| "Parameter needs to be an integer".to_string())?,
    };
    if !(MIN_HOURS..=MAX_HOURS).contains(&hours) {
        return Err(format!("Hours must be between {MIN_HOURS} and {MAX_HOURS}"));
    }
    Ok((hours, utc_now() - chrono::Duration::hours(hours)))
}

// =============================================================================
// Admin settings payload
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminSettingsRequest {
    #[serde(default)]
    pub thresholds: ThresholdsRequest,
    #[serde(default)]
    pub notifications: NotificationsRequest,
    #[serde(default)]
    pub cleanup: CleanupRequest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdsRequest {
    #[serde(default)]
    pub temperature: RangeRequest,
    #[serde(default)]
    pub humidity: RangeRequest,
    #[serde(default)]
    pub moisture: MoistureRequest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeRequest {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoistureRequest {
    pub default: Option<i64>,
    #[serde(rename = "1")]
    pub plant_1: Option<i64>,
    #[serde(rename = "2")]
    pub plant_2: Option<i64>,
    #[serde(rename = "3")]
    pub plant_3: Option<i64>,
}

impl MoistureRequest {
    fn plant(&self, plant_id: u32) -> Option<i64> {
        match plant_id {
            1 => self.plant_1,
            2 => self.plant_2,
            3 => self.plant_3,
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationsRequest {
    pub enabled: Option<bool>,
    pub backends: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupRequest {
    #[serde(rename = "retentionDays")]
    pub retention_days: Option<i64>,
}

fn check_range(
    axis: &str,
    value: Option<i64>,
    field: &str,
    (lo, hi): (i64, i64),
    errors: &mut Vec<String>,
) {
    if let Some(value) = value {
        if value < lo || value > hi {
            errors.push(format!("{axis}.{field}: must be within [{lo}, {hi}]"));
        }
    }
}

fn check_min_max(axis: &str, range: &RangeRequest, hysteresis: i64, errors: &mut Vec<String>) {
    if let (Some(min), Some(max)) = (range.min, range.max) {
        if min >= max {
            errors.push(format!("{axis}: min must be less than max"));
        } else if min + hysteresis >= max || max - hysteresis <= min {
            errors.push(format!(
                "{axis}: hysteresis band ({hysteresis}) overlaps the opposite threshold"
            ));
        }
    }
}

impl AdminSettingsRequest {
    /// Validate every constraint, returning the full error list.
    pub fn validate(&self, env: &Settings) -> Vec<String> {
        let mut errors = Vec::new();
        let t = &self.thresholds;

        check_range("temperature", t.temperature.min, "min", TEMPERATURE_BOUNDS, &mut errors);
        check_range("temperature", t.temperature.max, "max", TEMPERATURE_BOUNDS, &mut errors);
        check_range("humidity", t.humidity.min, "min", HUMIDITY_BOUNDS, &mut errors);
        check_range("humidity", t.humidity.max, "max", HUMIDITY_BOUNDS, &mut errors);
        check_range("moisture", t.moisture.default, "default", MOISTURE_BOUNDS, &mut errors);
        for plant_id in PLANT_IDS {
            check_range(
                "moisture",
                t.moisture.plant(plant_id),
                &plant_id.to_string(),
                MOISTURE_BOUNDS,
                &mut errors,
            );
        }

        check_min_max("temperature", &t.temperature, env.hysteresis.temperature, &mut errors);
        check_min_max("humidity", &t.humidity, env.hysteresis.humidity, &mut errors);

        if let Some(backends) = &self.notifications.backends {
            for backend in backends {
                if backend.parse::<NotificationBackend>().is_err() {
                    errors.push(format!("notifications.backends: invalid backend '{backend}'"));
                }
            }
        }

        if let Some(retention) = self.cleanup.retention_days {
            let (lo, hi) = RETENTION_RANGE;
            if retention < lo || retention > hi {
                errors.push(format!("cleanup.retentionDays: must be within [{lo}, {hi}]"));
            }
        }

        errors
    }

    /// Flatten the validated payload into settings-store updates. Only
    /// fields present in the payload are written.
    pub fn to_updates(&self) -> SettingsMap {
        let mut updates = SettingsMap::new();
        let t = &self.thresholds;

        let entries: Vec<(SettingsKey, Option<i64>)> = vec![
            (SettingsKey::TempMin, t.temperature.min),
            (SettingsKey::TempMax, t.temperature.max),
            (SettingsKey::HumidityMin, t.humidity.min),
            (SettingsKey::HumidityMax, t.humidity.max),
            (SettingsKey::MoistureDefault, t.moisture.default),
            (SettingsKey::MoisturePlant(1), t.moisture.plant_1),
            (SettingsKey::MoisturePlant(2), t.moisture.plant_2),
            (SettingsKey::MoisturePlant(3), t.moisture.plant_3),
            (SettingsKey::RetentionDays, self.cleanup.retention_days),
        ];
        for (key, value) in entries {
            if let Some(value) = value {
                updates.insert(key, value.to_string());
            }
        }

        if let Some(enabled) = self.notifications.enabled {
            updates.insert(
                SettingsKey::NotificationEnabled,
                if enabled { "1" } else { "0" }.to_string(),
            );
        }
        if let Some(backends) = &self.notifications.backends {
            updates.insert(SettingsKey::NotificationBackends, backends.join(","));
        }

        updates
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_default_and_bounds() {
        assert_eq!(parse_hours(None).unwrap().0, DEFAULT_HOURS);
        assert_eq!(parse_hours(Some("24")).unwrap().0, 24);
        assert!(parse_hours(Some("0")).is_err());
        assert!(parse_hours(Some("25")).is_err());
        assert!(parse_hours(Some("three")).is_err());
        assert!(parse_hours(Some("")).is_err());
    }

    #[test]
    fn hours_window_is_in_the_past() {
        let (hours, from_time) = parse_hours(Some("3")).unwrap();
        assert_eq!(hours, 3);
        assert!(from_time < utc_now());
    }

    fn env() -> Settings {
        Settings::for_tests("unused.sqlite3")
    }

    #[test]
    fn min_above_max_is_named_in_errors() {
        // Scenario S6: {temperature: {min: 30, max: 25}} -> error naming
        // the MIN < MAX rule.
        let request: AdminSettingsRequest = serde_json::from_value(serde_json::json!({
            "thresholds": {"temperature": {"min": 30, "max": 25}}
        }))
        .unwrap();
        let errors = request.validate(&env());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("temperature"));
        assert!(errors[0].contains("min must be less than max"));
    }

    #[test]
    fn out_of_bounds_values_are_rejected() {
        let request: AdminSettingsRequest = serde_json::from_value(serde_json::json!({
            "thresholds": {
                "temperature": {"max": 120},
                "humidity": {"min": -5},
                "moisture": {"2": 101}
            },
            "cleanup": {"retentionDays": 500}
        }))
        .unwrap();
        let errors = request.validate(&env());
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let request: AdminSettingsRequest = serde_json::from_value(serde_json::json!({
            "notifications": {"backends": ["gmail", "pager"]}
        }))
        .unwrap();
        let errors = request.validate(&env());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("pager"));
    }

    #[test]
    fn overlapping_band_is_rejected() {
        let request: AdminSettingsRequest = serde_json::from_value(serde_json::json!({
            "thresholds": {"humidity": {"min": 60, "max": 62}}
        }))
        .unwrap();
        let errors = request.validate(&env());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("hysteresis"));
    }

    #[test]
    fn valid_payload_maps_to_updates() {
        let request: AdminSettingsRequest = serde_json::from_value(serde_json::json!({
            "thresholds": {
                "temperature": {"min": 16, "max": 28},
                "moisture": {"default": 35, "2": 45}
            },
            "notifications": {"enabled": true, "backends": ["slack"]},
            "cleanup": {"retentionDays": 14}
        }))
        .unwrap();
        assert!(request.validate(&env()).is_empty());

        let updates = request.to_updates();
        assert_eq!(updates.get(&SettingsKey::TempMin).map(String::as_str), Some("16"));
        assert_eq!(updates.get(&SettingsKey::TempMax).map(String::as_str), Some("28"));
        assert_eq!(
            updates.get(&SettingsKey::MoisturePlant(2)).map(String::as_str),
            Some("45")
        );
        assert_eq!(
            updates.get(&SettingsKey::NotificationEnabled).map(String::as_str),
            Some("1")
        );
        assert_eq!(
            updates.get(&SettingsKey::NotificationBackends).map(String::as_str),
            Some("slack")
        );
        assert_eq!(
            updates.get(&SettingsKey::RetentionDays).map(String::as_str),
            Some("14")
        );
        // Absent fields are not written.
        assert!(!updates.contains_key(&SettingsKey::HumidityMin));
        assert!(!updates.contains_key(&SettingsKey::MoisturePlant(1)));
    }

    #[test]
    fn empty_payload_is_valid_and_maps_to_nothing() {
        let request: AdminSettingsRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(request.validate(&env()).is_empty());
        assert!(request.to_updates().is_empty());
    }

    #[test]
    fn unknown_payload_fields_are_rejected_at_parse() {
        let result: Result<AdminSettingsRequest, _> =
            serde_json::from_value(serde_json::json!({"threshold": {}}));
        assert!(result.is_err());
    }
}
