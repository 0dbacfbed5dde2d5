// =============================================================================
// Threshold Rules — hysteresis-aware violation checks + effective settings
// =============================================================================
//
// A rule triggers at its plain threshold but clears asymmetrically: an
// active MIN rule needs the value to rise above `value + hysteresis`, an
// active MAX rule needs it to fall to `value - hysteresis` or below. The
// evaluator therefore needs the key's current alert state.
//
// Effective thresholds are the environment defaults overlaid with any
// runtime changes stored through the settings store, so an admin edit in
// one process reaches every polling loop within one cache TTL.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

use crate::db::settings_store::{SettingsMap, SettingsStore};
use crate::db::DbResult;
use crate::settings::{HysteresisSettings, NotificationSettings, Settings, ThresholdSettings};
use crate::types::{MeasureName, NotificationBackend, SettingsKey, ThresholdKind, PLANT_IDS};

// =============================================================================
// ThresholdRule
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdRule {
    pub kind: ThresholdKind,
    pub value: i64,
    pub hysteresis: i64,
}

impl ThresholdRule {
    pub fn new(kind: ThresholdKind, value: i64, hysteresis: i64) -> Self {
        Self {
            kind,
            value,
            hysteresis,
        }
    }

    /// Whether `value` violates this rule, given the committed alert state
    /// of the key the rule guards.
    pub fn is_violated(&self, value: f64, currently_in_alert: bool) -> bool {
        let threshold = self.value as f64;
        let hysteresis = self.hysteresis as f64;
        match self.kind {
            ThresholdKind::Min => {
                if currently_in_alert {
                    // Clears only once the value rises above threshold + band.
                    value <= threshold + hysteresis
                } else {
                    value < threshold
                }
            }
            ThresholdKind::Max => {
                if currently_in_alert {
                    // Clears only once the value falls to threshold - band.
                    value > threshold - hysteresis
                } else {
                    value > threshold
                }
            }
        }
    }
}

/// The MIN/MAX rule pair guarding one DHT measure.
pub type RuleMap = HashMap<MeasureName, [ThresholdRule; 2]>;

/// Build the DHT rule map from effective thresholds.
pub fn threshold_rules(thresholds: &ThresholdSettings, hysteresis: &HysteresisSettings) -> RuleMap {
    HashMap::from([
        (
            MeasureName::Temperature,
            [
                ThresholdRule::new(ThresholdKind::Min, thresholds.min_temperature, hysteresis.temperature),
                ThresholdRule::new(ThresholdKind::Max, thresholds.max_temperature, hysteresis.temperature),
            ],
        ),
        (
            MeasureName::Humidity,
            [
                ThresholdRule::new(ThresholdKind::Min, thresholds.min_humidity, hysteresis.humidity),
                ThresholdRule::new(ThresholdKind::Max, thresholds.max_humidity, hysteresis.humidity),
            ],
        ),
    ])
}

/// The MIN rule guarding one plant's moisture.
pub fn moisture_rule(
    thresholds: &ThresholdSettings,
    hysteresis: &HysteresisSettings,
    plant_id: u32,
) -> ThresholdRule {
    ThresholdRule::new(
        ThresholdKind::Min,
        thresholds.moisture_threshold(plant_id),
        hysteresis.moisture,
    )
}

// =============================================================================
// Effective settings (env defaults + DB overrides)
// =============================================================================

fn get_i64(map: &SettingsMap, key: SettingsKey, default: i64) -> i64 {
    match map.get(&key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, "unparseable stored setting, using default");
            default
        }),
        None => default,
    }
}

/// Threshold settings with runtime overrides applied.
pub async fn effective_thresholds(
    store: &SettingsStore,
    env: &Settings,
) -> DbResult<ThresholdSettings> {
    let map = store.get_all().await?;
    Ok(thresholds_from_map(&map, &env.thresholds))
}

/// Pure overlay used by both the async fetch and the admin API view.
pub fn thresholds_from_map(map: &SettingsMap, env: &ThresholdSettings) -> ThresholdSettings {
    let min_moisture = get_i64(map, SettingsKey::MoistureDefault, env.min_moisture);
    let plant_moisture = PLANT_IDS
        .iter()
        .map(|&plant_id| {
            (
                plant_id,
                get_i64(
                    map,
                    SettingsKey::MoisturePlant(plant_id),
                    env.moisture_threshold(plant_id),
                ),
            )
        })
        .collect();

    ThresholdSettings {
        max_temperature: get_i64(map, SettingsKey::TempMax, env.max_temperature),
        min_temperature: get_i64(map, SettingsKey::TempMin, env.min_temperature),
        max_humidity: get_i64(map, SettingsKey::HumidityMax, env.max_humidity),
        min_humidity: get_i64(map, SettingsKey::HumidityMin, env.min_humidity),
        min_moisture,
        plant_moisture,
    }
}

/// Notification settings with runtime overrides for enablement and the
/// backend list; credentials and retry policy stay environment-only.
pub async fn effective_notifications(
    store: &SettingsStore,
    env: &Settings,
) -> DbResult<NotificationSettings> {
    let map = store.get_all().await?;
    Ok(notifications_from_map(&map, &env.notifications))
}

pub fn notifications_from_map(
    map: &SettingsMap,
    env: &NotificationSettings,
) -> NotificationSettings {
    let enabled = match map.get(&SettingsKey::NotificationEnabled) {
        Some(raw) => raw == "1",
        None => env.enabled,
    };
    let backends = match map.get(&SettingsKey::NotificationBackends) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .filter_map(|t| match t.parse::<NotificationBackend>() {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!(error = %e, "ignoring unknown stored backend");
                    None
                }
            })
            .collect(),
        None => env.backends.clone(),
    };

    let mut resolved = env.clone();
    resolved.enabled = enabled;
    resolved.backends = backends;
    resolved
}

/// Retention days with runtime override, clamped to a sane floor.
pub async fn effective_retention_days(store: &SettingsStore, env: &Settings) -> DbResult<i64> {
    let map = store.get_all().await?;
    Ok(get_i64(&map, SettingsKey::RetentionDays, env.retention_days).max(1))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_rule_triggers_and_clears_with_hysteresis() {
        // Scenario S3 / law 4: MAX 25, hysteresis 1.
        let rule = ThresholdRule::new(ThresholdKind::Max, 25, 1);

        // Activation uses the plain threshold.
        assert!(!rule.is_violated(25.0, false));
        assert!(rule.is_violated(26.0, false));

        // Once active, 25 keeps it violated; only <= 24 clears.
        assert!(rule.is_violated(25.0, true));
        assert!(rule.is_violated(24.5, true));
        assert!(!rule.is_violated(24.0, true));
    }

    #[test]
    fn min_rule_triggers_and_clears_with_hysteresis() {
        let rule = ThresholdRule::new(ThresholdKind::Min, 40, 3);
        assert!(rule.is_violated(39.0, false));
        assert!(!rule.is_violated(40.0, false));

        // Active: must rise above 43 to clear.
        assert!(rule.is_violated(42.0, true));
        assert!(rule.is_violated(43.0, true));
        assert!(!rule.is_violated(43.5, true));
    }

    #[test]
    fn zero_hysteresis_is_symmetric() {
        let rule = ThresholdRule::new(ThresholdKind::Max, 65, 0);
        assert!(rule.is_violated(66.0, false));
        assert!(!rule.is_violated(65.0, true));
        assert!(rule.is_violated(65.5, true));
    }

    fn env_thresholds() -> ThresholdSettings {
        ThresholdSettings {
            max_temperature: 25,
            min_temperature: 18,
            max_humidity: 65,
            min_humidity: 40,
            min_moisture: 30,
            plant_moisture: HashMap::from([(1, 30), (2, 35), (3, 30)]),
        }
    }

    #[test]
    fn overlay_prefers_stored_values() {
        let map = SettingsMap::from([
            (SettingsKey::TempMax, "30".to_string()),
            (SettingsKey::MoisturePlant(2), "50".to_string()),
        ]);
        let effective = thresholds_from_map(&map, &env_thresholds());
        assert_eq!(effective.max_temperature, 30);
        assert_eq!(effective.min_temperature, 18); // env default kept
        assert_eq!(effective.moisture_threshold(2), 50);
        assert_eq!(effective.moisture_threshold(1), 30);
    }

    #[test]
    fn overlay_falls_back_on_unparseable_values() {
        let map = SettingsMap::from([(SettingsKey::TempMax, "warm".to_string())]);
        let effective = thresholds_from_map(&map, &env_thresholds());
        assert_eq!(effective.max_temperature, 25);
    }

    #[test]
    fn rule_map_covers_both_measures() {
        let rules = threshold_rules(
            &env_thresholds(),
            &HysteresisSettings {
                temperature: 1,
                humidity: 3,
                moisture: 3,
            },
        );
        let temp_rules = &rules[&MeasureName::Temperature];
        assert_eq!(temp_rules[0].kind, ThresholdKind::Min);
        assert_eq!(temp_rules[1].value, 25);
        assert_eq!(rules[&MeasureName::Humidity][0].hysteresis, 3);
    }

    #[test]
    fn notifications_overlay() {
        let env = NotificationSettings {
            enabled: false,
            backends: vec![NotificationBackend::Gmail],
            gmail: crate::settings::GmailSettings {
                sender: String::new(),
                recipients: String::new(),
                username: String::new(),
                password: String::new(),
            },
            slack: crate::settings::SlackSettings {
                webhook_url: String::new(),
            },
            max_retries: 3,
            initial_backoff_sec: 2,
            timeout_sec: 30,
        };
        let map = SettingsMap::from([
            (SettingsKey::NotificationEnabled, "1".to_string()),
            (SettingsKey::NotificationBackends, "slack, gmail".to_string()),
        ]);
        let resolved = notifications_from_map(&map, &env);
        assert!(resolved.enabled);
        assert_eq!(
            resolved.backends,
            vec![NotificationBackend::Slack, NotificationBackend::Gmail]
        );
    }
}
