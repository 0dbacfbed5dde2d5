// =============================================================================
// Environment Settings — typed configuration for every service
// =============================================================================
//
// All processes read the same `.env`-backed environment. Parsing happens
// once at startup into a typed tree; cross-field constraints are validated
// up front and *all* violations are reported together, so a broken deploy
// fails fast with one actionable error instead of dying one knob at a time.
//
// Threshold values here are the environment *defaults*; the settings store
// (db/settings_store.rs) overlays runtime changes made via the admin API.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::types::{NotificationBackend, PLANT_IDS};

// DHT22 physical bounds. Readings outside these are sensor faults.
pub const TEMPERATURE_BOUNDS: (i64, i64) = (-40, 80);
pub const HUMIDITY_BOUNDS: (i64, i64) = (0, 100);
pub const MOISTURE_BOUNDS: (i64, i64) = (0, 100);

/// Consecutive like decisions required before the alert tracker commits a
/// state change.
const DEFAULT_CONFIRMATION_COUNT: u32 = 3;

// Hysteresis offsets for alert recovery. Alert triggers at the threshold,
// clears at threshold +/- hysteresis.
const DEFAULT_HYSTERESIS_TEMPERATURE: i64 = 1; // °C
const DEFAULT_HYSTERESIS_HUMIDITY: i64 = 3; // %
const DEFAULT_HYSTERESIS_MOISTURE: i64 = 3; // %

// Spike rejection: a jump to 100% moisture larger than this versus the
// previous sample is treated as a sensor fault.
const DEFAULT_SPIKE_THRESHOLD_MOISTURE: f64 = 20.0;

// =============================================================================
// Sub-trees
// =============================================================================

#[derive(Debug, Clone)]
pub struct ThresholdSettings {
    pub max_temperature: i64,
    pub min_temperature: i64,
    pub max_humidity: i64,
    pub min_humidity: i64,
    pub min_moisture: i64,
    pub plant_moisture: HashMap<u32, i64>,
}

impl ThresholdSettings {
    /// Moisture threshold for a plant, falling back to the default.
    pub fn moisture_threshold(&self, plant_id: u32) -> i64 {
        self.plant_moisture
            .get(&plant_id)
            .copied()
            .unwrap_or(self.min_moisture)
    }
}

#[derive(Debug, Clone)]
pub struct HysteresisSettings {
    pub temperature: i64,
    pub humidity: i64,
    pub moisture: i64,
}

#[derive(Debug, Clone)]
pub struct GmailSettings {
    pub sender: String,
    /// Comma-separated recipient list.
    pub recipients: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SlackSettings {
    pub webhook_url: String,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub backends: Vec<NotificationBackend>,
    pub gmail: GmailSettings,
    pub slack: SlackSettings,
    pub max_retries: u32,
    pub initial_backoff_sec: u64,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct PicoSettings {
    pub serial_port: String,
    pub serial_baud: u32,
    pub serial_timeout_sec: f64,
    pub spike_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub confirmation_count: u32,
}

#[derive(Debug, Clone)]
pub struct HumidifierSettings {
    pub enabled: bool,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct OledSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LcdSettings {
    pub enabled: bool,
    pub i2c_address: u8,
    pub cols: usize,
    pub rows: usize,
    pub scroll_delay_sec: f64,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
}

// =============================================================================
// Settings
// =============================================================================

/// Application settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: String,
    pub db_timeout_sec: f64,
    pub db_pool_size: usize,
    pub mock_sensors: bool,
    pub polling_frequency_sec: u64,
    pub retention_days: i64,
    pub redis_url: String,
    pub admin_password: Option<String>,
    pub thresholds: ThresholdSettings,
    pub hysteresis: HysteresisSettings,
    pub notifications: NotificationSettings,
    pub pico: PicoSettings,
    pub alerts: AlertSettings,
    pub humidifier: HumidifierSettings,
    pub oled: OledSettings,
    pub lcd: LcdSettings,
    pub server: ServerSettings,
}

/// Read an environment variable, parsing into `T`, using `default` when the
/// variable is unset or empty. A present-but-unparseable value is recorded
/// in `errors`.
fn var_or<T: FromStr + Clone>(key: &str, default: T, errors: &mut Vec<String>) -> T {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                errors.push(format!("{key}: cannot parse '{}'", raw.trim()));
                default
            }
        },
        _ => default,
    }
}

fn var_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Booleans arrive as "1"/"0" from the environment.
fn var_flag(key: &str) -> bool {
    var_string(key, "0") == "1"
}

fn var_hex_u8(key: &str, default: u8, errors: &mut Vec<String>) -> u8 {
    let raw = var_string(key, "");
    if raw.is_empty() {
        return default;
    }
    let parsed = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .map(|hex| u8::from_str_radix(hex, 16))
        .unwrap_or_else(|| raw.parse());
    match parsed {
        Ok(value) => value,
        Err(_) => {
            errors.push(format!("{key}: cannot parse '{raw}'"));
            default
        }
    }
}

impl Settings {
    /// Load and validate settings from the environment.
    ///
    /// Returns an error listing every violated constraint; callers treat
    /// that as fatal (process exits non-zero before touching hardware).
    pub fn from_env() -> Result<Self> {
        let mut errors: Vec<String> = Vec::new();

        let min_moisture = var_or("MIN_MOISTURE", 30, &mut errors);
        let mut plant_moisture = HashMap::new();
        for plant_id in PLANT_IDS {
            let key = format!("MIN_MOISTURE_PLANT_{plant_id}");
            plant_moisture.insert(plant_id, var_or(&key, min_moisture, &mut errors));
        }

        let thresholds = ThresholdSettings {
            max_temperature: var_or("MAX_TEMPERATURE", 25, &mut errors),
            min_temperature: var_or("MIN_TEMPERATURE", 18, &mut errors),
            max_humidity: var_or("MAX_HUMIDITY", 65, &mut errors),
            min_humidity: var_or("MIN_HUMIDITY", 40, &mut errors),
            min_moisture,
            plant_moisture,
        };

        let hysteresis = HysteresisSettings {
            temperature: var_or("HYSTERESIS_TEMPERATURE", DEFAULT_HYSTERESIS_TEMPERATURE, &mut errors),
            humidity: var_or("HYSTERESIS_HUMIDITY", DEFAULT_HYSTERESIS_HUMIDITY, &mut errors),
            moisture: var_or("HYSTERESIS_MOISTURE", DEFAULT_HYSTERESIS_MOISTURE, &mut errors),
        };

        let backends_raw = var_string("NOTIFICATION_BACKENDS", "gmail");
        let mut backends = Vec::new();
        for token in backends_raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.parse::<NotificationBackend>() {
                Ok(backend) => backends.push(backend),
                Err(e) => errors.push(format!("NOTIFICATION_BACKENDS: {e}")),
            }
        }

        let notifications = NotificationSettings {
            enabled: var_flag("ENABLE_NOTIFICATION_SERVICE"),
            backends,
            gmail: GmailSettings {
                sender: var_string("GMAIL_SENDER", ""),
                recipients: var_string("GMAIL_RECIPIENTS", ""),
                username: var_string("GMAIL_USERNAME", ""),
                password: var_string("GMAIL_PASSWORD", ""),
            },
            slack: SlackSettings {
                webhook_url: var_string("SLACK_WEBHOOK_URL", ""),
            },
            max_retries: var_or("NOTIFICATION_MAX_RETRIES", 3, &mut errors),
            initial_backoff_sec: var_or("NOTIFICATION_INITIAL_BACKOFF_SEC", 2, &mut errors),
            timeout_sec: var_or("NOTIFICATION_TIMEOUT_SEC", 30, &mut errors),
        };

        let settings = Settings {
            db_path: var_string("DB_PATH", "verdant.sqlite3"),
            db_timeout_sec: var_or("DB_TIMEOUT_SEC", 30.0, &mut errors),
            db_pool_size: var_or("DB_POOL_SIZE", 5, &mut errors),
            mock_sensors: var_flag("MOCK_SENSORS"),
            polling_frequency_sec: var_or("POLLING_FREQUENCY_SEC", 2, &mut errors),
            retention_days: var_or("RETENTION_DAYS", 7, &mut errors),
            redis_url: var_string("REDIS_URL", "redis://localhost:6379/0"),
            admin_password: std::env::var("ADMIN_PASSWORD").ok().filter(|v| !v.is_empty()),
            thresholds,
            hysteresis,
            notifications,
            pico: PicoSettings {
                serial_port: var_string("PICO_SERIAL_PORT", "/dev/ttyACM0"),
                serial_baud: var_or("PICO_SERIAL_BAUD", 115_200, &mut errors),
                serial_timeout_sec: var_or("PICO_SERIAL_TIMEOUT_SEC", 30.0, &mut errors),
                spike_threshold: var_or(
                    "PICO_SPIKE_THRESHOLD",
                    DEFAULT_SPIKE_THRESHOLD_MOISTURE,
                    &mut errors,
                ),
            },
            alerts: AlertSettings {
                confirmation_count: var_or(
                    "ALERT_CONFIRMATION_COUNT",
                    DEFAULT_CONFIRMATION_COUNT,
                    &mut errors,
                ),
            },
            humidifier: HumidifierSettings {
                enabled: var_flag("ENABLE_HUMIDIFIER"),
                host: var_string("HUMIDIFIER_HOST", ""),
            },
            oled: OledSettings {
                enabled: var_flag("ENABLE_OLED"),
            },
            lcd: LcdSettings {
                enabled: var_flag("ENABLE_LCD"),
                i2c_address: var_hex_u8("LCD_I2C_ADDRESS", 0x27, &mut errors),
                cols: var_or("LCD_COLS", 16, &mut errors),
                rows: var_or("LCD_ROWS", 2, &mut errors),
                scroll_delay_sec: var_or("LCD_SCROLL_DELAY_SEC", 0.7, &mut errors),
            },
            server: ServerSettings {
                bind_addr: var_string("SERVER_BIND_ADDR", "0.0.0.0:8000"),
            },
        };

        settings.validate(&mut errors);

        if !errors.is_empty() {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
        Ok(settings)
    }

    /// Cross-field constraints; individual bounds, MIN < MAX pairs,
    /// hysteresis band overlap, and notification credentials.
    fn validate(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        let h = &self.hysteresis;

        check_bounds("MIN_TEMPERATURE", t.min_temperature, TEMPERATURE_BOUNDS, errors);
        check_bounds("MAX_TEMPERATURE", t.max_temperature, TEMPERATURE_BOUNDS, errors);
        check_bounds("MIN_HUMIDITY", t.min_humidity, HUMIDITY_BOUNDS, errors);
        check_bounds("MAX_HUMIDITY", t.max_humidity, HUMIDITY_BOUNDS, errors);
        check_bounds("MIN_MOISTURE", t.min_moisture, MOISTURE_BOUNDS, errors);
        for (plant_id, value) in &t.plant_moisture {
            check_bounds(
                &format!("MIN_MOISTURE_PLANT_{plant_id}"),
                *value,
                MOISTURE_BOUNDS,
                errors,
            );
        }

        check_pair(
            "TEMPERATURE",
            t.min_temperature,
            t.max_temperature,
            h.temperature,
            errors,
        );
        check_pair("HUMIDITY", t.min_humidity, t.max_humidity, h.humidity, errors);

        if h.temperature < 0 || h.humidity < 0 || h.moisture < 0 {
            errors.push("hysteresis offsets must be >= 0".to_string());
        }

        if self.retention_days < 1 {
            errors.push(format!(
                "RETENTION_DAYS ({}) must be >= 1",
                self.retention_days
            ));
        }
        if self.db_pool_size == 0 {
            errors.push("DB_POOL_SIZE must be >= 1".to_string());
        }

        if self.notifications.enabled {
            let n = &self.notifications;
            if n.backends.contains(&NotificationBackend::Gmail) {
                let mut missing = Vec::new();
                if n.gmail.sender.is_empty() {
                    missing.push("GMAIL_SENDER");
                }
                if n.gmail.recipients.is_empty() {
                    missing.push("GMAIL_RECIPIENTS");
                }
                if n.gmail.username.is_empty() {
                    missing.push("GMAIL_USERNAME");
                }
                if n.gmail.password.is_empty() {
                    missing.push("GMAIL_PASSWORD");
                }
                if !missing.is_empty() {
                    errors.push(format!("Gmail enabled but missing: {}", missing.join(", ")));
                }
            }
            if n.backends.contains(&NotificationBackend::Slack)
                && n.slack.webhook_url.is_empty()
            {
                errors.push("Slack enabled but SLACK_WEBHOOK_URL is not set".to_string());
            }
        }
    }
}

#[cfg(test)]
impl Settings {
    /// Baseline settings for module tests: mock sensors, a caller-chosen
    /// database path, and a broker URL nothing listens on.
    pub(crate) fn for_tests(db_path: &str) -> Self {
        Settings {
            db_path: db_path.to_string(),
            db_timeout_sec: 5.0,
            db_pool_size: 5,
            mock_sensors: true,
            polling_frequency_sec: 2,
            retention_days: 7,
            redis_url: "redis://127.0.0.1:1/0".into(),
            admin_password: None,
            thresholds: ThresholdSettings {
                max_temperature: 25,
                min_temperature: 18,
                max_humidity: 65,
                min_humidity: 40,
                min_moisture: 30,
                plant_moisture: HashMap::from([(1, 30), (2, 35), (3, 30)]),
            },
            hysteresis: HysteresisSettings {
                temperature: 1,
                humidity: 3,
                moisture: 3,
            },
            notifications: NotificationSettings {
                enabled: false,
                backends: vec![NotificationBackend::Gmail],
                gmail: GmailSettings {
                    sender: String::new(),
                    recipients: String::new(),
                    username: String::new(),
                    password: String::new(),
                },
                slack: SlackSettings {
                    webhook_url: String::new(),
                },
                max_retries: 3,
                initial_backoff_sec: 2,
                timeout_sec: 30,
            },
            pico: PicoSettings {
                serial_port: "/dev/ttyACM0".into(),
                serial_baud: 115_200,
                serial_timeout_sec: 30.0,
                spike_threshold: 20.0,
            },
            alerts: AlertSettings {
                confirmation_count: 3,
            },
            humidifier: HumidifierSettings {
                enabled: false,
                host: String::new(),
            },
            oled: OledSettings { enabled: false },
            lcd: LcdSettings {
                enabled: false,
                i2c_address: 0x27,
                cols: 16,
                rows: 2,
                scroll_delay_sec: 0.7,
            },
            server: ServerSettings {
                bind_addr: "127.0.0.1:0".into(),
            },
        }
    }
}

fn check_bounds(name: &str, value: i64, (lo, hi): (i64, i64), errors: &mut Vec<String>) {
    if value < lo || value > hi {
        errors.push(format!("{name} ({value}) must be within [{lo}, {hi}]"));
    }
}

/// MIN < MAX, and neither hysteresis band may cross the paired threshold:
/// a MIN rule clears at min+h, a MAX rule clears at max-h, so both bands
/// must leave a gap between them.
fn check_pair(axis: &str, min: i64, max: i64, hysteresis: i64, errors: &mut Vec<String>) {
    if min >= max {
        errors.push(format!(
            "MIN_{axis} ({min}) must be less than MAX_{axis} ({max})"
        ));
        return;
    }
    if min + hysteresis >= max || max - hysteresis <= min {
        errors.push(format!(
            "{axis} hysteresis ({hysteresis}) overlaps the opposite threshold (min={min}, max={max})"
        ));
    }
}

// =============================================================================
// Tests
// =============================================================================
