// =============================================================================
// LCD Alert Panel — active alerts with a scrolling bottom row
// =============================================================================
//
// Maintains the set of currently-active alerts keyed by
// `namespace:sensor`, adding on alert events and removing on resolutions.
// The top row shows the alert count; the bottom row scrolls the joined
// alert labels at a configured cadence. With no active alerts the panel
// shows an idle "All OK" screen.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::eventbus::{parse_alert_event, AlertEvent, EventSubscriber, Topic};
use crate::settings::Settings;
use crate::shutdown::Shutdown;
use crate::types::{Namespace, SensorId};

const ALERT_SEPARATOR: &str = " | ";

/// Abstract 16x2-class character LCD.
pub trait LcdScreen: Send {
    fn write_rows(&mut self, top: &str, bottom: &str);
    fn clear(&mut self);
    fn close(&mut self);
}

/// Development screen: logs rows instead of driving I2C.
#[derive(Default)]
pub struct MockLcdScreen {
    pub rows: Option<(String, String)>,
}

impl LcdScreen for MockLcdScreen {
    fn write_rows(&mut self, top: &str, bottom: &str) {
        self.rows = Some((top.to_string(), bottom.to_string()));
        debug!(top, bottom, "lcd frame");
    }

    fn clear(&mut self) {
        self.rows = None;
    }

    fn close(&mut self) {
        self.clear();
    }
}

// =============================================================================
// Formatting
// =============================================================================

/// Compact per-alert label that fits a 16-column row.
pub fn format_alert(event: &AlertEvent) -> String {
    match (&event.namespace, &event.sensor_name) {
        (Namespace::Pico, SensorId::Plant(id)) => format!("P{id} dry"),
        (Namespace::Dht, SensorId::Named(name)) => {
            let low = matches!(event.threshold, Some(t) if event.value < t);
            let short = match name.as_str() {
                "temperature" => "Temp",
                "humidity" => "Humid",
                other => other,
            };
            if low {
                format!("{short} low")
            } else {
                format!("{short} high")
            }
        }
        (_, sensor) => sensor.to_string(),
    }
}

// =============================================================================
// Panel state
// =============================================================================

/// Active-alert map plus scroll position for the bottom row.
pub struct AlertPanel {
    cols: usize,
    // BTreeMap keeps row order stable between redraws.
    active: BTreeMap<String, String>,
    scroll_text: String,
    scroll_pos: usize,
}

impl AlertPanel {
    pub fn new(cols: usize) -> Self {
        Self {
            cols,
            active: BTreeMap::new(),
            scroll_text: String::new(),
            scroll_pos: 0,
        }
    }

    fn alert_key(event: &AlertEvent) -> String {
        format!("{}:{}", event.namespace, event.sensor_name)
    }

    /// Apply one alert event, returning whether the panel changed.
    pub fn handle_event(&mut self, event: &AlertEvent) -> bool {
        let key = Self::alert_key(event);
        let changed = if event.is_resolved {
            self.active.remove(&key).is_some()
        } else {
            self.active.insert(key, format_alert(event));
            true
        };
        if changed {
            self.rebuild_scroll_text();
        }
        changed
    }

    fn rebuild_scroll_text(&mut self) {
        self.scroll_text = self
            .active
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join(ALERT_SEPARATOR);
        // Trailing separator makes the wrap-around seamless.
        if self.scroll_text.len() > self.cols {
            self.scroll_text.push_str(ALERT_SEPARATOR);
        }
        self.scroll_pos = 0;
    }

    pub fn has_alerts(&self) -> bool {
        !self.active.is_empty()
    }

    /// Advance the scroll window one character. No-op when the text fits.
    pub fn scroll_step(&mut self) {
        if self.scroll_text.len() > self.cols {
            self.scroll_pos = (self.scroll_pos + 1) % self.scroll_text.len();
        }
    }

    fn bottom_row(&self) -> String {
        if self.scroll_text.len() <= self.cols {
            return format!("{:^width$}", self.scroll_text, width = self.cols);
        }
        let doubled: Vec<char> = self.scroll_text.chars().chain(self.scroll_text.chars()).collect();
        let window: String = doubled[self.scroll_pos..self.scroll_pos + self.cols]
            .iter()
            .collect();
        window
    }

    /// Render the current state to the screen.
    pub fn render(&self, screen: &mut dyn LcdScreen) {
        if self.active.is_empty() {
            screen.write_rows(
                &format!("{:^width$}", "STATUS", width = self.cols),
                &format!("{:^width$}", "All OK", width = self.cols),
            );
        } else {
            screen.write_rows(
                &format!("{:<width$}", format!("ALERTS: {}", self.active.len()), width = self.cols),
                &self.bottom_row(),
            );
        }
    }
}

// =============================================================================
// Service loop
// =============================================================================

/// Run the LCD service until shutdown: alert events update the panel, a
/// ticker advances the scroll.
pub async fn run_service(
    mut screen: Box<dyn LcdScreen>,
    env: Settings,
    shutdown: Shutdown,
) -> Result<()> {
    let subscriber = EventSubscriber::new(&env.redis_url, &[Topic::Alert])?;
    let mut panel = AlertPanel::new(env.lcd.cols);
    let mut scroll = tokio::time::interval(Duration::from_secs_f64(env.lcd.scroll_delay_sec));

    panel.render(screen.as_mut());
    info!("lcd service started");

    'outer: while !shutdown.is_requested() {
        let mut stream = match subscriber.stream().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "event bus connection failed, retrying in 5s");
                if shutdown.sleep_interruptible(Duration::from_secs(5)).await {
                    break;
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                next = stream.next() => {
                    let Some((_topic, payload)) = next else {
                        warn!("event bus stream ended, reconnecting in 5s");
                        shutdown.sleep_interruptible(Duration::from_secs(5)).await;
                        break;
                    };
                    if let Some(event) = parse_alert_event(&payload) {
                        if panel.handle_event(&event) {
                            panel.render(screen.as_mut());
                        }
                    }
                }
                _ = scroll.tick() => {
                    if panel.has_alerts() {
                        panel.scroll_step();
                        panel.render(screen.as_mut());
                    }
                }
                _ = shutdown.wait() => break 'outer,
            }
        }
    }

    screen.close();
    info!("lcd service stopped");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
