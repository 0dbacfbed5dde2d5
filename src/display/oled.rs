// =============================================================================
// OLED Renderer — latest climate reading on every event
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::eventbus::{EventSubscriber, Topic};
use crate::settings::Settings;
use crate::shutdown::Shutdown;

/// Abstract SSD1306-class display.
pub trait OledDisplay: Send {
    fn clear(&mut self);
    fn render(&mut self, temperature: f64, humidity: f64);
    fn close(&mut self);
}

/// Development display: logs frames instead of driving I2C.
#[derive(Default)]
pub struct MockOledDisplay {
    pub last_frame: Option<(f64, f64)>,
}

impl OledDisplay for MockOledDisplay {
    fn clear(&mut self) {
        self.last_frame = None;
        debug!("oled cleared");
    }

    fn render(&mut self, temperature: f64, humidity: f64) {
        self.last_frame = Some((temperature, humidity));
        debug!(temperature, humidity, "oled frame");
    }

    fn close(&mut self) {
        self.clear();
    }
}

/// Render one `dht.reading` payload. Malformed events are dropped.
pub fn render_event(display: &mut dyn OledDisplay, payload: &serde_json::Value) {
    let temperature = payload.get("temperature").and_then(|v| v.as_f64());
    let humidity = payload.get("humidity").and_then(|v| v.as_f64());
    match (temperature, humidity) {
        (Some(temperature), Some(humidity)) => display.render(temperature, humidity),
        _ => warn!("malformed dht.reading event, not rendered"),
    }
}

/// Run the OLED service until shutdown.
pub async fn run_service(
    mut display: Box<dyn OledDisplay>,
    env: Settings,
    shutdown: Shutdown,
) -> Result<()> {
    let subscriber = EventSubscriber::new(&env.redis_url, &[Topic::DhtReading])?;
    display.clear();
    info!("oled service started");

    while !shutdown.is_requested() {
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
            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.wait() => break,
            };
            let Some((_topic, payload)) = next else {
                warn!("event bus stream ended, reconnecting in 5s");
                shutdown.sleep_interruptible(Duration::from_secs(5)).await;
                break;
            };
            render_event(display.as_mut(), &payload);
        }
    }

    display.close();
    info!("oled service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_valid_event() {
        let mut display = MockOledDisplay::default();
        render_event(
            &mut display,
            &serde_json::json!({"temperature": 21.5, "humidity": 55.0, "epoch": 0}),
        );
        assert_eq!(display.last_frame, Some((21.5, 55.0)));
    }

    #[test]
    fn malformed_event_leaves_display_untouched() {
        let mut display = MockOledDisplay::default();
        render_event(&mut display, &serde_json::json!({"temperature": "warm"}));
        render_event(&mut display, &serde_json::json!([1, 2, 3]));
        assert_eq!(display.last_frame, None);
    }
}
