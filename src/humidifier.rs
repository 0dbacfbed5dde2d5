// =============================================================================
// Humidifier Service — smart-plug automation driven by humidity alerts
// =============================================================================
//
// Subscribes to `alert` and reacts only to low-humidity alerts from the
// climate sensor (and their resolutions): ON when humidity drops below the
// minimum threshold, OFF when it recovers. High-humidity alerts are
// ignored. Successful switches publish `humidifier.state` and store the
// last state under a broker key so the dashboard can show it on connect.
//
// Safety invariant: every exit path turns the plug OFF before
// disconnecting (`turn_off_on_close` is always true for a humidifier — a
// plug left ON with nobody watching the humidity is a flood risk the
// other way).
//
// The plug protocol driver is an external collaborator behind `SmartPlug`.
// =============================================================================

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tracing::{error, info, warn};

use crate::eventbus::{
    parse_alert_event, AlertEvent, EventPublisher, EventSubscriber, HumidifierStateEvent, Topic,
};
use crate::retry::RetryPolicy;
use crate::settings::Settings;
use crate::shutdown::Shutdown;
use crate::types::Namespace;
use crate::utils::utc_now;

/// Broker key carrying the last published humidifier state (JSON).
pub const HUMIDIFIER_STATE_KEY: &str = "verdant:humidifier:last_state";

// =============================================================================
// Plug abstraction
// =============================================================================

#[async_trait]
pub trait SmartPlug: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn turn_on(&mut self) -> Result<()>;
    async fn turn_off(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Mock plug for development without hardware.
#[derive(Default)]
pub struct MockSmartPlug {
    connected: bool,
    pub is_on: bool,
}

#[async_trait]
impl SmartPlug for MockSmartPlug {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        info!("mock smart plug connected");
        Ok(())
    }

    async fn turn_on(&mut self) -> Result<()> {
        self.is_on = true;
        info!("mock smart plug ON");
        Ok(())
    }

    async fn turn_off(&mut self) -> Result<()> {
        self.is_on = false;
        info!("mock smart plug OFF");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        info!("mock smart plug disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Wraps a plug with the shared retry policy and the off-on-close safety
/// behaviour.
pub struct PlugController {
    plug: Box<dyn SmartPlug>,
    policy: RetryPolicy,
    turn_off_on_close: bool,
}

impl PlugController {
    pub fn new(plug: Box<dyn SmartPlug>, policy: RetryPolicy, turn_off_on_close: bool) -> Self {
        Self {
            plug,
            policy,
            turn_off_on_close,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.plug.connect().await {
                Ok(()) => {
                    info!("connected to smart plug");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.policy.max_retries {
                        return Err(anyhow!("failed to connect to smart plug: {e}"));
                    }
                    warn!(error = %e, attempt, "plug connect failed, retrying");
                    tokio::time::sleep(self.policy.initial_backoff * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }

    async fn switch(&mut self, on: bool) -> bool {
        if !self.plug.is_connected() {
            warn!(on, "cannot switch plug: not connected");
            return false;
        }
        let mut attempt = 0;
        loop {
            let result = if on {
                self.plug.turn_on().await
            } else {
                self.plug.turn_off().await
            };
            match result {
                Ok(()) => {
                    info!(on, "smart plug switched");
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.policy.max_retries {
                        error!(error = %e, on, "plug switch failed after retries");
                        return false;
                    }
                    warn!(error = %e, on, attempt, "plug switch failed, retrying");
                    tokio::time::sleep(self.policy.initial_backoff * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }

    pub async fn turn_on(&mut self) -> bool {
        self.switch(true).await
    }

    pub async fn turn_off(&mut self) -> bool {
        self.switch(false).await
    }

    /// Close the controller. With `turn_off_on_close`, the plug is
    /// explicitly switched OFF before disconnecting, on every exit path.
    pub async fn close(&mut self) {
        if self.plug.is_connected() {
            if self.turn_off_on_close {
                info!("turning off smart plug before disconnect");
                self.turn_off().await;
            }
            if let Err(e) = self.plug.disconnect().await {
                warn!(error = %e, "plug disconnect failed");
            }
        }
    }
}

// =============================================================================
// Event filtering
// =============================================================================

/// Low-humidity alerts from the climate sensor, and their resolutions.
/// High-humidity alerts never drive the plug.
pub fn is_low_humidity_alert(event: &AlertEvent) -> bool {
    let is_humidity = event.namespace == Namespace::Dht
        && event.sensor_name == crate::types::SensorId::Named("humidity".into());
    if !is_humidity {
        return false;
    }
    let is_low = matches!(event.threshold, Some(threshold) if event.value < threshold);
    event.is_resolved || is_low
}

// =============================================================================
// Service loop
// =============================================================================

async fn store_last_state(redis_url: &str, event: &HumidifierStateEvent) {
    let result = async {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event).unwrap_or_default();
        conn.set::<_, _, ()>(HUMIDIFIER_STATE_KEY, payload).await
    }
    .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to store humidifier state in broker");
    }
}

async fn handle_event(
    event: &AlertEvent,
    controller: &mut PlugController,
    publisher: &mut EventPublisher,
    redis_url: &str,
) {
    let (success, is_on) = if event.is_resolved {
        info!(humidity = event.value, "humidity recovered, turning humidifier OFF");
        (controller.turn_off().await, false)
    } else {
        info!(
            humidity = event.value,
            threshold = ?event.threshold,
            "humidity too low, turning humidifier ON"
        );
        (controller.turn_on().await, true)
    };

    if success {
        let state = HumidifierStateEvent::new(is_on, utc_now());
        publisher.publish(Topic::HumidifierState, &state).await;
        store_last_state(redis_url, &state).await;
    }
}

/// Run the humidifier service until shutdown. The plug is turned OFF and
/// disconnected on every exit path, including subscription errors.
pub async fn run_service(
    plug: Box<dyn SmartPlug>,
    env: Settings,
    shutdown: Shutdown,
) -> Result<()> {
    let policy = RetryPolicy::new(
        env.notifications.max_retries,
        env.notifications.initial_backoff_sec,
    );
    let mut controller = PlugController::new(plug, policy, true);
    controller.connect().await?;

    let mut publisher = EventPublisher::new(&env.redis_url)?;
    if let Err(e) = publisher.connect().await {
        warn!(error = %e, "event bus unreachable at startup, publishing best-effort");
    }
    let subscriber = match EventSubscriber::new(&env.redis_url, &[Topic::Alert]) {
        Ok(subscriber) => subscriber,
        Err(e) => {
            controller.close().await;
            return Err(e);
        }
    };

    info!("humidifier service started");

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
            if let Some(event) = parse_alert_event(&payload) {
                if is_low_humidity_alert(&event) {
                    handle_event(&event, &mut controller, &mut publisher, &env.redis_url).await;
                }
            }
        }
    }

    controller.close().await;
    info!("humidifier service stopped");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorId;
    use std::sync::{Arc, Mutex};

    fn humidity_event(value: f64, threshold: Option<f64>, is_resolved: bool) -> AlertEvent {
        AlertEvent {
            namespace: Namespace::Dht,
            sensor_name: SensorId::Named("humidity".into()),
            value,
            unit: "%".into(),
            threshold,
            recording_time: "2025-06-01 10:00:00".into(),
            is_resolved,
        }
    }

    #[test]
    fn filter_accepts_low_humidity_and_resolutions_only() {
        // Low humidity alert: value below threshold.
        assert!(is_low_humidity_alert(&humidity_event(35.0, Some(40.0), false)));
        // Resolution of a humidity alert.
        assert!(is_low_humidity_alert(&humidity_event(45.0, None, true)));
        // High humidity alert: value above threshold, ignored.
        assert!(!is_low_humidity_alert(&humidity_event(70.0, Some(65.0), false)));

        // Other sensors never qualify.
        let mut temp = humidity_event(10.0, Some(18.0), false);
        temp.sensor_name = SensorId::Named("temperature".into());
        assert!(!is_low_humidity_alert(&temp));

        let mut plant = humidity_event(10.0, Some(30.0), false);
        plant.namespace = Namespace::Pico;
        plant.sensor_name = SensorId::Plant(1);
        assert!(!is_low_humidity_alert(&plant));
    }

    /// Plug that records every call for ordering assertions.
    struct RecordingPlug {
        log: Arc<Mutex<Vec<&'static str>>>,
        connected: bool,
        fail_turn_off: bool,
    }

    #[async_trait]
    impl SmartPlug for RecordingPlug {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            self.log.lock().unwrap().push("connect");
            Ok(())
        }

        async fn turn_on(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("on");
            Ok(())
        }

        async fn turn_off(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("off");
            if self.fail_turn_off {
                anyhow::bail!("plug unreachable");
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            self.log.lock().unwrap().push("disconnect");
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[tokio::test]
    async fn close_turns_off_before_disconnecting() {
        // Law 10: OFF is issued before the handle is released.
        let log = Arc::new(Mutex::new(Vec::new()));
        let plug = RecordingPlug {
            log: log.clone(),
            connected: false,
            fail_turn_off: false,
        };
        let mut controller =
            PlugController::new(Box::new(plug), RetryPolicy::new(2, 0), true);
        controller.connect().await.unwrap();
        controller.turn_on().await;
        controller.close().await;

        assert_eq!(*log.lock().unwrap(), vec!["connect", "on", "off", "disconnect"]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_still_disconnects_when_off_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plug = RecordingPlug {
            log: log.clone(),
            connected: false,
            fail_turn_off: true,
        };
        let mut controller =
            PlugController::new(Box::new(plug), RetryPolicy::new(2, 1), true);
        controller.connect().await.unwrap();
        controller.close().await;

        let calls = log.lock().unwrap();
        // OFF retried to exhaustion, then disconnect still happens.
        assert_eq!(calls.iter().filter(|c| **c == "off").count(), 2);
        assert_eq!(*calls.last().unwrap(), "disconnect");
    }

    #[tokio::test]
    async fn without_off_on_close_plug_state_is_left_alone() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plug = RecordingPlug {
            log: log.clone(),
            connected: false,
            fail_turn_off: false,
        };
        let mut controller =
            PlugController::new(Box::new(plug), RetryPolicy::new(2, 0), false);
        controller.connect().await.unwrap();
        controller.close().await;
        assert_eq!(*log.lock().unwrap(), vec!["connect", "disconnect"]);
    }

    #[tokio::test]
    async fn switch_fails_gracefully_when_not_connected() {
        let mut controller = PlugController::new(
            Box::new(MockSmartPlug::default()),
            RetryPolicy::new(2, 0),
            true,
        );
        assert!(!controller.turn_on().await);
    }
}
