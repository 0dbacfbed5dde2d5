// =============================================================================
// Notification Dispatcher — pluggable backends with retry and fan-out
// =============================================================================
//
// Subscribes to `alert` and delivers each transition to every enabled
// backend concurrently. Enablement and the backend list are resolved
// through the settings store per event, so the admin API reconfigures the
// dispatcher live.
//
// Retry policy, per backend per event: retryable failures (network,
// timeout, 5xx, 429) back off exponentially up to `max_retries`;
// non-retryable failures (authentication, other 4xx, malformed input)
// fail immediately. A failing backend never cancels the others; partial
// failure surfaces as `PartialNotificationError`, which the service loop
// logs and swallows.
// =============================================================================

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::StreamExt;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::settings_store::SettingsStore;
use crate::eventbus::{parse_alert_event, AlertEvent, EventSubscriber, Topic};
use crate::retry::{with_retry, RetryError, RetryPolicy};
use crate::settings::{GmailSettings, NotificationSettings, Settings, SlackSettings};
use crate::shutdown::Shutdown;
use crate::thresholds::effective_notifications;
use crate::types::NotificationBackend;

const SMTP_RELAY: &str = "smtp.gmail.com";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("non-retryable: {0}")]
    Fatal(String),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Retryable(_))
    }
}

/// Some backends failed while others succeeded. Never raised past the
/// service loop; the subscription continues.
#[derive(Debug, Error)]
#[error("notification failed for: {}", failed.join(", "))]
pub struct PartialNotificationError {
    pub failed: Vec<String>,
}

// =============================================================================
// Message formatting
// =============================================================================

pub fn format_alert_message(event: &AlertEvent) -> String {
    let label = event.sensor_label();
    let time = event
        .recording_time
        .split(' ')
        .nth(1)
        .unwrap_or(&event.recording_time);
    if event.is_resolved {
        format!(
            "{label} recovered.\n\nCurrent value: {:.1}{}\nTime: {time}",
            event.value, event.unit
        )
    } else {
        let threshold = event
            .threshold
            .map(|t| format!("{t:.0}{}", event.unit))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{label} alert!\n\nCurrent value: {:.1}{}\nThreshold: {threshold}\nTime: {time}",
            event.value, event.unit
        )
    }
}

fn subject_for(event: &AlertEvent) -> String {
    if event.is_resolved {
        format!("[greenhouse] {} recovered", event.sensor_label())
    } else {
        format!("[greenhouse] {} alert", event.sensor_label())
    }
}

// =============================================================================
// Backends
// =============================================================================

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError>;
}

/// Gmail over SMTP STARTTLS.
pub struct GmailNotifier {
    settings: GmailSettings,
    policy: RetryPolicy,
    timeout: Duration,
}

impl GmailNotifier {
    pub fn new(settings: GmailSettings, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            settings,
            policy,
            timeout,
        }
    }

    fn build_message(&self, event: &AlertEvent) -> Result<Message, NotifyError> {
        let from: Mailbox = self
            .settings
            .sender
            .parse()
            .map_err(|e| NotifyError::Fatal(format!("invalid sender: {e}")))?;
        let mut builder = Message::builder().from(from).subject(subject_for(event));
        for recipient in self
            .settings
            .recipients
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| NotifyError::Fatal(format!("invalid recipient: {e}")))?;
            builder = builder.to(to);
        }
        builder
            .body(format_alert_message(event))
            .map_err(|e| NotifyError::Fatal(format!("message build failed: {e}")))
    }

    fn classify(e: &lettre::transport::smtp::Error) -> NotifyError {
        // Permanent SMTP responses and client-side errors (auth, bad
        // message) will not improve on retry.
        if e.is_permanent() || e.is_client() {
            NotifyError::Fatal(e.to_string())
        } else {
            NotifyError::Retryable(e.to_string())
        }
    }
}

#[async_trait]
impl Notifier for GmailNotifier {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        let message = self.build_message(event)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(SMTP_RELAY)
            .map_err(|e| NotifyError::Fatal(format!("smtp relay setup failed: {e}")))?
            .credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build();

        let result = with_retry(
            "gmail send",
            &self.policy,
            NotifyError::is_retryable,
            || async {
                transport
                    .send(message.clone())
                    .await
                    .map(|_| ())
                    .map_err(|e| Self::classify(&e))
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(sensor = %event.sensor_name, "sent email notification");
                Ok(())
            }
            Err(RetryError::Fatal { source, .. }) | Err(RetryError::Exhausted { source, .. }) => {
                Err(source)
            }
        }
    }
}

/// Slack incoming webhook.
pub struct SlackNotifier {
    settings: SlackSettings,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(settings: SlackSettings, policy: RetryPolicy, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            policy,
            client,
        }
    }

    fn payload(event: &AlertEvent) -> serde_json::Value {
        let label = event.sensor_label();
        let headline = if event.is_resolved {
            format!("{label} recovered")
        } else {
            format!("{label} alert")
        };
        serde_json::json!({
            "text": headline,
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": headline }
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": format_alert_message(event) }
                }
            ]
        })
    }

    async fn post_once(&self, payload: &serde_json::Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.settings.webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    NotifyError::Retryable(e.to_string())
                } else {
                    NotifyError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(NotifyError::Retryable(format!("webhook returned {status}")))
        } else {
            Err(NotifyError::Fatal(format!("webhook returned {status}")))
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        let payload = Self::payload(event);
        let result = with_retry(
            "slack send",
            &self.policy,
            NotifyError::is_retryable,
            || self.post_once(&payload),
        )
        .await;

        match result {
            Ok(()) => {
                info!(sensor = %event.sensor_name, "sent slack notification");
                Ok(())
            }
            Err(RetryError::Fatal { source, .. }) | Err(RetryError::Exhausted { source, .. }) => {
                Err(source)
            }
        }
    }
}

/// Logs and succeeds. Used when notifications are globally disabled.
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        info!(sensor = %event.sensor_name, "notifications disabled, ignoring alert");
        Ok(())
    }
}

// =============================================================================
// Composite dispatcher
// =============================================================================

/// Fans one event out to every backend concurrently. A failure in one
/// backend does not cancel the others.
pub struct CompositeNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    pub async fn send(&self, event: &AlertEvent) -> Result<(), PartialNotificationError> {
        let results = join_all(self.notifiers.iter().map(|n| n.send(event))).await;

        let failed: Vec<String> = self
            .notifiers
            .iter()
            .zip(results)
            .filter_map(|(notifier, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    error!(backend = notifier.name(), error = %e, "notification backend failed");
                    Some(notifier.name().to_string())
                }
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PartialNotificationError { failed })
        }
    }
}

/// Build the dispatcher for the current effective settings.
pub fn build_notifier(cfg: &NotificationSettings) -> CompositeNotifier {
    if !cfg.enabled {
        return CompositeNotifier::new(vec![Box::new(NoOpNotifier)]);
    }

    let policy = RetryPolicy::new(cfg.max_retries, cfg.initial_backoff_sec);
    let timeout = Duration::from_secs(cfg.timeout_sec);
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
    for backend in &cfg.backends {
        match backend {
            NotificationBackend::Gmail => notifiers.push(Box::new(GmailNotifier::new(
                cfg.gmail.clone(),
                policy,
                timeout,
            ))),
            NotificationBackend::Slack => notifiers.push(Box::new(SlackNotifier::new(
                cfg.slack.clone(),
                policy,
                timeout,
            ))),
        }
    }
    if notifiers.is_empty() {
        notifiers.push(Box::new(NoOpNotifier));
    }
    CompositeNotifier::new(notifiers)
}

// =============================================================================
// Service loop
// =============================================================================

/// Run the notification service until shutdown: subscribe to `alert`,
/// resolve the effective backend set per event, dispatch, log failures,
/// continue.
pub async fn run_service(
    env: Settings,
    store: Arc<SettingsStore>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let subscriber = EventSubscriber::new(&env.redis_url, &[Topic::Alert])?;
    info!("notification service started");

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
            let Some(event) = parse_alert_event(&payload) else {
                continue;
            };

            let kind = if event.is_resolved { "resolution" } else { "alert" };
            info!(sensor = %event.sensor_name, kind, "processing event");

            let cfg = match effective_notifications(&store, &env).await {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!(error = %e, "failed to resolve notification settings, using environment");
                    env.notifications.clone()
                }
            };
            if let Err(partial) = build_notifier(&cfg).send(&event).await {
                error!(error = %partial, "partial notification failure");
            }
        }
    }

    info!("notification service stopped");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
