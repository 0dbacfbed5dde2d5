// =============================================================================
// Humidifier Service — Process Entry Point
// =============================================================================

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use verdant::humidifier::{self, MockSmartPlug, SmartPlug};
use verdant::settings::Settings;
use verdant::shutdown::{install_signal_handlers, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let env = Settings::from_env()?;
    if !env.humidifier.enabled {
        tracing::info!("humidifier service is disabled, exiting");
        return Ok(());
    }

    let plug: Box<dyn SmartPlug> = if env.mock_sensors {
        tracing::info!("using mock smart plug");
        Box::new(MockSmartPlug::default())
    } else if env.humidifier.host.is_empty() {
        bail!("HUMIDIFIER_HOST is not configured");
    } else {
        // The plug protocol driver ships separately; without it only mock
        // mode runs.
        bail!(
            "no smart plug driver available in this build for {}; set MOCK_SENSORS=1",
            env.humidifier.host
        );
    };

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    humidifier::run_service(plug, env, shutdown).await
}
