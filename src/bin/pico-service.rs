// =============================================================================
// Pico Moisture Reader — Process Entry Point
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use verdant::db::settings_store::SettingsStore;
use verdant::db::Database;
use verdant::mock::MockPicoLineSource;
use verdant::pico::{PicoLineSource, PicoService};
use verdant::polling;
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
    let frequency = Duration::from_secs(env.polling_frequency_sec);

    let source: Box<dyn PicoLineSource> = if env.mock_sensors {
        tracing::info!("using mock Pico data source");
        Box::new(MockPicoLineSource::new(frequency))
    } else {
        // The serial driver ships separately; without it only mock mode runs.
        bail!(
            "no serial driver available in this build for {}; set MOCK_SENSORS=1",
            env.pico.serial_port
        );
    };

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let store = Arc::new(SettingsStore::new(
        Database::from_settings(&env),
        &env.redis_url,
    )?);
    let mut service = PicoService::new(source, env, store)?;
    polling::run(&mut service, frequency, &shutdown).await
}
