// =============================================================================
// DHT22 Polling Service — Process Entry Point
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use verdant::db::settings_store::SettingsStore;
use verdant::db::Database;
use verdant::dht::{DhtSensor, DhtService};
use verdant::mock::MockDhtSensor;
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

    let sensor: Box<dyn DhtSensor> = if env.mock_sensors {
        tracing::info!("using mock DHT22 sensor");
        Box::new(MockDhtSensor::new())
    } else {
        // The chip driver ships separately; without it only mock mode runs.
        bail!("no DHT22 driver available in this build; set MOCK_SENSORS=1");
    };

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let store = Arc::new(SettingsStore::new(
        Database::from_settings(&env),
        &env.redis_url,
    )?);
    let frequency = Duration::from_secs(env.polling_frequency_sec);
    let mut service = DhtService::new(sensor, env, store)?;
    polling::run(&mut service, frequency, &shutdown).await
}
