// =============================================================================
// LCD Alert Display Service — Process Entry Point
// =============================================================================

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use verdant::display::lcd::{self, LcdScreen, MockLcdScreen};
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
    if !env.lcd.enabled {
        tracing::info!("lcd service is disabled, exiting");
        return Ok(());
    }

    let screen: Box<dyn LcdScreen> = if env.mock_sensors {
        tracing::info!("using mock LCD screen");
        Box::new(MockLcdScreen::default())
    } else {
        bail!(
            "no character-LCD driver available in this build (i2c 0x{:02x}); set MOCK_SENSORS=1",
            env.lcd.i2c_address
        );
    };

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    lcd::run_service(screen, env, shutdown).await
}
