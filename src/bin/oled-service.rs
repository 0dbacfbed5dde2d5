// =============================================================================
// OLED Display Service — Process Entry Point
// =============================================================================

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use verdant::display::oled::{self, MockOledDisplay, OledDisplay};
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
    if !env.oled.enabled {
        tracing::info!("oled service is disabled, exiting");
        return Ok(());
    }

    let display: Box<dyn OledDisplay> = if env.mock_sensors {
        tracing::info!("using mock OLED display");
        Box::new(MockOledDisplay::default())
    } else {
        bail!("no SSD1306 driver available in this build; set MOCK_SENSORS=1");
    };

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    oled::run_service(display, env, shutdown).await
}
