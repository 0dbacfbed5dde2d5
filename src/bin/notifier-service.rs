// =============================================================================
// Notification Service — Process Entry Point
// =============================================================================
//
// Enablement and backend selection are runtime settings; the service runs
// regardless and dispatches through a NoOp backend while disabled, so
// flipping the admin toggle needs no restart.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use verdant::db::settings_store::SettingsStore;
use verdant::db::Database;
use verdant::notifications;
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
    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let store = Arc::new(SettingsStore::new(
        Database::from_settings(&env),
        &env.redis_url,
    )?);
    store.connect().await?;

    notifications::run_service(env, store, shutdown).await
}
