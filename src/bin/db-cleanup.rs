// =============================================================================
// Retention Cleanup — Process Entry Point (cron-invoked)
// =============================================================================
//
// Run via cron, e.g.: 0 3 * * * db-cleanup
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use verdant::cleanup;
use verdant::db::settings_store::SettingsStore;
use verdant::db::Database;
use verdant::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let env = Settings::from_env()?;
    let store = Arc::new(SettingsStore::new(
        Database::from_settings(&env),
        &env.redis_url,
    )?);

    cleanup::run(&env, store).await?;
    Ok(())
}
