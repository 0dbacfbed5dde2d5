// =============================================================================
// Dashboard Server — Process Entry Point
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use verdant::db::settings_store::SettingsStore;
use verdant::db::{init_db, Database};
use verdant::server::{self, state::ServerState};
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

    // Ensure the schema exists (and seed the admin password) before the
    // pool starts handing out connections.
    let mut bootstrap = Database::from_settings(&env);
    init_db(&mut bootstrap, &env).await?;
    bootstrap.close().await;

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let store = Arc::new(SettingsStore::new(
        Database::from_settings(&env),
        &env.redis_url,
    )?);
    store.connect().await?;

    let state = Arc::new(ServerState::new(env, store)?);
    server::run(state, shutdown).await
}
