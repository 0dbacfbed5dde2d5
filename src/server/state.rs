// =============================================================================
// Server State — shared dependencies for every handler
// =============================================================================

use std::sync::Arc;

use crate::db::settings_store::SettingsStore;
use crate::db::ConnectionPool;
use crate::server::broadcast::BroadcastManager;
use crate::settings::Settings;

/// Shared across all request handlers and the event fan-out task via
/// `Arc<ServerState>`.
pub struct ServerState {
    pub pool: ConnectionPool,
    pub store: Arc<SettingsStore>,
    pub env: Settings,
    pub redis: redis::Client,
    pub broadcast: BroadcastManager,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(env: Settings, store: Arc<SettingsStore>) -> anyhow::Result<Self> {
        Ok(Self {
            pool: ConnectionPool::from_settings(&env),
            store,
            redis: redis::Client::open(env.redis_url.as_str())?,
            env,
            broadcast: BroadcastManager::new(),
        })
    }
}
