// =============================================================================
// Settings Store — typed K/V with versioned cross-process cache invalidation
// =============================================================================
//
// Every process holds a fast local view of the runtime-configurable
// settings. A monotonically increasing version counter in Redis lets each
// process detect that another one has written, without polling the
// database:
//
//   get_all   read broker version; on broker outage the cache is bypassed
//             (not cleared) and the database is authoritative for this
//             call. Version match + fresh TTL serves the cached map;
//             anything else refetches and re-caches under the new version.
//
//   set_batch bump the version FIRST, then upsert + refetch inside one
//             transaction, then cache the post-write map under the new
//             version. A crash after commit but before a bump would leave
//             other processes stale forever; a bump without a commit only
//             costs one extra refetch globally.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::AsyncCommands;
use rusqlite::types::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::db::{Database, DbResult};
use crate::types::SettingsKey;
use crate::utils::{format_recording_time, utc_now};

/// Redis key holding the settings version counter.
const VERSION_KEY: &str = "verdant:settings:version";

/// Broker round-trips are bounded so a hung Redis degrades to DB reads
/// instead of stalling polling cycles.
const BROKER_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Local cache TTL.
pub const CACHE_TTL: Duration = Duration::from_secs(30);

pub type SettingsMap = HashMap<SettingsKey, String>;

// =============================================================================
// Cache
// =============================================================================

/// Local settings map plus the broker version it was observed under.
struct SettingsCache {
    map: Option<SettingsMap>,
    cached_version: i64,
    cached_at: Instant,
}

impl SettingsCache {
    fn new() -> Self {
        Self {
            map: None,
            cached_version: 0,
            cached_at: Instant::now(),
        }
    }

    /// Cached map if the version matches and the TTL has not expired.
    fn get(&self, current_version: i64, ttl: Duration) -> Option<SettingsMap> {
        let map = self.map.as_ref()?;
        if self.cached_version == current_version && self.cached_at.elapsed() < ttl {
            Some(map.clone())
        } else {
            None
        }
    }

    fn set(&mut self, map: SettingsMap, version: i64) {
        self.map = Some(map);
        self.cached_version = version;
        self.cached_at = Instant::now();
    }

    fn invalidate(&mut self) {
        self.map = None;
        self.cached_version = 0;
    }
}

// =============================================================================
// SettingsStore
// =============================================================================

/// Per-process settings store. Owns its own database connection (settings
/// traffic is light and mostly served from cache) and a Redis client for
/// the version counter.
pub struct SettingsStore {
    db: tokio::sync::Mutex<Database>,
    redis: redis::Client,
    cache: Mutex<SettingsCache>,
    ttl: Duration,
}

impl SettingsStore {
    pub fn new(db: Database, redis_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            db: tokio::sync::Mutex::new(db),
            redis: redis::Client::open(redis_url)?,
            cache: Mutex::new(SettingsCache::new()),
            ttl: CACHE_TTL,
        })
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn connect(&self) -> DbResult<()> {
        self.db.lock().await.connect().await
    }

    /// Current broker-held version. `None` means the broker is unreachable
    /// and the cache must not be trusted; a missing key reads as 0.
    async fn broker_version(&self) -> Option<i64> {
        let mut conn = timeout(
            BROKER_OP_TIMEOUT,
            self.redis.get_multiplexed_async_connection(),
        )
        .await
        .ok()?
        .ok()?;
        let version: Option<i64> = timeout(BROKER_OP_TIMEOUT, conn.get(VERSION_KEY))
            .await
            .ok()?
            .ok()?;
        Some(version.unwrap_or(0))
    }

    /// Atomically bump the broker version. Degrades to 0 on broker outage:
    /// the write still lands in the database and readers with a live
    /// broker observe a version mismatch on their next fetch.
    async fn bump_version(&self) -> i64 {
        let result = async {
            let mut conn = self.redis.get_multiplexed_async_connection().await?;
            conn.incr::<_, _, i64>(VERSION_KEY, 1).await
        };
        match timeout(BROKER_OP_TIMEOUT, result).await {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to bump settings version in broker");
                0
            }
            Err(_) => {
                warn!("timed out bumping settings version in broker");
                0
            }
        }
    }

    /// All settings as a map, served from cache when provably fresh.
    pub async fn get_all(&self) -> DbResult<SettingsMap> {
        let version = self.broker_version().await;

        if let Some(current) = version {
            if let Some(cached) = self.cache.lock().get(current, self.ttl) {
                return Ok(cached);
            }
        } else {
            debug!("broker unreachable, bypassing settings cache");
        }

        let rows = {
            let mut db = self.db.lock().await;
            db.fetch_all("SELECT key, value FROM settings", vec![], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .await
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                self.cache.lock().invalidate();
                warn!(error = %e, "failed to fetch settings, cache invalidated");
                return Err(e);
            }
        };

        let map = parse_rows(rows);
        if let Some(current) = version {
            self.cache.lock().set(map.clone(), current);
        }
        Ok(map)
    }

    /// Write a batch of settings in one transaction and return the full
    /// post-write map.
    pub async fn set_batch(&self, updates: SettingsMap) -> DbResult<SettingsMap> {
        // Bump before the write: see module header.
        let new_version = self.bump_version().await;
        let now = format_recording_time(utc_now());
        let entries: Vec<(String, String)> = updates
            .into_iter()
            .map(|(key, value)| (key.as_str(), value))
            .collect();

        let rows = {
            let mut db = self.db.lock().await;
            db.transaction(move |tx| {
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO settings (key, value, updated_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET
                             value = excluded.value,
                             updated_at = excluded.updated_at",
                    )?;
                    for (key, value) in entries {
                        stmt.execute(rusqlite::params![key, value, now])?;
                    }
                }
                // Read back inside the same transaction for consistency.
                let mut stmt = tx.prepare("SELECT key, value FROM settings")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?
        };

        let map = parse_rows(rows);
        self.cache.lock().set(map.clone(), new_version);
        Ok(map)
    }

    /// Single-value convenience used by tests and the cleanup job.
    pub async fn get(&self, key: SettingsKey) -> DbResult<Option<String>> {
        Ok(self.get_all().await?.get(&key).cloned())
    }
}

/// Fold raw rows into the typed map, dropping keys outside the catalog.
fn parse_rows(rows: Vec<(String, String)>) -> SettingsMap {
    let mut map = SettingsMap::new();
    for (raw_key, value) in rows {
        match SettingsKey::parse(&raw_key) {
            Some(key) => {
                map.insert(key, value);
            }
            None => warn!(key = %raw_key, "ignoring unknown settings key"),
        }
    }
    map
}

// =============================================================================
// Tests
// =============================================================================
