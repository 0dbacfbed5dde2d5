// =============================================================================
// Retention Cleanup — cron-invoked row expiry
// =============================================================================
//
// Deletes readings older than the retention window (resolved through the
// settings store so the admin API controls it) and reclaims pages with an
// incremental vacuum. Skips silently when the database file does not exist
// yet: nothing to clean on a fresh host.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::types::Value;
use tracing::info;

use crate::db::settings_store::SettingsStore;
use crate::db::Database;
use crate::settings::Settings;
use crate::thresholds::effective_retention_days;
use crate::utils::{format_recording_time, utc_now};

/// Run one cleanup pass. Returns the number of deleted rows.
pub async fn run(env: &Settings, store: Arc<SettingsStore>) -> Result<u64> {
    if !Path::new(&env.db_path).exists() {
        info!(path = %env.db_path, "database does not exist, skipping cleanup");
        return Ok(0);
    }

    store.connect().await?;
    let retention_days = effective_retention_days(&store, env).await?;
    let cutoff = utc_now() - chrono::Duration::days(retention_days);
    let cutoff_str = format_recording_time(cutoff);
    info!(retention_days, cutoff = %cutoff_str, "starting cleanup");

    let mut db = Database::from_settings(env);
    db.connect().await?;
    let mut deleted = 0u64;
    for table in ["reading", "pico_reading"] {
        deleted += db
            .execute(
                &format!("DELETE FROM {table} WHERE recording_time < ?1"),
                vec![Value::from(cutoff_str.clone())],
            )
            .await? as u64;
    }
    db.pragma("PRAGMA incremental_vacuum(500)").await?;
    db.close().await;

    info!(deleted, "cleanup complete");
    Ok(deleted)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    #[tokio::test]
    async fn missing_database_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("absent.sqlite3").to_string_lossy().into_owned();
        let env = Settings::for_tests(&db_path);
        let store_db = Database::from_settings(&env);
        let store = Arc::new(SettingsStore::new(store_db, &env.redis_url).unwrap());
        assert_eq!(run(&env, store).await.unwrap(), 0);
        assert!(!Path::new(&db_path).exists());
    }

    #[tokio::test]
    async fn old_rows_are_deleted_and_recent_ones_kept() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cleanup.sqlite3").to_string_lossy().into_owned();
        let env = Settings::for_tests(&db_path);

        let mut db = Database::from_settings(&env);
        init_db(&mut db, &env).await.unwrap();

        let old = format_recording_time(utc_now() - chrono::Duration::days(30));
        let recent = format_recording_time(utc_now());
        for ts in [&old, &recent] {
            db.execute(
                "INSERT INTO reading VALUES (21.0, 50.0, ?1)",
                vec![Value::from(ts.clone())],
            )
            .await
            .unwrap();
            db.execute(
                "INSERT INTO pico_reading VALUES (1, 40.0, ?1)",
                vec![Value::from(ts.clone())],
            )
            .await
            .unwrap();
        }
        db.close().await;

        let store_db = Database::from_settings(&env);
        let store = Arc::new(SettingsStore::new(store_db, &env.redis_url).unwrap());
        store.connect().await.unwrap();

        // Default retention in test settings: 7 days.
        let deleted = run(&env, store).await.unwrap();
        assert_eq!(deleted, 2);

        let mut db = Database::from_settings(&env);
        db.connect().await.unwrap();
        let remaining = db
            .fetch_one(
                "SELECT (SELECT COUNT(*) FROM reading) + (SELECT COUNT(*) FROM pico_reading)",
                vec![],
                |row| row.get::<_, i64>(0),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn stored_retention_override_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("retention.sqlite3").to_string_lossy().into_owned();
        let env = Settings::for_tests(&db_path);

        let mut db = Database::from_settings(&env);
        init_db(&mut db, &env).await.unwrap();
        // A 3-day-old row survives the default 7 days but not a 1-day
        // override written through the settings store.
        let ts = format_recording_time(utc_now() - chrono::Duration::days(3));
        db.execute(
            "INSERT INTO reading VALUES (21.0, 50.0, ?1)",
            vec![Value::from(ts)],
        )
        .await
        .unwrap();
        db.close().await;

        let store_db = Database::from_settings(&env);
        let store = Arc::new(SettingsStore::new(store_db, &env.redis_url).unwrap());
        store.connect().await.unwrap();
        store
            .set_batch(crate::db::settings_store::SettingsMap::from([(
                crate::types::SettingsKey::RetentionDays,
                "1".to_string(),
            )]))
            .await
            .unwrap();

        let deleted = run(&env, store).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
