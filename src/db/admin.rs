// =============================================================================
// Admin Credential Storage — Argon2id password hashing
// =============================================================================
//
// A single admin row (id = 1) holds the password hash for the dashboard's
// admin API. Hashes use Argon2id in PHC string form, so the algorithm
// parameters travel inside the stored record and can be upgraded later
// without a migration. Verification is constant-time.
// =============================================================================

use anyhow::anyhow;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rusqlite::types::Value;
use tracing::{info, warn};

use crate::db::{Database, DbError, DbResult};
use crate::utils::{format_recording_time, utc_now};

// Memory-hard cost: 16 MiB, 2 passes, 1 lane.
const MEMORY_COST_KIB: u32 = 16 * 1024;
const TIME_COST: u32 = 2;
const LANES: u32 = 1;

fn kdf() -> anyhow::Result<Argon2<'static>> {
    let params = Params::new(MEMORY_COST_KIB, TIME_COST, LANES, None)
        .map_err(|e| anyhow!("argon2 params: {e}"))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password into a PHC string (`$argon2id$v=19$m=...$salt$hash`).
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = kdf()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("argon2 hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC record. Malformed records verify
/// as false rather than erroring.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    // Parameters come from the record itself, so older hashes keep
    // verifying after a cost bump.
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Fetch the stored admin password hash, if configured.
pub async fn get_admin_password_hash(db: &mut Database) -> DbResult<Option<String>> {
    db.fetch_one(
        "SELECT password_hash FROM admin WHERE id = 1",
        vec![],
        |row| row.get::<_, String>(0),
    )
    .await
}

/// Insert or replace the admin password hash.
pub async fn set_admin_password_hash(db: &mut Database, password_hash: &str) -> DbResult<()> {
    db.execute(
        "INSERT INTO admin (id, password_hash, updated_at)
         VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             password_hash = excluded.password_hash,
             updated_at = excluded.updated_at",
        vec![
            Value::from(password_hash.to_string()),
            Value::from(format_recording_time(utc_now())),
        ],
    )
    .await?;
    Ok(())
}

/// Seed the admin password from the environment when no row exists yet.
/// A missing `ADMIN_PASSWORD` only disables the admin API, so it warns
/// instead of failing startup.
pub async fn seed_admin_password(
    db: &mut Database,
    initial_password: Option<&str>,
) -> DbResult<()> {
    if get_admin_password_hash(db).await?.is_some() {
        return Ok(());
    }

    let Some(password) = initial_password.filter(|p| !p.is_empty()) else {
        warn!("No admin password configured. Set ADMIN_PASSWORD to enable the admin API");
        return Ok(());
    };

    let hash = hash_password(password).map_err(|e| DbError::Task(e.to_string()))?;
    set_admin_password_hash(db, &hash).await?;
    info!("Admin password initialised from environment");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("garden-gate").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("garden-gate", &hash));
        assert!(!verify_password("garden-gates", &hash));
    }

    #[test]
    fn record_embeds_parameters() {
        let hash = hash_password("secret").unwrap();
        assert!(hash.contains(&format!("m={MEMORY_COST_KIB}")));
        assert!(hash.contains(&format!("t={TIME_COST}")));
    }

    #[test]
    fn malformed_record_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-record"));
        assert!(!verify_password("anything", ""));
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_skips_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new(dir.path().join("admin.sqlite3"), Duration::from_secs(5));
        db.connect().await.unwrap();
        db.execute_batch(
            "CREATE TABLE admin (id INTEGER PRIMARY KEY CHECK (id = 1),
                                 password_hash TEXT NOT NULL,
                                 updated_at TIMESTAMP NOT NULL)",
        )
        .await
        .unwrap();

        seed_admin_password(&mut db, None).await.unwrap();
        assert!(get_admin_password_hash(&mut db).await.unwrap().is_none());

        seed_admin_password(&mut db, Some("first")).await.unwrap();
        let hash = get_admin_password_hash(&mut db).await.unwrap().unwrap();

        // Existing hash wins over a later seed attempt.
        seed_admin_password(&mut db, Some("second")).await.unwrap();
        let unchanged = get_admin_password_hash(&mut db).await.unwrap().unwrap();
        assert_eq!(hash, unchanged);
        assert!(verify_password("first", &unchanged));
    }
}
