// =============================================================================
// Dashboard Queries — chart, stats and latest-reading lookups
// =============================================================================
//
// Chart endpoints downsample at the SQL layer: readings are grouped into
// time buckets sized so any window renders to roughly 500 points. Epochs
// are precomputed in milliseconds for the front-end charts.
// =============================================================================

use chrono::NaiveDateTime;
use rusqlite::types::Value;
use serde::Serialize;

use crate::db::{Database, DbResult};
use crate::utils::format_recording_time;

/// Fixed point count for chart windows, regardless of window size.
const CHART_TARGET_POINTS: i64 = 500;

/// Bucket size in seconds for a window of `window_sec`. Minimum one second
/// (no aggregation for short ranges).
pub fn bucket_size_sec(window_sec: i64) -> i64 {
    (window_sec / CHART_TARGET_POINTS).max(1)
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DhtRow {
    pub temperature: f64,
    pub humidity: f64,
    pub recording_time: String,
    pub epoch: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PicoRow {
    pub plant_id: u32,
    pub moisture: f64,
    pub recording_time: String,
    pub epoch: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeasureStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DhtStats {
    pub temperature: MeasureStats,
    pub humidity: MeasureStats,
}

fn dht_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DhtRow> {
    Ok(DhtRow {
        temperature: row.get(0)?,
        humidity: row.get(1)?,
        recording_time: row.get(2)?,
        epoch: row.get(3)?,
    })
}

fn pico_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PicoRow> {
    Ok(PicoRow {
        plant_id: row.get::<_, i64>(0)? as u32,
        moisture: row.get(1)?,
        recording_time: row.get(2)?,
        epoch: row.get(3)?,
    })
}

// =============================================================================
// DHT queries
// =============================================================================

/// Bucketed chart data since `from_time`.
pub async fn dht_chart(
    db: &mut Database,
    from_time: NaiveDateTime,
    bucket_sec: i64,
) -> DbResult<Vec<DhtRow>> {
    db.fetch_all(
        "SELECT ROUND(AVG(temperature), 1),
                ROUND(AVG(humidity), 1),
                MAX(recording_time),
                CAST(strftime('%s', MAX(recording_time)) AS INTEGER) * 1000
         FROM reading
         WHERE recording_time >= ?1
         GROUP BY CAST(strftime('%s', recording_time) AS INTEGER) / ?2
         ORDER BY MAX(recording_time)",
        vec![
            Value::from(format_recording_time(from_time)),
            Value::from(bucket_sec),
        ],
        dht_row,
    )
    .await
}

/// Aggregate stats over the window.
pub async fn dht_stats(db: &mut Database, from_time: NaiveDateTime) -> DbResult<DhtStats> {
    let stats = db
        .fetch_one(
            "SELECT ROUND(MIN(temperature), 1), ROUND(MAX(temperature), 1),
                    ROUND(AVG(temperature), 1),
                    ROUND(MIN(humidity), 1), ROUND(MAX(humidity), 1),
                    ROUND(AVG(humidity), 1)
             FROM reading
             WHERE recording_time >= ?1",
            vec![Value::from(format_recording_time(from_time))],
            |row| {
                Ok(DhtStats {
                    temperature: MeasureStats {
                        min: row.get(0)?,
                        max: row.get(1)?,
                        avg: row.get(2)?,
                    },
                    humidity: MeasureStats {
                        min: row.get(3)?,
                        max: row.get(4)?,
                        avg: row.get(5)?,
                    },
                })
            },
        )
        .await?;
    // Aggregates over an empty window still yield one all-NULL row.
    Ok(stats.unwrap_or(DhtStats {
        temperature: MeasureStats {
            min: None,
            max: None,
            avg: None,
        },
        humidity: MeasureStats {
            min: None,
            max: None,
            avg: None,
        },
    }))
}

/// Most recent DHT reading, if any.
pub async fn dht_latest(db: &mut Database) -> DbResult<Option<DhtRow>> {
    db.fetch_one(
        "SELECT temperature, humidity, recording_time,
                CAST(strftime('%s', recording_time) AS INTEGER) * 1000
         FROM reading
         ORDER BY recording_time DESC
         LIMIT 1",
        vec![],
        dht_row,
    )
    .await
}

// =============================================================================
// Pico queries
// =============================================================================

/// Bucketed per-plant chart data since `from_time`.
pub async fn pico_chart(
    db: &mut Database,
    from_time: NaiveDateTime,
    bucket_sec: i64,
) -> DbResult<Vec<PicoRow>> {
    db.fetch_all(
        "SELECT plant_id,
                ROUND(AVG(moisture), 1),
                MAX(recording_time),
                CAST(strftime('%s', MAX(recording_time)) AS INTEGER) * 1000
         FROM pico_reading
         WHERE recording_time >= ?1
         GROUP BY plant_id, CAST(strftime('%s', recording_time) AS INTEGER) / ?2
         ORDER BY MAX(recording_time), plant_id",
        vec![
            Value::from(format_recording_time(from_time)),
            Value::from(bucket_sec),
        ],
        pico_row,
    )
    .await
}

/// Latest reading for each plant.
pub async fn pico_latest(db: &mut Database) -> DbResult<Vec<PicoRow>> {
    db.fetch_all(
        "SELECT p.plant_id, p.moisture, p.recording_time,
                CAST(strftime('%s', p.recording_time) AS INTEGER) * 1000
         FROM pico_reading p
         JOIN (SELECT plant_id, MAX(recording_time) AS latest
               FROM pico_reading
               GROUP BY plant_id) m
           ON p.plant_id = m.plant_id AND p.recording_time = m.latest
         GROUP BY p.plant_id
         ORDER BY p.plant_id",
        vec![],
        pico_row,
    )
    .await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_recording_time;
    use std::time::Duration;

    #[test]
    fn bucket_size_targets_500_points() {
        assert_eq!(bucket_size_sec(3 * 3600), 21); // 3h window
        assert_eq!(bucket_size_sec(24 * 3600), 172); // 24h window
        assert_eq!(bucket_size_sec(60), 1); // short windows: no aggregation
    }

    async fn seeded_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new(dir.path().join("q.sqlite3"), Duration::from_secs(5));
        db.connect().await.unwrap();
        db.execute_batch(
            "CREATE TABLE reading (temperature REAL, humidity REAL, recording_time TIMESTAMP);
             CREATE TABLE pico_reading (plant_id INTEGER, moisture REAL, recording_time TIMESTAMP);",
        )
        .await
        .unwrap();

        for (temp, hum, ts) in [
            (20.0, 50.0, "2025-06-01 10:00:00"),
            (22.0, 52.0, "2025-06-01 10:00:30"),
            (24.0, 54.0, "2025-06-01 11:00:00"),
        ] {
            db.execute(
                "INSERT INTO reading VALUES (?1, ?2, ?3)",
                vec![Value::from(temp), Value::from(hum), Value::from(ts.to_string())],
            )
            .await
            .unwrap();
        }
        for (plant, moisture, ts) in [
            (1i64, 40.0, "2025-06-01 10:00:00"),
            (1, 42.0, "2025-06-01 11:00:00"),
            (2, 60.0, "2025-06-01 11:00:00"),
        ] {
            db.execute(
                "INSERT INTO pico_reading VALUES (?1, ?2, ?3)",
                vec![
                    Value::from(plant),
                    Value::from(moisture),
                    Value::from(ts.to_string()),
                ],
            )
            .await
            .unwrap();
        }
        (dir, db)
    }

    #[tokio::test]
    async fn chart_buckets_aggregate_readings() {
        let (_dir, mut db) = seeded_db().await;
        let from = parse_recording_time("2025-06-01 09:00:00").unwrap();

        // Huge bucket: all three readings collapse into one row.
        let rows = dht_chart(&mut db, from, 86_400).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, 22.0);

        // One-second buckets: every reading keeps its own row.
        let rows = dht_chart(&mut db, from, 1).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].epoch < rows[2].epoch);
    }

    #[tokio::test]
    async fn stats_cover_the_window_only() {
        let (_dir, mut db) = seeded_db().await;
        let from = parse_recording_time("2025-06-01 10:30:00").unwrap();
        let stats = dht_stats(&mut db, from).await.unwrap();
        assert_eq!(stats.temperature.min, Some(24.0));
        assert_eq!(stats.temperature.max, Some(24.0));
        assert_eq!(stats.humidity.avg, Some(54.0));
    }

    #[tokio::test]
    async fn stats_on_empty_window_are_null() {
        let (_dir, mut db) = seeded_db().await;
        let from = parse_recording_time("2030-01-01 00:00:00").unwrap();
        let stats = dht_stats(&mut db, from).await.unwrap();
        assert_eq!(stats.temperature.min, None);
        assert_eq!(stats.humidity.avg, None);
    }

    #[tokio::test]
    async fn latest_returns_most_recent_reading() {
        let (_dir, mut db) = seeded_db().await;
        let latest = dht_latest(&mut db).await.unwrap().unwrap();
        assert_eq!(latest.temperature, 24.0);
        assert_eq!(latest.recording_time, "2025-06-01 11:00:00");
    }

    #[tokio::test]
    async fn pico_latest_is_per_plant() {
        let (_dir, mut db) = seeded_db().await;
        let latest = pico_latest(&mut db).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].plant_id, 1);
        assert_eq!(latest[0].moisture, 42.0);
        assert_eq!(latest[1].plant_id, 2);
        assert_eq!(latest[1].moisture, 60.0);
    }
}
