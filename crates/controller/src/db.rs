//! SQLite persistence: zones, sequences, schedules, weather history
//! and key-value settings.
//!
//! The schema is created with idempotent statements at startup and a
//! fresh database is seeded with twelve default zones, matching the
//! usual 12-channel relay board layout.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub position: i64,
    /// Relay backend output channel (e.g. "IrrigationValve3").
    pub relay_output: String,
    /// Moisture sensor input channel (e.g. "IrrigationMoisture3").
    pub sensor_input: String,
    /// Last known moisture reading in percent, None until the first
    /// reading arrives.
    pub moisture: Option<i64>,
    pub moisture_threshold: i64,
    pub moisture_optimal: i64,
    pub auto_water_enabled: bool,
    /// Default watering duration in minutes.
    pub default_duration: i64,
    pub priority: i64,
    pub enabled: bool,
    pub is_active: bool,
    pub last_watered: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Sequence {
    pub id: i64,
    pub name: String,
    /// JSON array of steps, see [`SequenceStep`].
    pub steps: String,
    pub created_at: String,
}

/// One step of a sequence: water `zone_id` for `duration` minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub zone_id: i64,
    pub duration: i64,
}

impl Sequence {
    pub fn parsed_steps(&self) -> Result<Vec<SequenceStep>> {
        serde_json::from_str(&self.steps)
            .with_context(|| format!("sequence {} has malformed steps", self.id))
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Schedule {
    pub id: i64,
    pub name: Option<String>,
    pub sequence_id: i64,
    /// JSON array of weekday codes, 0 = Sunday .. 6 = Saturday.
    pub days: String,
    /// "HH:MM" local civil time.
    pub time: String,
    pub enabled: bool,
}

impl Schedule {
    pub fn parsed_days(&self) -> Result<Vec<u8>> {
        serde_json::from_str(&self.days)
            .with_context(|| format!("schedule {} has malformed days", self.id))
    }
}

/// Partial update for a zone; None fields are left untouched.
#[derive(Debug, Default, Deserialize)]
pub struct ZonePatch {
    pub name: Option<String>,
    pub moisture_threshold: Option<i64>,
    pub moisture_optimal: Option<i64>,
    pub auto_water_enabled: Option<bool>,
    pub default_duration: Option<i64>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
}

impl ZonePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.moisture_threshold.is_none()
            && self.moisture_optimal.is_none()
            && self.auto_water_enabled.is_none()
            && self.default_duration.is_none()
            && self.priority.is_none()
            && self.enabled.is_none()
    }
}

/// Partial update for a schedule; None fields are left untouched.
#[derive(Debug, Default, Deserialize)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub sequence_id: Option<i64>,
    pub days: Option<Vec<u8>>,
    pub time: Option<String>,
    pub enabled: Option<bool>,
}

impl SchedulePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.sequence_id.is_none()
            && self.days.is_none()
            && self.time.is_none()
            && self.enabled.is_none()
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS zones (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        relay_output TEXT NOT NULL,
        sensor_input TEXT NOT NULL DEFAULT '',
        moisture INTEGER,
        moisture_threshold INTEGER NOT NULL DEFAULT 30,
        moisture_optimal INTEGER NOT NULL DEFAULT 60,
        auto_water_enabled INTEGER NOT NULL DEFAULT 0,
        default_duration INTEGER NOT NULL DEFAULT 10,
        priority INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        is_active INTEGER NOT NULL DEFAULT 0,
        last_watered TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS sequences (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        steps TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS schedules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        sequence_id INTEGER NOT NULL,
        days TEXT NOT NULL,
        time TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS weather_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        temperature REAL,
        humidity INTEGER,
        rain_probability INTEGER,
        wind_speed REAL,
        description TEXT,
        timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
];

const DEFAULT_ZONE_COUNT: i64 = 12;

const ZONE_COLUMNS: &str = "id, name, position, relay_output, sensor_input, moisture, \
     moisture_threshold, moisture_optimal, auto_water_enabled, default_duration, \
     priority, enabled, is_active, last_watered";

impl Db {
    /// db_url examples:
    /// - "sqlite:irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Create all tables (idempotent) and seed default zones on a
    /// fresh database.
    pub async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("schema creation failed")?;
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM zones")
            .fetch_one(&self.pool)
            .await?;
        if count == 0 {
            for i in 1..=DEFAULT_ZONE_COUNT {
                sqlx::query(
                    "INSERT INTO zones (name, position, relay_output, sensor_input)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(format!("Zone {i}"))
                .bind(i)
                .bind(format!("IrrigationValve{i}"))
                .bind(format!("IrrigationMoisture{i}"))
                .execute(&self.pool)
                .await?;
            }
            tracing::info!(zones = DEFAULT_ZONE_COUNT, "seeded default zones");
        }
        Ok(())
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query_as::<_, Zone>(&format!(
            "SELECT {ZONE_COLUMNS} FROM zones ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("list_zones failed")?;
        Ok(rows)
    }

    pub async fn get_zone(&self, zone_id: i64) -> Result<Option<Zone>> {
        let row = sqlx::query_as::<_, Zone>(&format!(
            "SELECT {ZONE_COLUMNS} FROM zones WHERE id = ?"
        ))
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_zone failed")?;
        Ok(row)
    }

    pub async fn insert_zone(
        &self,
        name: &str,
        position: i64,
        relay_output: &str,
        sensor_input: &str,
    ) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO zones (name, position, relay_output, sensor_input)
             VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(position)
        .bind(relay_output)
        .bind(sensor_input)
        .execute(&self.pool)
        .await
        .context("insert_zone failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Returns the number of rows changed (0 = zone not found).
    pub async fn update_zone(&self, zone_id: i64, patch: &ZonePatch) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE zones SET ");
        let mut sep = qb.separated(", ");
        if let Some(v) = &patch.name {
            sep.push("name = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = patch.moisture_threshold {
            sep.push("moisture_threshold = ").push_bind_unseparated(v);
        }
        if let Some(v) = patch.moisture_optimal {
            sep.push("moisture_optimal = ").push_bind_unseparated(v);
        }
        if let Some(v) = patch.auto_water_enabled {
            sep.push("auto_water_enabled = ").push_bind_unseparated(v);
        }
        if let Some(v) = patch.default_duration {
            sep.push("default_duration = ").push_bind_unseparated(v);
        }
        if let Some(v) = patch.priority {
            sep.push("priority = ").push_bind_unseparated(v);
        }
        if let Some(v) = patch.enabled {
            sep.push("enabled = ").push_bind_unseparated(v);
        }
        qb.push(" WHERE id = ").push_bind(zone_id);

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("update_zone failed")?;
        Ok(res.rows_affected())
    }

    pub async fn delete_zone(&self, zone_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM zones WHERE id = ?")
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .context("delete_zone failed")?;
        Ok(res.rows_affected())
    }

    /// Commit a zone state transition. Turning a zone off also stamps
    /// `last_watered` with the local time.
    pub async fn set_zone_active(&self, zone_id: i64, on: bool) -> Result<()> {
        let sql = if on {
            "UPDATE zones SET is_active = 1 WHERE id = ?"
        } else {
            "UPDATE zones SET is_active = 0, last_watered = datetime('now','localtime') WHERE id = ?"
        };
        sqlx::query(sql)
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .context("set_zone_active failed")?;
        Ok(())
    }

    /// The currently watering zone, excluding `zone_id`, if any.
    pub async fn active_zone_other_than(&self, zone_id: i64) -> Result<Option<(i64, String)>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM zones WHERE is_active = 1 AND id != ?")
                .bind(zone_id)
                .fetch_optional(&self.pool)
                .await
                .context("active_zone_other_than failed")?;
        Ok(row)
    }

    pub async fn active_zone_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM zones WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await
            .context("active_zone_ids failed")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Apply a moisture reading to the zone whose sensor input matches.
    /// Returns the updated zone, or None when no zone uses the sensor.
    pub async fn update_moisture_by_sensor(
        &self,
        sensor: &str,
        moisture: i64,
    ) -> Result<Option<Zone>> {
        let res = sqlx::query("UPDATE zones SET moisture = ? WHERE sensor_input = ?")
            .bind(moisture)
            .bind(sensor)
            .execute(&self.pool)
            .await
            .context("update_moisture_by_sensor failed")?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, Zone>(&format!(
            "SELECT {ZONE_COLUMNS} FROM zones WHERE sensor_input = ?"
        ))
        .bind(sensor)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Zones with at least one known moisture reading, for the
    /// auto-water sweep.
    pub async fn zones_with_moisture(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query_as::<_, Zone>(&format!(
            "SELECT {ZONE_COLUMNS} FROM zones WHERE moisture IS NOT NULL ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("zones_with_moisture failed")?;
        Ok(rows)
    }

    /// Enabled zones in descending priority order, for the daily check.
    pub async fn enabled_zones_by_priority(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query_as::<_, Zone>(&format!(
            "SELECT {ZONE_COLUMNS} FROM zones WHERE enabled = 1 ORDER BY priority DESC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("enabled_zones_by_priority failed")?;
        Ok(rows)
    }

    // ----------------------------
    // Sequences
    // ----------------------------

    pub async fn list_sequences(&self) -> Result<Vec<Sequence>> {
        let rows = sqlx::query_as::<_, Sequence>(
            "SELECT id, name, steps, created_at FROM sequences ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_sequences failed")?;
        Ok(rows)
    }

    pub async fn get_sequence(&self, sequence_id: i64) -> Result<Option<Sequence>> {
        let row = sqlx::query_as::<_, Sequence>(
            "SELECT id, name, steps, created_at FROM sequences WHERE id = ?",
        )
        .bind(sequence_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_sequence failed")?;
        Ok(row)
    }

    pub async fn insert_sequence(&self, name: &str, steps: &[SequenceStep]) -> Result<i64> {
        let steps_json = serde_json::to_string(steps)?;
        let res = sqlx::query("INSERT INTO sequences (name, steps) VALUES (?, ?)")
            .bind(name)
            .bind(steps_json)
            .execute(&self.pool)
            .await
            .context("insert_sequence failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn delete_sequence(&self, sequence_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sequences WHERE id = ?")
            .bind(sequence_id)
            .execute(&self.pool)
            .await
            .context("delete_sequence failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>(
            "SELECT id, name, sequence_id, days, time, enabled FROM schedules ORDER BY time ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_schedules failed")?;
        Ok(rows)
    }

    pub async fn get_schedule(&self, schedule_id: i64) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>(
            "SELECT id, name, sequence_id, days, time, enabled FROM schedules WHERE id = ?",
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_schedule failed")?;
        Ok(row)
    }

    pub async fn enabled_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>(
            "SELECT id, name, sequence_id, days, time, enabled
             FROM schedules WHERE enabled = 1 ORDER BY time ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("enabled_schedules failed")?;
        Ok(rows)
    }

    pub async fn insert_schedule(
        &self,
        name: Option<&str>,
        sequence_id: i64,
        days: &[u8],
        time: &str,
        enabled: bool,
    ) -> Result<i64> {
        let days_json = serde_json::to_string(days)?;
        let res = sqlx::query(
            "INSERT INTO schedules (name, sequence_id, days, time, enabled)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(sequence_id)
        .bind(days_json)
        .bind(time)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .context("insert_schedule failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_schedule(&self, schedule_id: i64, patch: &SchedulePatch) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE schedules SET ");
        let mut sep = qb.separated(", ");
        if let Some(v) = &patch.name {
            sep.push("name = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = patch.sequence_id {
            sep.push("sequence_id = ").push_bind_unseparated(v);
        }
        if let Some(v) = &patch.days {
            let days_json = serde_json::to_string(v)?;
            sep.push("days = ").push_bind_unseparated(days_json);
        }
        if let Some(v) = &patch.time {
            sep.push("time = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = patch.enabled {
            sep.push("enabled = ").push_bind_unseparated(v);
        }
        qb.push(" WHERE id = ").push_bind(schedule_id);

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("update_schedule failed")?;
        Ok(res.rows_affected())
    }

    pub async fn delete_schedule(&self, schedule_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // Weather history
    // ----------------------------

    pub async fn insert_weather_log(
        &self,
        temperature: f64,
        humidity: i64,
        rain_probability: i64,
        wind_speed: f64,
        description: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO weather_log (temperature, humidity, rain_probability, wind_speed, description)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(temperature)
        .bind(humidity)
        .bind(rain_probability)
        .bind(wind_speed)
        .bind(description)
        .execute(&self.pool)
        .await
        .context("insert_weather_log failed")?;
        Ok(())
    }

    // ----------------------------
    // Settings (key-value)
    // ----------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("get_setting failed")?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("set_setting failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
