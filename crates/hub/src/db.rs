use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Current time as Unix epoch seconds. All persisted timestamps use this.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub auto_water_enabled: bool,
    pub moisture_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plant {
    pub plant_id: String,
    pub user_id: String,
    pub name: String,
    pub last_watered_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub threshold_id: String,
    pub plant_id: String,
    pub min_soil_moisture: Option<f64>,
    pub max_soil_moisture: Option<f64>,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub min_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub min_light: Option<f64>,
    pub max_light: Option<f64>,
    pub watering_interval_hours: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub mac_address: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub name: Option<String>,
    pub online: bool,
    pub last_seen_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<i64>,
    pub ip_address: Option<String>,
    pub reading_interval_sec: i64,
    pub user_id: Option<String>,
    pub plant_id: Option<String>,
    pub registered_at: i64,
}

/// Security-sensitive record, 1:1 with a device. The plaintext API key
/// is never stored; only the salted hash is.
#[derive(Debug, Clone)]
pub struct DeviceCredential {
    pub device_id: String,
    pub api_key_hash: String,
    pub api_key_salt: String,
    pub refresh_token: String,
    pub refresh_expires_at: i64,
    pub approved: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<i64>,
    pub failed_attempts: i64,
    pub locked_until: Option<i64>,
    pub request_count: i64,
    pub window_reset_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub plant_id: Option<String>,
    pub device_id: String,
    pub soil_moisture: f64,
    pub tank_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light_level: Option<f64>,
    pub air_quality: Option<f64>,
    pub recorded_at: i64,
}

#[derive(Debug, Clone)]
pub struct SensorReading {
    pub plant_id: Option<String>,
    pub device_id: String,
    pub soil_moisture: f64,
    pub tank_level: f64,
    pub recorded_at: i64,
}

#[derive(Debug, Clone)]
pub struct WateringEvent {
    pub plant_id: String,
    pub duration_sec: i64,
    pub mode: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub battery_level: Option<f64>,
    pub signal_strength: Option<i64>,
    pub firmware_version: Option<String>,
    pub ip_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_device(r: &SqliteRow) -> Device {
    Device {
        device_id: r.get("device_id"),
        mac_address: r.get("mac_address"),
        model: r.get("model"),
        firmware_version: r.get("firmware_version"),
        serial_number: r.get("serial_number"),
        name: r.get("name"),
        online: r.get("online"),
        last_seen_at: r.get("last_seen_at"),
        last_heartbeat_at: r.get("last_heartbeat_at"),
        battery_level: r.get("battery_level"),
        signal_strength: r.get("signal_strength"),
        ip_address: r.get("ip_address"),
        reading_interval_sec: r.get("reading_interval_sec"),
        user_id: r.get("user_id"),
        plant_id: r.get("plant_id"),
        registered_at: r.get("registered_at"),
    }
}

fn row_to_credential(r: &SqliteRow) -> DeviceCredential {
    DeviceCredential {
        device_id: r.get("device_id"),
        api_key_hash: r.get("api_key_hash"),
        api_key_salt: r.get("api_key_salt"),
        refresh_token: r.get("refresh_token"),
        refresh_expires_at: r.get("refresh_expires_at"),
        approved: r.get("approved"),
        approved_by: r.get("approved_by"),
        approved_at: r.get("approved_at"),
        failed_attempts: r.get("failed_attempts"),
        locked_until: r.get("locked_until"),
        request_count: r.get("request_count"),
        window_reset_at: r.get("window_reset_at"),
    }
}

fn row_to_threshold(r: &SqliteRow) -> Threshold {
    Threshold {
        threshold_id: r.get("threshold_id"),
        plant_id: r.get("plant_id"),
        min_soil_moisture: r.get("min_soil_moisture"),
        max_soil_moisture: r.get("max_soil_moisture"),
        min_temperature: r.get("min_temperature"),
        max_temperature: r.get("max_temperature"),
        min_humidity: r.get("min_humidity"),
        max_humidity: r.get("max_humidity"),
        min_light: r.get("min_light"),
        max_light: r.get("max_light"),
        watering_interval_hours: r.get("watering_interval_hours"),
        active: r.get("active"),
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/plantcare/plantcare.db?mode=rwc"
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

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Users / plants / thresholds (seeded collaborator data)
    // ----------------------------

    pub async fn upsert_user(&self, u: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, name, auto_water_enabled, moisture_threshold)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              name=excluded.name,
              auto_water_enabled=excluded.auto_water_enabled,
              moisture_threshold=excluded.moisture_threshold
            "#,
        )
        .bind(&u.user_id)
        .bind(&u.name)
        .bind(u.auto_water_enabled)
        .bind(u.moisture_threshold)
        .execute(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(())
    }

    pub async fn upsert_plant(&self, p: &Plant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plants (plant_id, user_id, name, last_watered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              user_id=excluded.user_id,
              name=excluded.name
            "#,
        )
        .bind(&p.plant_id)
        .bind(&p.user_id)
        .bind(&p.name)
        .bind(p.last_watered_at)
        .execute(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(())
    }

    pub async fn upsert_threshold(&self, t: &Threshold) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO thresholds (
              threshold_id, plant_id,
              min_soil_moisture, max_soil_moisture,
              min_temperature, max_temperature,
              min_humidity, max_humidity,
              min_light, max_light,
              watering_interval_hours, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(threshold_id) DO UPDATE SET
              plant_id=excluded.plant_id,
              min_soil_moisture=excluded.min_soil_moisture,
              max_soil_moisture=excluded.max_soil_moisture,
              min_temperature=excluded.min_temperature,
              max_temperature=excluded.max_temperature,
              min_humidity=excluded.min_humidity,
              max_humidity=excluded.max_humidity,
              min_light=excluded.min_light,
              max_light=excluded.max_light,
              watering_interval_hours=excluded.watering_interval_hours,
              active=excluded.active
            "#,
        )
        .bind(&t.threshold_id)
        .bind(&t.plant_id)
        .bind(t.min_soil_moisture)
        .bind(t.max_soil_moisture)
        .bind(t.min_temperature)
        .bind(t.max_temperature)
        .bind(t.min_humidity)
        .bind(t.max_humidity)
        .bind(t.min_light)
        .bind(t.max_light)
        .bind(t.watering_interval_hours)
        .bind(t.active)
        .execute(&self.pool)
        .await
        .context("upsert_threshold failed")?;
        Ok(())
    }

    pub async fn get_plant(&self, plant_id: &str) -> Result<Option<Plant>> {
        let row = sqlx::query(
            "SELECT plant_id, user_id, name, last_watered_at FROM plants WHERE plant_id = ?",
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant failed")?;

        Ok(row.map(|r| Plant {
            plant_id: r.get("plant_id"),
            user_id: r.get("user_id"),
            name: r.get("name"),
            last_watered_at: r.get("last_watered_at"),
        }))
    }

    /// The single active threshold for a plant, or None. The config layer
    /// guarantees at most one active row per plant; the LIMIT keeps the
    /// decision path safe even if that invariant is violated out-of-band.
    pub async fn active_threshold(&self, plant_id: &str) -> Result<Option<Threshold>> {
        let row = sqlx::query(
            r#"
            SELECT threshold_id, plant_id,
                   min_soil_moisture, max_soil_moisture,
                   min_temperature, max_temperature,
                   min_humidity, max_humidity,
                   min_light, max_light,
                   watering_interval_hours, active
            FROM thresholds
            WHERE plant_id = ? AND active = 1
            LIMIT 1
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("active_threshold failed")?;

        Ok(row.map(|r| row_to_threshold(&r)))
    }

    pub async fn users_with_auto_water(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, name, auto_water_enabled, moisture_threshold
            FROM users
            WHERE auto_water_enabled = 1
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("users_with_auto_water failed")?;

        Ok(rows
            .into_iter()
            .map(|r| User {
                user_id: r.get("user_id"),
                name: r.get("name"),
                auto_water_enabled: r.get("auto_water_enabled"),
                moisture_threshold: r.get("moisture_threshold"),
            })
            .collect())
    }

    pub async fn plants_for_user(&self, user_id: &str) -> Result<Vec<Plant>> {
        let rows = sqlx::query(
            r#"
            SELECT plant_id, user_id, name, last_watered_at
            FROM plants
            WHERE user_id = ?
            ORDER BY plant_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("plants_for_user failed")?;

        Ok(rows
            .into_iter()
            .map(|r| Plant {
                plant_id: r.get("plant_id"),
                user_id: r.get("user_id"),
                name: r.get("name"),
                last_watered_at: r.get("last_watered_at"),
            })
            .collect())
    }

    /// Bulk update of the last-watered stamp; never loads the plant row.
    pub async fn update_last_watered(&self, plant_id: &str, ts: i64) -> Result<()> {
        sqlx::query("UPDATE plants SET last_watered_at = ? WHERE plant_id = ?")
            .bind(ts)
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("update_last_watered failed")?;
        Ok(())
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn insert_device(&self, d: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, mac_address, model, firmware_version, serial_number,
              name, online, reading_interval_sec, user_id, plant_id, registered_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&d.device_id)
        .bind(&d.mac_address)
        .bind(&d.model)
        .bind(&d.firmware_version)
        .bind(&d.serial_number)
        .bind(&d.name)
        .bind(d.online)
        .bind(d.reading_interval_sec)
        .bind(&d.user_id)
        .bind(&d.plant_id)
        .bind(d.registered_at)
        .execute(&self.pool)
        .await
        .context("insert_device failed")?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_device failed")?;
        Ok(row.map(|r| row_to_device(&r)))
    }

    pub async fn get_device_by_mac(&self, mac_address: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE mac_address = ?")
            .bind(mac_address)
            .fetch_optional(&self.pool)
            .await
            .context("get_device_by_mac failed")?;
        Ok(row.map(|r| row_to_device(&r)))
    }

    pub async fn mark_online(&self, device_id: &str, ts: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET online = 1, last_seen_at = ? WHERE device_id = ?")
            .bind(ts)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("mark_online failed")?;
        Ok(())
    }

    /// Returns false if the device does not exist.
    pub async fn update_heartbeat(
        &self,
        device_id: &str,
        hb: &HeartbeatUpdate,
        ts: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
              online = 1,
              last_seen_at = ?,
              last_heartbeat_at = ?,
              battery_level = COALESCE(?, battery_level),
              signal_strength = COALESCE(?, signal_strength),
              firmware_version = COALESCE(?, firmware_version),
              ip_address = COALESCE(?, ip_address)
            WHERE device_id = ?
            "#,
        )
        .bind(ts)
        .bind(ts)
        .bind(hb.battery_level)
        .bind(hb.signal_strength)
        .bind(&hb.firmware_version)
        .bind(&hb.ip_address)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("update_heartbeat failed")?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn pending_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM devices d
            JOIN device_credentials c ON c.device_id = d.device_id
            WHERE c.approved = 0
            ORDER BY d.registered_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("pending_devices failed")?;
        Ok(rows.iter().map(row_to_device).collect())
    }

    /// Approval touches both tables in one transaction: the credential row
    /// gets the approval stamp, the device row gets its owner binding.
    /// Re-approval re-stamps approver and time. Returns false when the
    /// device is unknown.
    pub async fn approve_device(
        &self,
        device_id: &str,
        user_id: &str,
        plant_id: Option<&str>,
        device_name: Option<&str>,
        ts: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("approve_device: begin failed")?;

        let cred = sqlx::query(
            r#"
            UPDATE device_credentials
            SET approved = 1, approved_by = ?, approved_at = ?
            WHERE device_id = ?
            "#,
        )
        .bind(user_id)
        .bind(ts)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .context("approve_device: credential update failed")?;

        if cred.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE devices
            SET user_id = ?,
                plant_id = COALESCE(?, plant_id),
                name = COALESCE(?, name)
            WHERE device_id = ?
            "#,
        )
        .bind(user_id)
        .bind(plant_id)
        .bind(device_name)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .context("approve_device: device update failed")?;

        tx.commit().await.context("approve_device: commit failed")?;
        Ok(true)
    }

    // ----------------------------
    // Credentials + abuse counters
    // ----------------------------

    pub async fn insert_credentials(&self, c: &DeviceCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_credentials (
              device_id, api_key_hash, api_key_salt,
              refresh_token, refresh_expires_at,
              approved, failed_attempts, request_count, window_reset_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0)
            "#,
        )
        .bind(&c.device_id)
        .bind(&c.api_key_hash)
        .bind(&c.api_key_salt)
        .bind(&c.refresh_token)
        .bind(c.refresh_expires_at)
        .bind(c.approved)
        .execute(&self.pool)
        .await
        .context("insert_credentials failed")?;
        Ok(())
    }

    pub async fn get_credentials(&self, device_id: &str) -> Result<Option<DeviceCredential>> {
        let row = sqlx::query("SELECT * FROM device_credentials WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_credentials failed")?;
        Ok(row.map(|r| row_to_credential(&r)))
    }

    /// One failed authentication attempt: bump the counter, and set the
    /// lock expiry in the same statement once the threshold is reached.
    /// A single UPDATE keeps concurrent failures from undercounting.
    pub async fn record_failed_auth(
        &self,
        device_id: &str,
        now: i64,
        threshold: i64,
        lockout_secs: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE device_credentials SET
              failed_attempts = failed_attempts + 1,
              locked_until = CASE
                WHEN failed_attempts + 1 >= ? THEN ? + ?
                ELSE locked_until
              END
            WHERE device_id = ?
            "#,
        )
        .bind(threshold)
        .bind(now)
        .bind(lockout_secs)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("record_failed_auth failed")?;
        Ok(())
    }

    /// Successful authentication zeroes the counter. Does not clear an
    /// active lock early.
    pub async fn reset_failed_auth(&self, device_id: &str) -> Result<()> {
        sqlx::query("UPDATE device_credentials SET failed_attempts = 0 WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("reset_failed_auth failed")?;
        Ok(())
    }

    /// Lock check with auto-unlock: an expired lock is cleared and the
    /// counter reset in one idempotent statement before the state is read.
    pub async fn is_locked(&self, device_id: &str, now: i64) -> Result<bool> {
        sqlx::query(
            r#"
            UPDATE device_credentials
            SET locked_until = NULL, failed_attempts = 0
            WHERE device_id = ? AND locked_until IS NOT NULL AND locked_until <= ?
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("is_locked: auto-unlock failed")?;

        let row = sqlx::query("SELECT locked_until FROM device_credentials WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("is_locked: select failed")?;

        Ok(match row {
            Some(r) => matches!(r.get::<Option<i64>, _>("locked_until"), Some(until) if until > now),
            None => false,
        })
    }

    /// Fixed-window rate limit as a single conditional UPDATE: an expired
    /// window restarts at 1, an open window increments only below the cap.
    /// Zero rows affected means the request is rejected without counting.
    pub async fn check_rate_limit(
        &self,
        device_id: &str,
        now: i64,
        window_secs: i64,
        max_requests: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE device_credentials SET
              request_count = CASE
                WHEN window_reset_at <= ? THEN 1
                ELSE request_count + 1
              END,
              window_reset_at = CASE
                WHEN window_reset_at <= ? THEN ? + ?
                ELSE window_reset_at
              END
            WHERE device_id = ?
              AND (window_reset_at <= ? OR request_count < ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(window_secs)
        .bind(device_id)
        .bind(now)
        .bind(max_requests)
        .execute(&self.pool)
        .await
        .context("check_rate_limit failed")?;

        Ok(result.rows_affected() == 1)
    }

    // ----------------------------
    // Readings + watering events (append-only)
    // ----------------------------

    pub async fn insert_reading(&self, r: &NewReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (
              plant_id, device_id, soil_moisture, tank_level,
              temperature, humidity, light_level, air_quality, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.plant_id)
        .bind(&r.device_id)
        .bind(r.soil_moisture)
        .bind(r.tank_level)
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.light_level)
        .bind(r.air_quality)
        .bind(r.recorded_at)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn latest_reading(&self, plant_id: &str) -> Result<Option<SensorReading>> {
        let row = sqlx::query(
            r#"
            SELECT plant_id, device_id, soil_moisture, tank_level, recorded_at
            FROM sensor_readings
            WHERE plant_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")?;

        Ok(row.map(|r| SensorReading {
            plant_id: r.get("plant_id"),
            device_id: r.get("device_id"),
            soil_moisture: r.get("soil_moisture"),
            tank_level: r.get("tank_level"),
            recorded_at: r.get("recorded_at"),
        }))
    }

    pub async fn reading_count(&self, plant_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sensor_readings WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_one(&self.pool)
            .await
            .context("reading_count failed")?;
        Ok(row.get("n"))
    }

    pub async fn insert_watering_event(
        &self,
        plant_id: &str,
        duration_sec: i64,
        mode: &str,
        ts: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (plant_id, duration_sec, mode, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(plant_id)
        .bind(duration_sec)
        .bind(mode)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    pub async fn latest_watering_event(&self, plant_id: &str) -> Result<Option<WateringEvent>> {
        let row = sqlx::query(
            r#"
            SELECT plant_id, duration_sec, mode, created_at
            FROM watering_events
            WHERE plant_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_watering_event failed")?;

        Ok(row.map(|r| WateringEvent {
            plant_id: r.get("plant_id"),
            duration_sec: r.get("duration_sec"),
            mode: r.get("mode"),
            created_at: r.get("created_at"),
        }))
    }

    pub async fn watering_event_count(&self, plant_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM watering_events WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_one(&self.pool)
            .await
            .context("watering_event_count failed")?;
        Ok(row.get("n"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
