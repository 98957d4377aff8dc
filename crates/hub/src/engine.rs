//! Telemetry decision engine: maps an inbound sensor sample to a
//! WATER/SLEEP/ERROR command for the device that sent it.
//!
//! Reads are idempotent — the decision depends only on the sample and the
//! plant's active threshold, never on prior decisions. Writes are not:
//! every processed sample appends a reading row (and possibly a watering
//! event), so a replayed sample produces duplicate rows. There is no
//! sample-level dedup key; see the open-questions section of DESIGN.md.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{now_unix, Db, NewReading, Threshold};
use crate::error::{ApiError, ApiResult};
use crate::mqtt::{Broadcaster, ReadingUpdate};
use crate::state::SharedState;

/// Watering is considered when soil moisture drops below the threshold's
/// minimum; this default applies when the threshold leaves it unset.
pub const DEFAULT_MIN_SOIL_MOISTURE: f64 = 30.0;
/// The pump never runs with less than this much water in the tank.
pub const MIN_TANK_LEVEL_PCT: f64 = 5.0;
/// Watering mode recorded on events triggered by telemetry.
pub const MODE_AUTOMATIC: &str = "automatic";

// ---------------------------------------------------------------------------
// Sample + decision types
// ---------------------------------------------------------------------------

/// One inbound telemetry sample. Transient — its durable projection is a
/// sensor_readings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub device_id: String,
    pub soil_moisture: f64,
    pub tank_level: f64,
    pub air_temp: Option<f64>,
    pub air_humidity: Option<f64>,
    pub light_level: Option<f64>,
    pub air_quality: Option<f64>,
}

/// Closed command set; callers get exhaustiveness checking instead of
/// free-form strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Water { duration_sec: i64 },
    Sleep,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Water { .. } => "WATER",
            Self::Sleep => "SLEEP",
            Self::Error => "ERROR",
        }
    }

    pub fn duration_sec(&self) -> Option<i64> {
        match self {
            Self::Water { duration_sec } => Some(*duration_sec),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Decision {
    pub command: Command,
    pub message: String,
    /// Seconds until the device should report again; lets it self-pace.
    pub next_check_in: Option<i64>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject out-of-range values before any state mutation.
pub fn validate_sample(sample: &TelemetrySample) -> ApiResult<()> {
    if !(0.0..=100.0).contains(&sample.soil_moisture) {
        return Err(ApiError::Validation(format!(
            "soilMoisture {} out of range [0, 100]",
            sample.soil_moisture
        )));
    }
    if !(0.0..=100.0).contains(&sample.tank_level) {
        return Err(ApiError::Validation(format!(
            "tankLevel {} out of range [0, 100]",
            sample.tank_level
        )));
    }
    if let Some(t) = sample.air_temp {
        if !(-50.0..=100.0).contains(&t) {
            return Err(ApiError::Validation(format!(
                "airTemp {t} out of range [-50, 100]"
            )));
        }
    }
    if let Some(h) = sample.air_humidity {
        if !(0.0..=100.0).contains(&h) {
            return Err(ApiError::Validation(format!(
                "airHumidity {h} out of range [0, 100]"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decision helpers
// ---------------------------------------------------------------------------

fn needs_watering(soil_moisture: f64, threshold: &Threshold) -> bool {
    soil_moisture < threshold.min_soil_moisture.unwrap_or(DEFAULT_MIN_SOIL_MOISTURE)
}

fn has_water(tank_level: f64) -> bool {
    tank_level > MIN_TANK_LEVEL_PCT
}

/// Pump run time from the threshold's configured watering interval:
/// short intervals get short pulses, long intervals deeper soaks.
fn watering_duration(interval_hours: Option<i64>) -> i64 {
    match interval_hours {
        Some(h) if h <= 12 => 3,
        Some(h) if h <= 48 => 5,
        Some(_) => 8,
        None => 5,
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Process one validated telemetry sample. Infra failures on the
/// decision-affecting persistence paths surface as errors; broadcast
/// failures never do.
pub async fn process_telemetry(
    db: &Db,
    broadcast: &Broadcaster,
    shared: &SharedState,
    sample: &TelemetrySample,
) -> Result<Decision> {
    let now = now_unix();

    let Some(device) = db.get_device(&sample.device_id).await? else {
        warn!(device = %sample.device_id, "telemetry from unknown device");
        return Ok(Decision {
            command: Command::Error,
            message: "unknown device".to_string(),
            next_check_in: None,
        });
    };

    // The device spoke to us, whatever we decide below.
    db.mark_online(&device.device_id, now).await?;

    let next_check_in = Some(device.reading_interval_sec);

    let Some(plant_id) = device.plant_id.clone() else {
        // Unassigned devices still get their readings recorded, just
        // without a plant to decide for.
        db.insert_reading(&reading_row(sample, None, now)).await?;
        return Ok(Decision {
            command: Command::Sleep,
            message: "device has no assigned plant".to_string(),
            next_check_in,
        });
    };

    let plant = db
        .get_plant(&plant_id)
        .await?
        .with_context(|| format!("device {} references missing plant {plant_id}", device.device_id))?;

    db.insert_reading(&reading_row(sample, Some(plant_id.clone()), now))
        .await?;

    broadcast.publish_reading(&reading_update(sample, &plant_id, &plant.name, now, false));
    {
        let mut st = shared.write().await;
        st.record_reading(&device.device_id, &plant.name, sample.soil_moisture);
    }

    let Some(threshold) = db.active_threshold(&plant_id).await? else {
        return Ok(Decision {
            command: Command::Sleep,
            message: format!("no active threshold configured for plant {plant_id}"),
            next_check_in,
        });
    };

    if needs_watering(sample.soil_moisture, &threshold) {
        if has_water(sample.tank_level) {
            let duration_sec = watering_duration(threshold.watering_interval_hours);

            db.insert_watering_event(&plant_id, duration_sec, MODE_AUTOMATIC, now)
                .await?;
            db.update_last_watered(&plant_id, now).await?;

            broadcast.publish_reading(&reading_update(sample, &plant_id, &plant.name, now, true));
            {
                let mut st = shared.write().await;
                st.record_watering(&plant_id, duration_sec, "telemetry");
            }

            info!(
                plant = %plant_id,
                device = %device.device_id,
                soil = sample.soil_moisture,
                duration_sec,
                "watering triggered"
            );

            return Ok(Decision {
                command: Command::Water { duration_sec },
                message: format!("watering for {duration_sec}s"),
                next_check_in,
            });
        }

        // The spot where an operator alert belongs: the plant is dry and
        // we cannot water it.
        warn!(
            plant = %plant_id,
            device = %device.device_id,
            tank = sample.tank_level,
            "watering needed but tank level too low"
        );
        return Ok(Decision {
            command: Command::Sleep,
            message: "watering needed but tank level too low".to_string(),
            next_check_in,
        });
    }

    Ok(Decision {
        command: Command::Sleep,
        message: "soil moisture adequate".to_string(),
        next_check_in,
    })
}

fn reading_row(sample: &TelemetrySample, plant_id: Option<String>, now: i64) -> NewReading {
    NewReading {
        plant_id,
        device_id: sample.device_id.clone(),
        soil_moisture: sample.soil_moisture,
        tank_level: sample.tank_level,
        temperature: sample.air_temp,
        humidity: sample.air_humidity,
        light_level: sample.light_level,
        air_quality: sample.air_quality,
        recorded_at: now,
    }
}

fn reading_update(
    sample: &TelemetrySample,
    plant_id: &str,
    plant_name: &str,
    now: i64,
    is_watering: bool,
) -> ReadingUpdate {
    ReadingUpdate {
        plant_id: plant_id.to_string(),
        plant_name: plant_name.to_string(),
        soil_moisture: sample.soil_moisture,
        water_level: sample.tank_level,
        air_temp: sample.air_temp,
        air_humidity: sample.air_humidity,
        light_level: sample.light_level,
        air_quality: sample.air_quality,
        timestamp: now,
        is_watering,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, Device, Plant, User};
    use crate::state;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn test_broadcaster() -> (Broadcaster, rumqttc::EventLoop) {
        // The event loop is never polled; publishes accumulate in the
        // client buffer, which is enough to exercise the decision path.
        Broadcaster::connect("127.0.0.1", 1883)
    }

    fn sample(device_id: &str, soil: f64, tank: f64) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.to_string(),
            soil_moisture: soil,
            tank_level: tank,
            air_temp: Some(21.5),
            air_humidity: Some(40.0),
            light_level: None,
            air_quality: None,
        }
    }

    /// Seed a user, plant, device (assigned to the plant), and optionally
    /// an active threshold with the given min moisture / interval.
    async fn seeded(db: &Db, threshold: Option<(Option<f64>, Option<i64>)>) {
        db.upsert_user(&User {
            user_id: "u1".into(),
            name: "Alice".into(),
            auto_water_enabled: false,
            moisture_threshold: 30.0,
        })
        .await
        .unwrap();
        db.upsert_plant(&Plant {
            plant_id: "p1".into(),
            user_id: "u1".into(),
            name: "Monstera".into(),
            last_watered_at: None,
        })
        .await
        .unwrap();
        db.insert_device(&Device {
            device_id: "d1".into(),
            mac_address: "AA:BB:CC:DD:EE:FF".into(),
            model: "soil-pump-v2".into(),
            firmware_version: None,
            serial_number: None,
            name: None,
            online: false,
            last_seen_at: None,
            last_heartbeat_at: None,
            battery_level: None,
            signal_strength: None,
            ip_address: None,
            reading_interval_sec: 300,
            user_id: Some("u1".into()),
            plant_id: Some("p1".into()),
            registered_at: 0,
        })
        .await
        .unwrap();

        if let Some((min_soil, interval)) = threshold {
            db.upsert_threshold(&crate::db::Threshold {
                threshold_id: "t1".into(),
                plant_id: "p1".into(),
                min_soil_moisture: min_soil,
                max_soil_moisture: None,
                min_temperature: None,
                max_temperature: None,
                min_humidity: None,
                max_humidity: None,
                min_light: None,
                max_light: None,
                watering_interval_hours: interval,
                active: true,
            })
            .await
            .unwrap();
        }
    }

    // -- validation --------------------------------------------------------

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(validate_sample(&sample("d1", 20.0, 50.0)).is_ok());
        assert!(validate_sample(&sample("d1", -1.0, 50.0)).is_err());
        assert!(validate_sample(&sample("d1", 100.1, 50.0)).is_err());
        assert!(validate_sample(&sample("d1", 20.0, -0.5)).is_err());
        assert!(validate_sample(&sample("d1", 20.0, 101.0)).is_err());

        let mut s = sample("d1", 20.0, 50.0);
        s.air_temp = Some(-80.0);
        assert!(validate_sample(&s).is_err());
        s.air_temp = None;
        s.air_humidity = Some(120.0);
        assert!(validate_sample(&s).is_err());
    }

    #[test]
    fn sample_deserializes_camel_case() {
        let json = r#"{"deviceId":"d1","soilMoisture":20.0,"tankLevel":50.0,"airTemp":21.0}"#;
        let s: TelemetrySample = serde_json::from_str(json).unwrap();
        assert_eq!(s.device_id, "d1");
        assert_eq!(s.soil_moisture, 20.0);
        assert_eq!(s.air_temp, Some(21.0));
        assert!(s.light_level.is_none());
    }

    // -- duration bands ----------------------------------------------------

    #[test]
    fn watering_duration_bands() {
        assert_eq!(watering_duration(Some(6)), 3);
        assert_eq!(watering_duration(Some(12)), 3); // inclusive boundary
        assert_eq!(watering_duration(Some(13)), 5);
        assert_eq!(watering_duration(Some(48)), 5); // inclusive boundary
        assert_eq!(watering_duration(Some(49)), 8);
        assert_eq!(watering_duration(Some(168)), 8);
        assert_eq!(watering_duration(None), 5);
    }

    // -- decisions ---------------------------------------------------------

    #[tokio::test]
    async fn dry_soil_with_water_triggers_watering() {
        let db = test_db().await;
        seeded(&db, Some((Some(30.0), Some(24)))).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("d1", 20.0, 50.0))
            .await
            .unwrap();

        assert_eq!(decision.command, Command::Water { duration_sec: 5 });
        assert_eq!(decision.next_check_in, Some(300));

        // One reading, one watering event, last-watered stamped.
        assert_eq!(db.reading_count("p1").await.unwrap(), 1);
        assert_eq!(db.watering_event_count("p1").await.unwrap(), 1);
        let event = db.latest_watering_event("p1").await.unwrap().unwrap();
        assert_eq!(event.mode, "automatic");
        assert_eq!(event.duration_sec, 5);
        let plant = db.get_plant("p1").await.unwrap().unwrap();
        assert!(plant.last_watered_at.is_some());

        // Device was marked online.
        let device = db.get_device("d1").await.unwrap().unwrap();
        assert!(device.online);
    }

    #[tokio::test]
    async fn adequate_moisture_sleeps() {
        let db = test_db().await;
        seeded(&db, Some((Some(30.0), Some(24)))).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("d1", 40.0, 50.0))
            .await
            .unwrap();

        assert_eq!(decision.command, Command::Sleep);
        assert!(decision.message.contains("adequate"));
        assert_eq!(db.watering_event_count("p1").await.unwrap(), 0);
        // The reading is still persisted.
        assert_eq!(db.reading_count("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn low_tank_sleeps_without_watering_event() {
        let db = test_db().await;
        seeded(&db, Some((Some(30.0), Some(24)))).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("d1", 20.0, 3.0))
            .await
            .unwrap();

        assert_eq!(decision.command, Command::Sleep);
        assert!(decision.message.contains("tank"));
        assert_eq!(db.watering_event_count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_threshold_min_falls_back_to_default() {
        let db = test_db().await;
        // Active threshold with no min_soil_moisture: default of 30 applies.
        seeded(&db, Some((None, Some(24)))).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let watered = process_telemetry(&db, &bc, &shared, &sample("d1", 29.0, 50.0))
            .await
            .unwrap();
        assert!(matches!(watered.command, Command::Water { .. }));

        let slept = process_telemetry(&db, &bc, &shared, &sample("d1", 31.0, 50.0))
            .await
            .unwrap();
        assert_eq!(slept.command, Command::Sleep);
    }

    #[tokio::test]
    async fn interval_bands_drive_duration() {
        let db = test_db().await;
        seeded(&db, Some((Some(30.0), Some(8)))).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("d1", 10.0, 90.0))
            .await
            .unwrap();
        assert_eq!(decision.command, Command::Water { duration_sec: 3 });
    }

    #[tokio::test]
    async fn no_active_threshold_sleeps_with_misconfiguration_message() {
        let db = test_db().await;
        seeded(&db, None).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("d1", 10.0, 90.0))
            .await
            .unwrap();

        assert_eq!(decision.command, Command::Sleep);
        assert!(decision.message.contains("no active threshold"));
        // The reading was persisted anyway; only the decision degraded.
        assert_eq!(db.reading_count("p1").await.unwrap(), 1);
        assert_eq!(db.watering_event_count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_device_errors_without_persisting() {
        let db = test_db().await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("ghost", 20.0, 50.0))
            .await
            .unwrap();

        assert_eq!(decision.command, Command::Error);
        assert!(decision.next_check_in.is_none());
    }

    #[tokio::test]
    async fn unassigned_device_sleeps_but_records_plantless_reading() {
        let db = test_db().await;
        seeded(&db, Some((Some(30.0), Some(24)))).await;
        // Detach the device from its plant.
        sqlx::query("UPDATE devices SET plant_id = NULL WHERE device_id = 'd1'")
            .execute(db.pool())
            .await
            .unwrap();
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let decision = process_telemetry(&db, &bc, &shared, &sample("d1", 10.0, 90.0))
            .await
            .unwrap();

        assert_eq!(decision.command, Command::Sleep);
        assert!(decision.message.contains("no assigned plant"));
        assert_eq!(decision.next_check_in, Some(300));
        // Recorded without a plant id, and nothing to water.
        assert_eq!(db.reading_count("p1").await.unwrap(), 0);
        assert_eq!(db.watering_event_count("p1").await.unwrap(), 0);
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sensor_readings WHERE plant_id IS NULL")
            .fetch_one(db.pool())
            .await
            .unwrap();
        use sqlx::Row;
        assert_eq!(row.get::<i64, _>("n"), 1);
    }

    /// Replaying the same sample creates duplicate rows: there is no
    /// sample-level idempotency key. Documented limitation.
    #[tokio::test]
    async fn replayed_sample_creates_duplicate_rows() {
        let db = test_db().await;
        seeded(&db, Some((Some(30.0), Some(24)))).await;
        let (bc, _el) = test_broadcaster();
        let shared = state::shared();

        let s = sample("d1", 20.0, 50.0);
        process_telemetry(&db, &bc, &shared, &s).await.unwrap();
        process_telemetry(&db, &bc, &shared, &s).await.unwrap();

        assert_eq!(db.reading_count("p1").await.unwrap(), 2);
        assert_eq!(db.watering_event_count("p1").await.unwrap(), 2);
    }
}
