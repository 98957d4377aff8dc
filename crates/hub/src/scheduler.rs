//! Auto-watering scheduler: the slow, proactive path. Every tick it
//! re-evaluates each opted-in user's plants against the latest persisted
//! reading and waters through the same append path the telemetry engine
//! uses, so both paths share one source of truth for "was this plant
//! watered recently".
//!
//! Guard sequence per plant:
//!
//! ```text
//! no reading ──────────────▶ skip
//! reading older than 30min ▶ skip   (stale data never waters)
//! moisture >= threshold ───▶ skip
//! watered within 2h ───────▶ skip   (cooldown)
//! otherwise ───────────────▶ append watering event
//! ```

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::db::{now_unix, Db, Plant, User};
use crate::state::SharedState;

/// How often the scheduler evaluates all plants.
pub const TICK_INTERVAL_SEC: u64 = 300;

/// A reading older than this never triggers watering.
const STALE_READING_SECS: i64 = 30 * 60;

/// Minimum gap between two scheduler-triggered waterings of one plant.
const WATERING_COOLDOWN_SECS: i64 = 2 * 60 * 60;

/// Pump run time for scheduler-triggered waterings. The user-level path
/// has no per-plant interval to derive a band from.
const AUTO_WATER_DURATION_SEC: i64 = 5;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
/// The tick body runs to completion before the next tick is awaited, so
/// ticks never overlap.
pub async fn run(db: Db, shared: SharedState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));

    info!(tick_sec = TICK_INTERVAL_SEC, "auto-watering scheduler started");
    {
        let mut st = shared.write().await;
        st.record_system("auto-watering scheduler started".to_string());
    }

    loop {
        ticker.tick().await;
        run_tick(&db, &shared).await;
    }
}

/// One full scan. A single plant's failure is logged and never aborts
/// the remaining plants in the tick.
pub(crate) async fn run_tick(db: &Db, shared: &SharedState) {
    let users = match db.users_with_auto_water().await {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "scheduler: failed to load auto-watering users");
            return;
        }
    };

    for user in &users {
        let plants = match db.plants_for_user(&user.user_id).await {
            Ok(plants) => plants,
            Err(e) => {
                error!(user = %user.user_id, error = %e, "scheduler: failed to load plants");
                continue;
            }
        };

        for plant in &plants {
            if let Err(e) = evaluate_plant(db, shared, user, plant).await {
                error!(
                    plant = %plant.plant_id,
                    user = %user.user_id,
                    error = %e,
                    "scheduler: plant evaluation failed"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-plant evaluation
// ---------------------------------------------------------------------------

/// Evaluate one plant against its owner's moisture threshold. Returns
/// true if a watering event was appended.
async fn evaluate_plant(
    db: &Db,
    shared: &SharedState,
    user: &User,
    plant: &Plant,
) -> Result<bool> {
    let Some(latest) = db.latest_reading(&plant.plant_id).await? else {
        return Ok(false);
    };

    let now = now_unix();
    let age = now - latest.recorded_at;
    if age > STALE_READING_SECS {
        warn!(
            plant = %plant.plant_id,
            age_sec = age,
            stale_limit_sec = STALE_READING_SECS,
            "scheduler: stale reading — skipping"
        );
        return Ok(false);
    }

    if latest.soil_moisture >= user.moisture_threshold {
        return Ok(false);
    }

    // Cooldown: one persistently-low reading must not cause runaway
    // watering across consecutive ticks.
    if let Some(event) = db.latest_watering_event(&plant.plant_id).await? {
        if now - event.created_at < WATERING_COOLDOWN_SECS {
            return Ok(false);
        }
    }

    db.insert_watering_event(
        &plant.plant_id,
        AUTO_WATER_DURATION_SEC,
        crate::engine::MODE_AUTOMATIC,
        now,
    )
    .await?;
    db.update_last_watered(&plant.plant_id, now).await?;

    info!(
        plant = %plant.plant_id,
        user = %user.user_id,
        moisture = latest.soil_moisture,
        threshold = user.moisture_threshold,
        "scheduler: watering triggered"
    );
    {
        let mut st = shared.write().await;
        st.record_watering(&plant.plant_id, AUTO_WATER_DURATION_SEC, "scheduler");
    }

    Ok(true)
}

// ===========================================================================
// Tests
// ===========================================================================
