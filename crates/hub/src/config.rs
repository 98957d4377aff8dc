//! TOML config file loading, validation, and database seeding for the
//! read-only collaborator data: users, plants, and thresholds.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::{Db, Plant, Threshold, User};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub auto_water_enabled: bool,
    #[serde(default = "default_moisture_threshold")]
    pub moisture_threshold: f64,
}

fn default_moisture_threshold() -> f64 {
    30.0
}

#[derive(Debug, Deserialize)]
pub struct PlantEntry {
    pub plant_id: String,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdEntry {
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
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_users(&mut errors);
        self.validate_plants(&mut errors);
        self.validate_thresholds(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_users(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, u) in self.users.iter().enumerate() {
            let ctx = || {
                if u.user_id.is_empty() {
                    format!("users[{i}]")
                } else {
                    format!("user '{}'", u.user_id)
                }
            };

            if u.user_id.trim().is_empty() {
                errors.push(format!("{}: user_id is empty", ctx()));
            } else if !seen_ids.insert(&u.user_id) {
                errors.push(format!("{}: duplicate user_id", ctx()));
            }

            if u.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if !(0.0..=100.0).contains(&u.moisture_threshold) {
                errors.push(format!(
                    "{}: moisture_threshold {} out of range [0, 100]",
                    ctx(),
                    u.moisture_threshold
                ));
            }
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let user_ids: HashSet<&str> = self.users.iter().map(|u| u.user_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.plant_id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.plant_id)
                }
            };

            if p.plant_id.trim().is_empty() {
                errors.push(format!("{}: plant_id is empty", ctx()));
            } else if !seen_ids.insert(&p.plant_id) {
                errors.push(format!("{}: duplicate plant_id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if p.user_id.trim().is_empty() {
                errors.push(format!("{}: user_id is empty", ctx()));
            } else if !user_ids.contains(p.user_id.as_str()) {
                errors.push(format!(
                    "{}: user_id '{}' does not match any defined user",
                    ctx(),
                    p.user_id
                ));
            }
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let plant_ids: HashSet<&str> = self.plants.iter().map(|p| p.plant_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut active_per_plant: HashSet<&str> = HashSet::new();

        for (i, t) in self.thresholds.iter().enumerate() {
            let ctx = || {
                if t.threshold_id.is_empty() {
                    format!("thresholds[{i}]")
                } else {
                    format!("threshold '{}'", t.threshold_id)
                }
            };

            if t.threshold_id.trim().is_empty() {
                errors.push(format!("{}: threshold_id is empty", ctx()));
            } else if !seen_ids.insert(&t.threshold_id) {
                errors.push(format!("{}: duplicate threshold_id", ctx()));
            }

            if t.plant_id.trim().is_empty() {
                errors.push(format!("{}: plant_id is empty", ctx()));
            } else if !plant_ids.contains(t.plant_id.as_str()) {
                errors.push(format!(
                    "{}: plant_id '{}' does not match any defined plant",
                    ctx(),
                    t.plant_id
                ));
            }

            // The decision path reads at most one active threshold per
            // plant; enforce the invariant here, at the source.
            if t.active && !active_per_plant.insert(t.plant_id.as_str()) {
                errors.push(format!(
                    "{}: plant '{}' already has an active threshold",
                    ctx(),
                    t.plant_id
                ));
            }

            // ── Percentage bounds ───────────────────────────────
            for (field, value) in [
                ("min_soil_moisture", t.min_soil_moisture),
                ("max_soil_moisture", t.max_soil_moisture),
                ("min_humidity", t.min_humidity),
                ("max_humidity", t.max_humidity),
            ] {
                if let Some(v) = value {
                    if !(0.0..=100.0).contains(&v) {
                        errors.push(format!("{}: {field} {v} out of range [0, 100]", ctx()));
                    }
                }
            }

            // ── Min/max ordering ────────────────────────────────
            for (label, min, max) in [
                ("soil_moisture", t.min_soil_moisture, t.max_soil_moisture),
                ("temperature", t.min_temperature, t.max_temperature),
                ("humidity", t.min_humidity, t.max_humidity),
                ("light", t.min_light, t.max_light),
            ] {
                if let (Some(lo), Some(hi)) = (min, max) {
                    if hi <= lo {
                        errors.push(format!(
                            "{}: max_{label} ({hi}) must be greater than min_{label} ({lo})",
                            ctx()
                        ));
                    }
                }
            }

            if let Some(h) = t.watering_interval_hours {
                if h <= 0 {
                    errors.push(format!(
                        "{}: watering_interval_hours must be positive, got {h}",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path}"))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("failed to parse config file: {path}"))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Seed the database from the validated config. Upserts, so re-running
/// with an edited file updates rows in place.
pub async fn apply(cfg: &Config, db: &Db) -> Result<()> {
    for u in &cfg.users {
        db.upsert_user(&User {
            user_id: u.user_id.clone(),
            name: u.name.clone(),
            auto_water_enabled: u.auto_water_enabled,
            moisture_threshold: u.moisture_threshold,
        })
        .await?;
    }

    for p in &cfg.plants {
        db.upsert_plant(&Plant {
            plant_id: p.plant_id.clone(),
            user_id: p.user_id.clone(),
            name: p.name.clone(),
            last_watered_at: None,
        })
        .await?;
    }

    for t in &cfg.thresholds {
        db.upsert_threshold(&Threshold {
            threshold_id: t.threshold_id.clone(),
            plant_id: t.plant_id.clone(),
            min_soil_moisture: t.min_soil_moisture,
            max_soil_moisture: t.max_soil_moisture,
            min_temperature: t.min_temperature,
            max_temperature: t.max_temperature,
            min_humidity: t.min_humidity,
            max_humidity: t.max_humidity,
            min_light: t.min_light,
            max_light: t.max_light,
            watering_interval_hours: t.watering_interval_hours,
            active: t.active,
        })
        .await?;
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
