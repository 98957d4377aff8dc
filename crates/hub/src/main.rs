mod config;
mod db;
mod engine;
mod error;
mod identity;
mod mqtt;
mod scheduler;
mod state;
mod web;

use anyhow::{Context, Result};
use std::env;

use db::Db;
use mqtt::Broadcaster;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:plantcare.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mqtt_host = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    // Secrets have no defaults.
    let token_secret =
        env::var("TOKEN_SECRET").context("TOKEN_SECRET environment variable must be set")?;
    let admin_token =
        env::var("ADMIN_TOKEN").context("ADMIN_TOKEN environment variable must be set")?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed users + plants + thresholds) ──────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    eprintln!(
        "db ready — {} user(s), {} plant(s), {} threshold(s) seeded",
        cfg.users.len(),
        cfg.plants.len(),
        cfg.thresholds.len()
    );

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = state::shared();
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── Broadcast (MQTT) ────────────────────────────────────────────
    let (broadcast, eventloop) = Broadcaster::connect(&mqtt_host, mqtt_port);
    tokio::spawn(mqtt::drive(eventloop, shared.clone()));

    // ── Auto-watering scheduler ─────────────────────────────────────
    tokio::spawn(scheduler::run(db.clone(), shared.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let app_state = AppState {
        db,
        broadcast,
        shared,
        token_secret,
        admin_token,
    };
    web::serve(app_state).await;

    Ok(())
}
