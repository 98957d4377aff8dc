//! Device simulator: walks the full lifecycle a real sensor/pump unit
//! would — register once, then loop signed telemetry against the hub and
//! obey whatever command comes back. Useful for driving a hub end-to-end
//! without hardware.

mod sim;

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};

use sim::PlantSim;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_SAMPLE_EVERY_S: u64 = 300;

// ---------------------------------------------------------------------------
// Hub API types (device-side view)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    device_id: String,
    device_token: String,
    api_key: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    device_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryResponse {
    command: String,
    duration: Option<i64>,
    message: String,
    next_check_in_seconds: Option<i64>,
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Same construction the hub verifies: HMAC-SHA256 of the raw body under
/// the API key, hex-encoded.
fn sign_payload(payload: &[u8], api_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

// ---------------------------------------------------------------------------
// Hub calls
// ---------------------------------------------------------------------------

async fn register(
    client: &reqwest::Client,
    base: &str,
    mac_address: &str,
    model: &str,
) -> Result<RegisterResponse> {
    let resp = client
        .post(format!("{base}/api/devices/register"))
        .json(&json!({
            "macAddress": mac_address,
            "model": model,
            "firmwareVersion": env!("CARGO_PKG_VERSION"),
        }))
        .send()
        .await
        .context("register request failed")?;

    if resp.status() == reqwest::StatusCode::CONFLICT {
        bail!(
            "MAC {mac_address} is already registered; this simulator keeps no \
             credential store, so pick a fresh MAC_ADDRESS"
        );
    }
    if !resp.status().is_success() {
        bail!("register rejected: {}", resp.status());
    }

    resp.json().await.context("register response parse failed")
}

async fn refresh(
    client: &reqwest::Client,
    base: &str,
    device_id: &str,
    refresh_token: &str,
) -> Result<String> {
    let resp = client
        .post(format!("{base}/api/devices/refresh-token"))
        .json(&json!({ "deviceId": device_id, "refreshToken": refresh_token }))
        .send()
        .await
        .context("refresh request failed")?;

    if !resp.status().is_success() {
        bail!("refresh rejected: {}", resp.status());
    }

    let body: RefreshResponse = resp.json().await.context("refresh response parse failed")?;
    Ok(body.device_token)
}

enum TelemetryOutcome {
    Decided(TelemetryResponse),
    TokenExpired,
    RateLimited,
}

async fn send_telemetry(
    client: &reqwest::Client,
    base: &str,
    token: &str,
    api_key: &str,
    device_id: &str,
    plant: &PlantSim,
) -> Result<TelemetryOutcome> {
    let body = serde_json::to_vec(&json!({
        "deviceId": device_id,
        "soilMoisture": plant.soil_moisture,
        "tankLevel": plant.tank_level,
        "airTemp": plant.air_temp,
        "airHumidity": plant.air_humidity,
    }))?;
    let signature = sign_payload(&body, api_key);

    let resp = client
        .post(format!("{base}/api/devices/telemetry"))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .header("x-api-key", api_key)
        .header("x-signature", signature)
        .body(body)
        .send()
        .await
        .context("telemetry request failed")?;

    match resp.status() {
        reqwest::StatusCode::UNAUTHORIZED => Ok(TelemetryOutcome::TokenExpired),
        reqwest::StatusCode::TOO_MANY_REQUESTS => Ok(TelemetryOutcome::RateLimited),
        status if status.is_success() => Ok(TelemetryOutcome::Decided(
            resp.json().await.context("telemetry response parse failed")?,
        )),
        status => bail!("telemetry rejected: {status}"),
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let base = env::var("HUB_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let mac_address =
        env::var("MAC_ADDRESS").unwrap_or_else(|_| "AA:BB:CC:DD:EE:01".to_string());
    let model = env::var("MODEL").unwrap_or_else(|_| "soil-pump-v2".to_string());
    let fallback_interval: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_EVERY_S);

    let client = reqwest::Client::new();

    // ── Register ────────────────────────────────────────────────────
    let creds = register(&client, &base, &mac_address, &model).await?;
    info!(device = %creds.device_id, "registered with hub (pending approval)");
    let mut token = creds.device_token.clone();

    let mut plant = PlantSim::new();

    // ── Telemetry loop ──────────────────────────────────────────────
    loop {
        plant.step(fallback_interval as f64);

        match send_telemetry(&client, &base, &token, &creds.api_key, &creds.device_id, &plant)
            .await
        {
            Ok(TelemetryOutcome::Decided(decision)) => {
                info!(
                    command = %decision.command,
                    message = %decision.message,
                    soil = format!("{:.1}", plant.soil_moisture),
                    tank = format!("{:.1}", plant.tank_level),
                    "decision received"
                );

                if decision.command == "WATER" {
                    let duration = decision.duration.unwrap_or(5);
                    plant.water(duration as f64);
                }

                let wait = decision
                    .next_check_in_seconds
                    .map(|s| s as u64)
                    .unwrap_or(fallback_interval);
                sleep(Duration::from_secs(wait)).await;
            }
            Ok(TelemetryOutcome::TokenExpired) => {
                info!("bearer token rejected — refreshing");
                match refresh(&client, &base, &creds.device_id, &creds.refresh_token).await {
                    Ok(new_token) => token = new_token,
                    Err(e) => {
                        warn!(error = %e, "refresh failed, retrying shortly");
                        sleep(Duration::from_secs(30)).await;
                    }
                }
            }
            Ok(TelemetryOutcome::RateLimited) => {
                warn!("rate limited by hub — backing off");
                sleep(Duration::from_secs(fallback_interval.max(300))).await;
            }
            Err(e) => {
                warn!(error = %e, "telemetry failed, retrying");
                sleep(Duration::from_secs(30)).await;
            }
        }
    }
}
