//! Device identity: registration, bearer/refresh tokens, API-key and
//! payload-signature verification, and the per-device abuse guards
//! (lockout + fixed-window rate limit).
//!
//! ## Lockout state machine
//!
//! ```text
//! Unlocked ──[5th consecutive failure]──▶ Locked(until = now + 30min)
//!    ▲                                        │
//!    └───────────[now >= until]───────────────┘
//! ```
//!
//! While locked, authentication attempts are rejected without consuming
//! further attempts. Checking the lock at or past `until` clears it and
//! resets the counter in the same step. A successful authentication
//! resets the counter but never clears an active lock early.

use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::{now_unix, Db, Device, DeviceCredential};
use crate::error::{ApiError, ApiResult};

/// Consecutive failed authentications before a device is locked out.
pub const FAILED_AUTH_LOCK_THRESHOLD: i64 = 5;
/// Lockout duration once the threshold is reached.
pub const LOCKOUT_SECS: i64 = 30 * 60;
/// Fixed rate-limit window length.
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60 * 60;
/// Requests allowed per device per window.
pub const RATE_LIMIT_MAX_REQUESTS: i64 = 120;
/// Bearer token lifetime.
pub const TOKEN_TTL_SECS: i64 = 60 * 60;
/// Refresh token lifetime.
pub const REFRESH_TTL_SECS: i64 = 30 * 24 * 60 * 60;

const DEFAULT_READING_INTERVAL_SEC: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Bearer token
// ---------------------------------------------------------------------------

/// Claims embedded in the device bearer token. `typ` marks the token as
/// a device token so it can never be confused with a human session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Device id (standard `sub` claim).
    pub sub: String,
    /// Token-type marker, always `"device"`.
    pub typ: String,
    /// Canonical MAC address of the device.
    pub mac: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
}

pub fn mint_device_token(secret: &str, device_id: &str, mac: &str) -> ApiResult<(String, i64)> {
    let now = now_unix();
    let claims = TokenClaims {
        sub: device_id.to_string(),
        typ: "device".to_string(),
        mac: mac.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("token signing failed: {e}")))?;
    Ok((token, TOKEN_TTL_SECS))
}

pub fn decode_device_token(secret: &str, token: &str) -> ApiResult<TokenClaims> {
    let data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("invalid or expired device token".to_string()))?;

    if data.claims.typ != "device" {
        return Err(ApiError::Unauthorized(
            "token is not a device token".to_string(),
        ));
    }
    Ok(data.claims)
}

// ---------------------------------------------------------------------------
// MAC canonicalization
// ---------------------------------------------------------------------------

/// Parse a MAC address in colon- or hyphen-separated hex-pair form and
/// return the canonical uppercase colon form used for storage and
/// uniqueness. Rejects anything else.
pub fn normalize_mac(mac: &str) -> ApiResult<String> {
    let parts: Vec<&str> = if mac.contains(':') {
        mac.split(':').collect()
    } else {
        mac.split('-').collect()
    };

    if parts.len() != 6
        || parts
            .iter()
            .any(|p| p.len() != 2 || !p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Err(ApiError::Validation(format!(
            "invalid MAC address '{mac}': expected six hex pairs separated by ':' or '-'"
        )));
    }

    Ok(parts
        .iter()
        .map(|p| p.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(":"))
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    let buf: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    hex::encode(buf)
}

/// 256-bit API key, hex-encoded. Returned to the device exactly once.
pub fn generate_api_key() -> String {
    random_hex(32)
}

/// 512-bit opaque refresh token, hex-encoded.
pub fn generate_refresh_token() -> String {
    random_hex(64)
}

fn generate_salt() -> String {
    random_hex(16)
}

/// SHA-256 over salt || key, hex-encoded. Only this ever hits disk.
pub fn hash_api_key(salt: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash the candidate with the stored salt and compare against the
/// stored hash. Plaintext keys are never compared or logged.
pub async fn verify_api_key(db: &Db, device_id: &str, candidate: &str) -> ApiResult<bool> {
    let Some(cred) = db.get_credentials(device_id).await? else {
        return Ok(false);
    };
    Ok(hash_api_key(&cred.api_key_salt, candidate) == cred.api_key_hash)
}

// ---------------------------------------------------------------------------
// Payload signatures
// ---------------------------------------------------------------------------

/// HMAC-SHA256 of the raw payload under the API key, hex-encoded. The
/// bearer token authenticates the channel; this authenticates the
/// specific payload.
pub fn sign_payload(payload: &[u8], api_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex-encoded HMAC-SHA256 signature.
pub fn verify_signature(payload: &[u8], signature_hex: &str, api_key: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Everything handed back to a freshly registered device. The plaintext
/// `api_key` exists only in this value.
#[derive(Debug)]
pub struct RegisteredDevice {
    pub device_id: String,
    pub device_token: String,
    pub api_key: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

pub async fn register(
    db: &Db,
    token_secret: &str,
    mac_address: &str,
    model: &str,
    firmware_version: Option<String>,
    serial_number: Option<String>,
) -> ApiResult<RegisteredDevice> {
    let mac = normalize_mac(mac_address)?;

    if db.get_device_by_mac(&mac).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "device with MAC {mac} is already registered"
        )));
    }

    let device_id = uuid::Uuid::new_v4().to_string();
    let api_key = generate_api_key();
    let salt = generate_salt();
    let refresh_token = generate_refresh_token();
    let now = now_unix();

    let device = Device {
        device_id: device_id.clone(),
        mac_address: mac.clone(),
        model: model.to_string(),
        firmware_version,
        serial_number,
        name: None,
        online: false,
        last_seen_at: None,
        last_heartbeat_at: None,
        battery_level: None,
        signal_strength: None,
        ip_address: None,
        reading_interval_sec: DEFAULT_READING_INTERVAL_SEC,
        user_id: None,
        plant_id: None,
        registered_at: now,
    };
    db.insert_device(&device).await?;

    let credential = DeviceCredential {
        device_id: device_id.clone(),
        api_key_hash: hash_api_key(&salt, &api_key),
        api_key_salt: salt,
        refresh_token: refresh_token.clone(),
        refresh_expires_at: now + REFRESH_TTL_SECS,
        approved: false,
        approved_by: None,
        approved_at: None,
        failed_attempts: 0,
        locked_until: None,
        request_count: 0,
        window_reset_at: 0,
    };
    db.insert_credentials(&credential).await?;

    let (device_token, expires_in) = mint_device_token(token_secret, &device_id, &mac)?;

    info!(device = %device_id, mac = %mac, "registered new device (pending approval)");

    Ok(RegisteredDevice {
        device_id,
        device_token,
        api_key,
        refresh_token,
        expires_in,
    })
}

// ---------------------------------------------------------------------------
// Token refresh
// ---------------------------------------------------------------------------

pub async fn refresh_token(
    db: &Db,
    token_secret: &str,
    device_id: &str,
    presented: &str,
) -> ApiResult<(String, i64)> {
    let now = now_unix();

    // A locked device is rejected up front; the attempt does not count
    // against the failure threshold.
    if db.is_locked(device_id, now).await? {
        return Err(ApiError::Unauthorized("device is locked".to_string()));
    }

    let Some(cred) = db.get_credentials(device_id).await? else {
        return Err(ApiError::NotFound(format!("unknown device {device_id}")));
    };

    let device = db
        .get_device(device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown device {device_id}")))?;

    if cred.refresh_token != presented {
        warn!(device = %device_id, "refresh token mismatch");
        db.record_failed_auth(device_id, now, FAILED_AUTH_LOCK_THRESHOLD, LOCKOUT_SECS)
            .await?;
        return Err(ApiError::Unauthorized("invalid refresh token".to_string()));
    }

    if cred.refresh_expires_at <= now {
        warn!(device = %device_id, expired_at = cred.refresh_expires_at, "refresh token expired");
        db.record_failed_auth(device_id, now, FAILED_AUTH_LOCK_THRESHOLD, LOCKOUT_SECS)
            .await?;
        return Err(ApiError::Unauthorized("refresh token expired".to_string()));
    }

    db.reset_failed_auth(device_id).await?;
    mint_device_token(token_secret, &device.device_id, &device.mac_address)
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Approve a device and bind it to its owner (and optionally a plant).
/// Re-approval is allowed and simply re-stamps approver and time.
pub async fn approve_device(
    db: &Db,
    user_id: &str,
    device_id: &str,
    plant_id: Option<&str>,
    device_name: Option<&str>,
) -> ApiResult<()> {
    let now = now_unix();
    let found = db
        .approve_device(device_id, user_id, plant_id, device_name, now)
        .await?;
    if !found {
        return Err(ApiError::NotFound(format!("unknown device {device_id}")));
    }
    info!(device = %device_id, user = %user_id, "device approved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Abuse guards (thin policy wrappers over the atomic SQL)
// ---------------------------------------------------------------------------

pub async fn is_locked(db: &Db, device_id: &str) -> ApiResult<bool> {
    Ok(db.is_locked(device_id, now_unix()).await?)
}

pub async fn record_failed_auth(db: &Db, device_id: &str) -> ApiResult<()> {
    db.record_failed_auth(
        device_id,
        now_unix(),
        FAILED_AUTH_LOCK_THRESHOLD,
        LOCKOUT_SECS,
    )
    .await?;
    Ok(())
}

pub async fn check_rate_limit(db: &Db, device_id: &str) -> ApiResult<bool> {
    Ok(db
        .check_rate_limit(
            device_id,
            now_unix(),
            RATE_LIMIT_WINDOW_SECS,
            RATE_LIMIT_MAX_REQUESTS,
        )
        .await?)
}

// ===========================================================================
// Tests
// ===========================================================================
