use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::db::{now_unix, Db, HeartbeatUpdate};
use crate::engine::{self, Decision, TelemetrySample};
use crate::error::{ApiError, ApiResult};
use crate::identity::{self, TokenClaims};
use crate::mqtt::Broadcaster;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub broadcast: Broadcaster,
    pub shared: SharedState,
    pub token_secret: String,
    pub admin_token: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    mac_address: String,
    model: String,
    firmware_version: Option<String>,
    serial_number: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    device_id: String,
    device_token: String,
    api_key: String,
    refresh_token: String,
    expires_in: i64,
    requires_approval: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    device_id: String,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    device_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {
    device_id: String,
    battery_level: Option<f64>,
    signal_strength: Option<i64>,
    firmware_version: Option<String>,
    ip_address: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryResponse {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<i64>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_check_in_seconds: Option<i64>,
}

impl From<Decision> for TelemetryResponse {
    fn from(d: Decision) -> Self {
        Self {
            command: d.command.as_str().to_string(),
            duration: d.command.duration_sec(),
            message: d.message,
            next_check_in_seconds: d.next_check_in,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyKeyRequest {
    api_key: String,
}

#[derive(Debug, Serialize)]
struct VerifyKeyResponse {
    valid: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveRequest {
    device_id: String,
    user_id: String,
    plant_id: Option<String>,
    device_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingDevice {
    device_id: String,
    mac_address: String,
    model: String,
    firmware_version: Option<String>,
    serial_number: Option<String>,
    registered_at: i64,
}

// ---------------------------------------------------------------------------
// Auth helpers
// ---------------------------------------------------------------------------

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn require_device(state: &AppState, headers: &HeaderMap) -> ApiResult<TokenClaims> {
    let token = bearer(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    identity::decode_device_token(&state.token_secret, token)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    match bearer(headers) {
        Some(token) if token == state.admin_token => Ok(()),
        _ => Err(ApiError::Unauthorized("operator token required".to_string())),
    }
}

/// Telemetry payload signature: the device presents its plaintext API key
/// alongside an HMAC of the raw body under that key. The key must match
/// the stored hash before it is trusted to key the HMAC. Either both
/// headers are present or neither.
async fn check_signature(
    state: &AppState,
    device_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> ApiResult<()> {
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let signature = headers.get("x-signature").and_then(|v| v.to_str().ok());

    match (api_key, signature) {
        (None, None) => Ok(()),
        (Some(key), Some(sig)) => {
            if !identity::verify_api_key(&state.db, device_id, key).await? {
                identity::record_failed_auth(&state.db, device_id).await?;
                let mut st = state.shared.write().await;
                st.record_auth(format!("{device_id}: invalid API key on telemetry"));
                return Err(ApiError::Unauthorized("invalid API key".to_string()));
            }
            if !identity::verify_signature(body, sig, key) {
                identity::record_failed_auth(&state.db, device_id).await?;
                let mut st = state.shared.write().await;
                st.record_auth(format!("{device_id}: invalid payload signature"));
                return Err(ApiError::Unauthorized(
                    "invalid payload signature".to_string(),
                ));
            }
            Ok(())
        }
        _ => Err(ApiError::Validation(
            "x-api-key and x-signature must be presented together".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Handlers — device-facing
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    let registered = identity::register(
        &state.db,
        &state.token_secret,
        &req.mac_address,
        &req.model,
        req.firmware_version,
        req.serial_number,
    )
    .await?;

    {
        let mut st = state.shared.write().await;
        st.record_auth(format!(
            "{}: registered (pending approval)",
            registered.device_id
        ));
    }

    Ok(Json(RegisterResponse {
        device_id: registered.device_id,
        device_token: registered.device_token,
        api_key: registered.api_key,
        refresh_token: registered.refresh_token,
        expires_in: registered.expires_in,
        requires_approval: true,
    }))
}

async fn refresh_token(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<RefreshResponse>> {
    let (device_token, expires_in) = identity::refresh_token(
        &state.db,
        &state.token_secret,
        &req.device_id,
        &req.refresh_token,
    )
    .await
    // Unknown devices surface as an authorization failure on this
    // endpoint; a probe must not learn which ids exist.
    .map_err(|e| match e {
        ApiError::NotFound(_) => ApiError::Unauthorized("invalid refresh token".to_string()),
        other => other,
    })?;

    Ok(Json(RefreshResponse {
        device_token,
        expires_in,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let claims = require_device(&state, &headers)?;
    if req.device_id != claims.sub {
        return Err(ApiError::Unauthorized(
            "token does not match device".to_string(),
        ));
    }

    if !identity::check_rate_limit(&state.db, &claims.sub).await? {
        return Err(ApiError::RateLimited);
    }

    let update = HeartbeatUpdate {
        battery_level: req.battery_level,
        signal_strength: req.signal_strength,
        firmware_version: req.firmware_version,
        ip_address: req.ip_address,
    };
    let found = state
        .db
        .update_heartbeat(&req.device_id, &update, now_unix())
        .await?;
    if !found {
        return Err(ApiError::NotFound(format!(
            "unknown device {}",
            req.device_id
        )));
    }

    {
        let mut st = state.shared.write().await;
        st.record_heartbeat(&req.device_id);
    }

    Ok(Json(json!({ "status": "ok" })))
}

async fn telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<TelemetryResponse>> {
    let claims = require_device(&state, &headers)?;

    if !identity::check_rate_limit(&state.db, &claims.sub).await? {
        return Err(ApiError::RateLimited);
    }

    check_signature(&state, &claims.sub, &headers, &body).await?;

    let sample: TelemetrySample = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("invalid telemetry body: {e}")))?;
    if sample.device_id != claims.sub {
        return Err(ApiError::Unauthorized(
            "token does not match device".to_string(),
        ));
    }
    engine::validate_sample(&sample)?;

    let decision =
        engine::process_telemetry(&state.db, &state.broadcast, &state.shared, &sample).await?;

    Ok(Json(TelemetryResponse::from(decision)))
}

async fn verify_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyKeyRequest>,
) -> ApiResult<Json<VerifyKeyResponse>> {
    let claims = require_device(&state, &headers)?;

    if identity::is_locked(&state.db, &claims.sub).await? {
        return Err(ApiError::Unauthorized("device is locked".to_string()));
    }

    let valid = identity::verify_api_key(&state.db, &claims.sub, &req.api_key).await?;
    if valid {
        state.db.reset_failed_auth(&claims.sub).await?;
    } else {
        identity::record_failed_auth(&state.db, &claims.sub).await?;
        let mut st = state.shared.write().await;
        st.record_auth(format!("{}: failed key verification", claims.sub));
    }

    Ok(Json(VerifyKeyResponse { valid }))
}

// ---------------------------------------------------------------------------
// Handlers — operator-facing
// ---------------------------------------------------------------------------

async fn approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;

    identity::approve_device(
        &state.db,
        &req.user_id,
        &req.device_id,
        req.plant_id.as_deref(),
        req.device_name.as_deref(),
    )
    .await?;

    {
        let mut st = state.shared.write().await;
        st.record_auth(format!("{}: approved by {}", req.device_id, req.user_id));
    }

    Ok(Json(json!({ "status": "approved" })))
}

async fn pending(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<PendingDevice>>> {
    require_admin(&state, &headers)?;

    let devices = state.db.pending_devices().await?;
    Ok(Json(
        devices
            .into_iter()
            .map(|d| PendingDevice {
                device_id: d.device_id,
                mac_address: d.mac_address,
                model: d.model,
                firmware_version: d.firmware_version,
                serial_number: d.serial_number,
                registered_at: d.registered_at,
            })
            .collect(),
    ))
}

async fn api_status(State(state): State<AppState>) -> Json<crate::state::StatusResponse> {
    let st = state.shared.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices/register", post(register))
        .route("/api/devices/refresh-token", post(refresh_token))
        .route("/api/devices/heartbeat", post(heartbeat))
        .route("/api/devices/telemetry", post(telemetry))
        .route("/api/devices/verify-key", post(verify_key))
        .route("/api/devices/approve", post(approve))
        .route("/api/devices/pending", get(pending))
        .route("/api/status", get(api_status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    tracing::info!(%addr, "api listening");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::db::User;
    use crate::state;

    const SECRET: &str = "test-token-secret";
    const ADMIN: &str = "test-admin-token";

    async fn test_state() -> (AppState, rumqttc::EventLoop) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let (broadcast, eventloop) = Broadcaster::connect("127.0.0.1", 1883);
        (
            AppState {
                db,
                broadcast,
                shared: state::shared(),
                token_secret: SECRET.to_string(),
                admin_token: ADMIN.to_string(),
            },
            eventloop,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn post_json_auth(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register_device(app: &Router) -> serde_json::Value {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/devices/register",
                json!({
                    "macAddress": "AA:BB:CC:DD:EE:FF",
                    "model": "soil-pump-v2",
                    "firmwareVersion": "1.4.0"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        body_json(resp).await
    }

    // -- register ----------------------------------------------------------

    #[tokio::test]
    async fn register_returns_credentials_once() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let body = register_device(&app).await;
        assert!(body["deviceId"].as_str().unwrap().len() > 0);
        assert_eq!(body["apiKey"].as_str().unwrap().len(), 64);
        assert_eq!(body["refreshToken"].as_str().unwrap().len(), 128);
        assert_eq!(body["requiresApproval"], true);
        assert_eq!(body["expiresIn"], 3600);
    }

    #[tokio::test]
    async fn duplicate_mac_returns_409() {
        let (state, _el) = test_state().await;
        let app = router(state);

        register_device(&app).await;
        let resp = app
            .oneshot(post_json(
                "/api/devices/register",
                json!({ "macAddress": "aa-bb-cc-dd-ee-ff", "model": "soil-pump-v2" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn malformed_mac_returns_400() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let resp = app
            .oneshot(post_json(
                "/api/devices/register",
                json!({ "macAddress": "not-a-mac", "model": "soil-pump-v2" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // -- refresh -----------------------------------------------------------

    #[tokio::test]
    async fn refresh_roundtrip_and_bad_token() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let reg = register_device(&app).await;
        let device_id = reg["deviceId"].as_str().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/devices/refresh-token",
                json!({ "deviceId": device_id, "refreshToken": reg["refreshToken"] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["deviceToken"].as_str().unwrap().len() > 0);
        assert_eq!(body["expiresIn"], 3600);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/devices/refresh-token",
                json!({ "deviceId": device_id, "refreshToken": "bogus" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Unknown device ids are indistinguishable from bad tokens here.
        let resp = app
            .oneshot(post_json(
                "/api/devices/refresh-token",
                json!({ "deviceId": "ghost", "refreshToken": "bogus" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    // -- heartbeat ---------------------------------------------------------

    #[tokio::test]
    async fn heartbeat_requires_token_and_known_device() {
        let (state, _el) = test_state().await;
        let app = router(state);

        // No bearer.
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/devices/heartbeat",
                json!({ "deviceId": "d1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Valid token for a device that was never registered.
        let (token, _) = identity::mint_device_token(SECRET, "ghost", "AA:BB:CC:DD:EE:00").unwrap();
        let resp = app
            .oneshot(post_json_auth(
                "/api/devices/heartbeat",
                &token,
                json!({ "deviceId": "ghost", "batteryLevel": 80.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_updates_device_liveness() {
        let (state, _el) = test_state().await;
        let db = state.db.clone();
        let app = router(state);

        let reg = register_device(&app).await;
        let device_id = reg["deviceId"].as_str().unwrap().to_string();
        let token = reg["deviceToken"].as_str().unwrap();

        let resp = app
            .oneshot(post_json_auth(
                "/api/devices/heartbeat",
                token,
                json!({ "deviceId": device_id, "batteryLevel": 72.5, "signalStrength": -58 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let device = db.get_device(&device_id).await.unwrap().unwrap();
        assert!(device.online);
        assert_eq!(device.battery_level, Some(72.5));
        assert_eq!(device.signal_strength, Some(-58));
    }

    #[tokio::test]
    async fn exhausted_rate_limit_returns_429() {
        let (state, _el) = test_state().await;
        let db = state.db.clone();
        let app = router(state);

        let reg = register_device(&app).await;
        let device_id = reg["deviceId"].as_str().unwrap().to_string();
        let token = reg["deviceToken"].as_str().unwrap();

        // Burn the whole window directly against the store.
        let now = now_unix();
        for _ in 0..120 {
            assert!(db.check_rate_limit(&device_id, now, 3600, 120).await.unwrap());
        }

        let resp = app
            .oneshot(post_json_auth(
                "/api/devices/heartbeat",
                token,
                json!({ "deviceId": device_id }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    // -- telemetry ---------------------------------------------------------

    #[tokio::test]
    async fn signed_telemetry_roundtrip() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let reg = register_device(&app).await;
        let token = reg["deviceToken"].as_str().unwrap();
        let api_key = reg["apiKey"].as_str().unwrap();

        let body = serde_json::to_vec(&json!({
            "deviceId": reg["deviceId"],
            "soilMoisture": 20.0,
            "tankLevel": 50.0
        }))
        .unwrap();
        let signature = identity::sign_payload(&body, api_key);

        let req = Request::builder()
            .method("POST")
            .uri("/api/devices/telemetry")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .header("x-api-key", api_key)
            .header("x-signature", signature)
            .body(Body::from(body))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        // Freshly registered device has no plant yet.
        assert_eq!(body["command"], "SLEEP");
        assert_eq!(body["nextCheckInSeconds"], 300);
        assert!(body["message"].as_str().unwrap().contains("no assigned plant"));
    }

    #[tokio::test]
    async fn tampered_telemetry_signature_returns_401() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let reg = register_device(&app).await;
        let token = reg["deviceToken"].as_str().unwrap();
        let api_key = reg["apiKey"].as_str().unwrap();

        let body = serde_json::to_vec(&json!({
            "deviceId": reg["deviceId"],
            "soilMoisture": 20.0,
            "tankLevel": 50.0
        }))
        .unwrap();
        let signature = identity::sign_payload(&body, api_key);

        // Flip one byte after signing.
        let mut tampered = body.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 0x01;

        let req = Request::builder()
            .method("POST")
            .uri("/api/devices/telemetry")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .header("x-api-key", api_key)
            .header("x-signature", signature)
            .body(Body::from(tampered))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn out_of_range_telemetry_returns_400() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let reg = register_device(&app).await;
        let token = reg["deviceToken"].as_str().unwrap();

        let resp = app
            .oneshot(post_json_auth(
                "/api/devices/telemetry",
                token,
                json!({ "deviceId": reg["deviceId"], "soilMoisture": 140.0, "tankLevel": 50.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // -- verify-key --------------------------------------------------------

    #[tokio::test]
    async fn verify_key_reports_validity() {
        let (state, _el) = test_state().await;
        let app = router(state);

        let reg = register_device(&app).await;
        let token = reg["deviceToken"].as_str().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json_auth(
                "/api/devices/verify-key",
                token,
                json!({ "apiKey": reg["apiKey"] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["valid"], true);

        let resp = app
            .oneshot(post_json_auth(
                "/api/devices/verify-key",
                token,
                json!({ "apiKey": "wrong-key" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["valid"], false);
    }

    // -- approval + pending ------------------------------------------------

    #[tokio::test]
    async fn approve_flow_binds_device_and_clears_pending() {
        let (state, _el) = test_state().await;
        let db = state.db.clone();
        db.upsert_user(&User {
            user_id: "u1".into(),
            name: "Alice".into(),
            auto_water_enabled: false,
            moisture_threshold: 30.0,
        })
        .await
        .unwrap();
        let app = router(state);

        let reg = register_device(&app).await;
        let device_id = reg["deviceId"].as_str().unwrap().to_string();

        // Operator token required.
        let resp = app
            .clone()
            .oneshot(post_json_auth(
                "/api/devices/approve",
                "wrong-admin",
                json!({ "deviceId": device_id, "userId": "u1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Pending shows the unapproved device.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/devices/pending")
                    .header("authorization", format!("Bearer {ADMIN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let pending = body_json(resp).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["macAddress"], "AA:BB:CC:DD:EE:FF");

        // Approve, then pending is empty.
        let resp = app
            .clone()
            .oneshot(post_json_auth(
                "/api/devices/approve",
                ADMIN,
                json!({ "deviceId": device_id, "userId": "u1", "deviceName": "balcony" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let device = db.get_device(&device_id).await.unwrap().unwrap();
        assert_eq!(device.user_id.as_deref(), Some("u1"));
        assert_eq!(device.name.as_deref(), Some("balcony"));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/devices/pending")
                    .header("authorization", format!("Bearer {ADMIN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let pending = body_json(resp).await;
        assert!(pending.as_array().unwrap().is_empty());

        // Unknown device: 404.
        let resp = app
            .oneshot(post_json_auth(
                "/api/devices/approve",
                ADMIN,
                json!({ "deviceId": "ghost", "userId": "u1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -- status ------------------------------------------------------------

    #[tokio::test]
    async fn status_snapshot_is_served() {
        let (state, _el) = test_state().await;
        {
            let mut st = state.shared.write().await;
            st.record_system("hub started".to_string());
        }
        let app = router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["broker_connected"], false);
        assert_eq!(body["events"][0]["detail"], "hub started");
    }
}
