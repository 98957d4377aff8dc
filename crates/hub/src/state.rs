use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::db::now_unix;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral in-process snapshot backing the status endpoint. Durable
/// truth lives in the database; this exists so an operator can see what
/// the service has done recently without querying it.
pub struct SystemState {
    pub started_at: Instant,
    pub broker_connected: bool,
    pub devices: HashMap<String, DeviceActivity>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct DeviceActivity {
    pub last_seen: i64,
    pub last_soil_moisture: Option<f64>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Watering,
    Auth,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub broker_connected: bool,
    pub devices: HashMap<String, DeviceActivity>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            broker_connected: false,
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a processed telemetry reading.
    pub fn record_reading(&mut self, device_id: &str, plant_name: &str, soil_moisture: f64) {
        self.devices.insert(
            device_id.to_string(),
            DeviceActivity {
                last_seen: now_unix(),
                last_soil_moisture: Some(soil_moisture),
            },
        );
        self.push_event(
            EventKind::Reading,
            format!("{device_id}: {plant_name} soil={soil_moisture:.1}%"),
        );
    }

    /// Record a heartbeat (no sensor values attached).
    pub fn record_heartbeat(&mut self, device_id: &str) {
        let soil = self
            .devices
            .get(device_id)
            .and_then(|d| d.last_soil_moisture);
        self.devices.insert(
            device_id.to_string(),
            DeviceActivity {
                last_seen: now_unix(),
                last_soil_moisture: soil,
            },
        );
    }

    /// Record a watering trigger from either path.
    pub fn record_watering(&mut self, plant_id: &str, duration_sec: i64, source: &str) {
        self.push_event(
            EventKind::Watering,
            format!("{plant_id}: watering {duration_sec}s ({source})"),
        );
    }

    /// Record an authentication-related event.
    pub fn record_auth(&mut self, detail: String) {
        self.push_event(EventKind::Auth, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            broker_connected: self.broker_connected,
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: now_unix(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
