use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Broadcast payload
// ---------------------------------------------------------------------------

/// Real-time update pushed to all subscribed listeners whenever a
/// reading is recorded. Fire-and-forget from the decision path's point
/// of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingUpdate {
    pub plant_id: String,
    pub plant_name: String,
    pub soil_moisture: f64,
    pub water_level: f64,
    pub air_temp: Option<f64>,
    pub air_humidity: Option<f64>,
    pub light_level: Option<f64>,
    pub air_quality: Option<f64>,
    pub timestamp: i64,
    pub is_watering: bool,
}

/// Topic a plant's reading updates are published on.
pub fn reading_topic(plant_id: &str) -> String {
    format!("plants/{plant_id}/reading")
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Thin wrapper around the MQTT client. Publishes use `try_publish` so a
/// slow or disconnected broker drops the message instead of stalling the
/// telemetry response.
#[derive(Clone)]
pub struct Broadcaster {
    client: AsyncClient,
}

impl Broadcaster {
    /// Build the client. The returned event loop must be polled (see
    /// [`drive`]) for publishes to actually reach the broker.
    pub fn connect(host: &str, port: u16) -> (Self, EventLoop) {
        let mut options = MqttOptions::new("plantcare-hub", host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);
        (Self { client }, eventloop)
    }

    pub fn publish_reading(&self, update: &ReadingUpdate) {
        let payload = match serde_json::to_vec(update) {
            Ok(p) => p,
            Err(e) => {
                warn!(plant = %update.plant_id, error = %e, "failed to serialize reading update");
                return;
            }
        };

        let topic = reading_topic(&update.plant_id);
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            warn!(plant = %update.plant_id, error = %e, "dropped reading broadcast");
        }
    }
}

/// Poll the MQTT event loop forever, tracking broker connectivity in the
/// shared state. Intended to be `tokio::spawn`-ed from main.
pub async fn drive(mut eventloop: EventLoop, shared: SharedState) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let mut st = shared.write().await;
                st.broker_connected = true;
                st.record_system("mqtt broker connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let mut st = shared.write().await;
                st.broker_connected = false;
                st.record_system("mqtt broker disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt connection error, retrying");
                {
                    let mut st = shared.write().await;
                    st.broker_connected = false;
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
