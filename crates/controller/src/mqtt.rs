//! MQTT bridge: moisture ingestion from sensor topics, remote zone
//! commands, and retained zone status publication.
//!
//! Topics under the configured base (default "irrigation"):
//! - `<base>/sensors/<sensor>/moisture`  incoming readings (percent)
//! - `<base>/zones/<id>/command`         incoming "start" / "stop"
//! - `<base>/zone/<id>/status`           outgoing retained "on" / "off"
//!
//! Malformed readings and unknown sensors are dropped without
//! touching any zone; command errors (busy, winter mode) are logged
//! and not retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event as ConnectionEvent, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::actuator::{start_with_auto_off, ZoneActuator};
use crate::config::MqttConfig;
use crate::db::Db;
use crate::notify::{Event, Notifier};
use crate::timers::TimerRegistry;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new("irrigation-controller", &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));
    if !cfg.username.is_empty() {
        opts.set_credentials(&cfg.username, &cfg.password);
    }
    AsyncClient::new(opts, 20)
}

// ---------------------------------------------------------------------------
// Status publication
// ---------------------------------------------------------------------------

/// Publishes retained zone on/off status. Held by the actuator so
/// every state transition is mirrored to the broker, best-effort.
#[derive(Clone)]
pub struct StatusPublisher {
    client: AsyncClient,
    base_topic: String,
}

impl StatusPublisher {
    pub fn new(client: AsyncClient, base_topic: impl Into<String>) -> Self {
        Self {
            client,
            base_topic: base_topic.into(),
        }
    }

    pub async fn publish_zone_status(&self, zone_id: i64, on: bool) {
        let topic = format!("{}/zone/{zone_id}/status", self.base_topic);
        let payload = if on { "on" } else { "off" };
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, true, payload)
            .await
        {
            warn!(zone = zone_id, "zone status publish failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the sensor name from "<base>/sensors/<sensor>/moisture".
pub(crate) fn parse_sensor_topic<'a>(topic: &'a str, base: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() == 3 && parts[0] == "sensors" && parts[2] == "moisture" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract the zone id segment from "<base>/zones/<id>/command".
pub(crate) fn parse_command_topic<'a>(topic: &'a str, base: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() == 3 && parts[0] == "zones" && parts[2] == "command" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse a moisture payload into a whole percent. Non-numeric or
/// out-of-range readings are rejected.
pub(crate) fn parse_moisture(payload: &[u8]) -> Option<i64> {
    let value: f64 = std::str::from_utf8(payload).ok()?.trim().parse().ok()?;
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return None;
    }
    Some(value.round() as i64)
}

/// Parse a "start"/"stop" payload (case-insensitive, trims whitespace).
pub(crate) fn parse_zone_command(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "start" => Ok(true),
        "stop" => Ok(false),
        _ => Err(format!("unknown zone command '{s}'")),
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Drive the MQTT connection until the process exits. Subscriptions
/// are re-issued on every (re)connect.
pub async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    base_topic: String,
    db: Db,
    actuator: Arc<ZoneActuator>,
    timers: Arc<TimerRegistry>,
    notifier: Notifier,
) {
    loop {
        match eventloop.poll().await {
            Ok(ConnectionEvent::Incoming(Packet::Publish(p))) => {
                handle_publish(
                    &p.topic,
                    &p.payload,
                    &base_topic,
                    &db,
                    &actuator,
                    &timers,
                    &notifier,
                )
                .await;
            }
            Ok(ConnectionEvent::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                notifier.publish(Event::MqttStatus { connected: true });
                for topic in [
                    format!("{base_topic}/sensors/+/moisture"),
                    format!("{base_topic}/zones/+/command"),
                ] {
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        warn!(topic, "mqtt subscribe failed: {e}");
                    }
                }
            }
            Ok(ConnectionEvent::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                notifier.publish(Event::MqttStatus { connected: false });
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}, reconnecting");
                notifier.publish(Event::MqttStatus { connected: false });
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn handle_publish(
    topic: &str,
    payload: &[u8],
    base_topic: &str,
    db: &Db,
    actuator: &Arc<ZoneActuator>,
    timers: &Arc<TimerRegistry>,
    notifier: &Notifier,
) {
    if let Some(sensor) = parse_sensor_topic(topic, base_topic) {
        let Some(moisture) = parse_moisture(payload) else {
            debug!(topic, "unparseable moisture payload dropped");
            return;
        };
        match db.update_moisture_by_sensor(sensor, moisture).await {
            Ok(Some(zone)) => {
                debug!(zone = zone.id, sensor, moisture, "moisture updated");
                notifier.publish(Event::MoistureUpdate {
                    zone_id: zone.id,
                    sensor: sensor.to_string(),
                    moisture,
                    timestamp: Utc::now(),
                });
            }
            Ok(None) => debug!(sensor, "reading for unmapped sensor dropped"),
            Err(e) => warn!(sensor, "moisture update failed: {e:#}"),
        }
    } else if let Some(raw_id) = parse_command_topic(topic, base_topic) {
        let Ok(zone_id) = raw_id.parse::<i64>() else {
            warn!(topic, "non-numeric zone id in command topic");
            return;
        };
        match parse_zone_command(payload) {
            Ok(true) => {
                match db.get_zone(zone_id).await {
                    Ok(Some(zone)) => {
                        if let Err(e) =
                            start_with_auto_off(actuator, timers, zone_id, zone.default_duration)
                                .await
                        {
                            warn!(zone = zone_id, "mqtt start rejected: {e}");
                        }
                    }
                    Ok(None) => warn!(zone = zone_id, "mqtt start for unknown zone"),
                    Err(e) => warn!(zone = zone_id, "mqtt start failed: {e:#}"),
                }
            }
            Ok(false) => {
                timers.cancel(zone_id);
                if let Err(e) = actuator.set_zone_state(zone_id, false).await {
                    warn!(zone = zone_id, "mqtt stop rejected: {e}");
                }
            }
            Err(msg) => warn!(topic, "{msg} (use start/stop)"),
        }
    } else {
        debug!(topic, "unhandled topic");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
