use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tracing::{debug, info, warn};

use localization_types::{Measurement, Vec3};

use crate::config::IngressConfig;
use crate::error::{CoreError, ParseError, TopicError, TransportError};

#[derive(Deserialize)]
struct VectorLocalPayload {
    x: f64,
    y: f64,
    z: f64,
}

/// Inbound payload on `uwb/anchor/{anchor_id}/vector`. `anchor_id` here is
/// accepted but never trusted — the topic segment is authoritative per the
/// wire contract. Unknown fields are ignored by `serde_json` by default.
#[derive(Deserialize)]
struct IncomingVectorPayload {
    timestamp: Option<f64>,
    t_unix_ns: Option<u64>,
    #[allow(dead_code)]
    #[serde(default)]
    anchor_id: Option<u8>,
    vector_local: VectorLocalPayload,
}

fn parse_topic(topic: &str) -> Result<u8, CoreError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != "uwb" || parts[1] != "anchor" || parts[3] != "vector" {
        return Err(CoreError::Topic(TopicError::Malformed(topic.to_string())));
    }
    parts[2]
        .parse::<u8>()
        .map_err(|_| CoreError::Topic(TopicError::InvalidAnchorId(topic.to_string())))
}

fn receive_time_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn parse_message(topic: &str, payload: &[u8]) -> Result<Measurement, CoreError> {
    let anchor_id = parse_topic(topic)?;
    let raw: IncomingVectorPayload =
        serde_json::from_slice(payload).map_err(ParseError::Json)?;

    let vector = Vec3::new(
        raw.vector_local.x,
        raw.vector_local.y,
        raw.vector_local.z,
    );
    if !vector.is_finite() {
        return Err(CoreError::Parse(ParseError::NonFinite));
    }

    let timestamp = raw
        .timestamp
        .or_else(|| raw.t_unix_ns.map(|ns| ns as f64 / 1e9))
        .unwrap_or_else(receive_time_seconds);

    Ok(Measurement::new(timestamp, anchor_id, 0, vector))
}

/// Drives the MQTT connection on the calling thread until `stop` is set.
/// Blocks in the connection's notification iterator — this is the ingress
/// thread's entire job, matching the one-thread-per-responsibility model:
/// parse failures and topic errors are logged and dropped (data-quality,
/// never surfaced), while connection loss triggers bounded exponential
/// backoff before a fresh connect attempt. Subscribe is deduplicated per
/// live connection via the `subscribed` flag, reset on every reconnect.
pub fn run_ingress<F>(config: IngressConfig, mut on_measurement: F, stop: Arc<AtomicBool>)
where
    F: FnMut(Measurement) + Send + 'static,
{
    let mut backoff = config.initial_backoff;

    'reconnect: loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }

        let client_id = format!("{}-{}", config.client_id_prefix, std::process::id());
        let mut mqtt_options = MqttOptions::new(client_id, config.broker_host.clone(), config.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, mut connection) = Client::new(mqtt_options, 256);
        let mut subscribed = false;

        for notification in connection.iter() {
            if stop.load(Ordering::Relaxed) {
                let _ = client.disconnect();
                return;
            }

            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if !subscribed {
                        match client.subscribe("uwb/anchor/+/vector", QoS::AtMostOnce) {
                            Ok(()) => {
                                subscribed = true;
                                info!("subscribed to uwb/anchor/+/vector");
                            }
                            Err(e) => {
                                let err = CoreError::Transport(TransportError::Subscribe {
                                    topic: "uwb/anchor/+/vector".to_string(),
                                    source: e,
                                });
                                warn!("{err}");
                            }
                        }
                    }
                    backoff = config.initial_backoff;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match parse_message(&publish.topic, &publish.payload) {
                        Ok(measurement) => on_measurement(measurement),
                        Err(CoreError::Topic(e)) => debug!("dropping message, bad topic: {e}"),
                        Err(CoreError::Parse(e)) => debug!("dropping message, parse error: {e}"),
                        Err(other) => debug!("dropping message: {other}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let err = CoreError::Transport(TransportError::Disconnected(e.to_string()));
                    warn!("{err}; reconnecting in {backoff:?}");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(config.max_backoff);
                    continue 'reconnect;
                }
            }
        }

        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(config.max_backoff);
    }
}
