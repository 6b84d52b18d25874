//! MQTT client for receiving detection frames
//!
//! Each message on the ingress topic is one JSON `FrameMessage`. Parsing is
//! done here so the frame processor only ever sees well-formed frames; bad
//! payloads are logged and skipped.

use crate::domain::detection::{DetectionFrame, FrameMessage};
use crate::domain::types::epoch_ms;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Parse one frame payload. A message without a usable timestamp is stamped
/// with the receive time.
pub fn parse_frame_message(json_str: &str, received_at_ms: u64) -> Result<DetectionFrame, serde_json::Error> {
    let message: FrameMessage = serde_json::from_str(json_str)?;
    Ok(message.into_frame(received_at_ms))
}

/// Whether a ConnAck leaves us without the ingress subscription. A clean
/// session (or a broker that dropped ours) starts with none, including after
/// every reconnect.
fn needs_subscribe(connack: &ConnAck) -> bool {
    connack.code == ConnectReturnCode::Success && !connack.session_present
}

/// Start the MQTT client and forward parsed frames to the channel
///
/// Frames are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped frames are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    frame_tx: mpsc::Sender<DetectionFrame>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("zonewatch-ingress-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(1024 * 1024, 1024 * 1024);

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    // Subscription is (re)issued on each ConnAck
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    info!(
        topic = %config.ingress_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_ingress_connecting"
    );

    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms());
    // Rate-limit drop and parse warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);
    let mut last_parse_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            // Check for shutdown signal
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_ingress_shutdown");
                    return Ok(());
                }
            }
            // Process MQTT events
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = std::str::from_utf8(&publish.payload)
                            .map_err(|e| e.to_string())
                            .and_then(|json| parse_frame_message(json, epoch_ms()).map_err(|e| e.to_string()));

                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(e) => {
                                if last_parse_warn.elapsed() > Duration::from_secs(1) {
                                    warn!(topic = %publish.topic, error = %e, "frame_parse_failed");
                                    last_parse_warn = Instant::now();
                                }
                                continue;
                            }
                        };

                        debug!(
                            timestamp_ms = %frame.timestamp_ms,
                            detections = %frame.detections.len(),
                            "frame_received"
                        );
                        if let Err(e) = frame_tx.try_send(frame) {
                            match e {
                                TrySendError::Full(_) => {
                                    metrics.record_frame_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!("frame_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                TrySendError::Closed(_) => {
                                    warn!("frame channel closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        info!(session_present = %connack.session_present, "mqtt_ingress_connected");
                        if needs_subscribe(&connack) {
                            // try_subscribe: this loop is the one draining the request queue
                            match client.try_subscribe(config.ingress_topic(), QoS::AtMostOnce) {
                                Ok(()) => info!(topic = %config.ingress_topic(), "mqtt_ingress_subscribed"),
                                Err(e) => error!(error = %e, "mqtt_ingress_subscribe_failed"),
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_ingress_error");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TrackId;

    #[test]
    fn test_parse_frame() {
        let json = r#"{
            "timestamp": 1767630090048,
            "detections": [
                {"track_id": 7, "bbox": [10, 20, 110, 220], "label": "forklift", "confidence": 0.91},
                {"track_id": 8, "bbox": [300, 20, 410, 220], "class_name": "person", "confidence": 0.6}
            ]
        }"#;

        let frame = parse_frame_message(json, 1).unwrap();
        assert_eq!(frame.timestamp_ms, 1_767_630_090_048);
        assert_eq!(frame.detections.len(), 2);
        assert_eq!(frame.detections[1].label.as_deref(), Some("person"));
        assert!(frame.dropped_tracks.is_empty());
    }

    #[test]
    fn test_parse_frame_with_dropped_tracks() {
        let json = r#"{"timestamp": "2026-01-05T16:21:30.048Z", "detections": [], "dropped_tracks": [3, 4]}"#;
        let frame = parse_frame_message(json, 1).unwrap();
        assert_eq!(frame.timestamp_ms, 1_767_630_090_048);
        assert_eq!(frame.dropped_tracks, vec![TrackId(3), TrackId(4)]);
    }

    #[test]
    fn test_parse_frame_without_timestamp_uses_receive_time() {
        let frame = parse_frame_message(r#"{"detections": []}"#, 42).unwrap();
        assert_eq!(frame.timestamp_ms, 42);
    }

    #[test]
    fn test_parse_frame_keeps_detections_around_a_mistyped_one() {
        let json = r#"{
            "timestamp": 1767630090048.0,
            "detections": [
                {"track_id": 7, "bbox": [10, 20, 110, 220], "label": "forklift", "confidence": 0.91},
                {"track_id": "8", "bbox": [300, 20, 410, 220], "label": "person", "confidence": 0.6}
            ]
        }"#;

        let frame = parse_frame_message(json, 1).unwrap();
        assert_eq!(frame.timestamp_ms, 1_767_630_090_048);
        assert_eq!(frame.detections.len(), 2);
        assert_eq!(frame.detections[0].track_id, Some(7));
        assert!(frame.detections[0].malformed.is_none());
        assert!(frame.detections[1].malformed.is_some());
    }

    #[test]
    fn test_subscribes_after_every_clean_connect() {
        let fresh = ConnAck::new(ConnectReturnCode::Success, false);
        // Clean-session reconnects look exactly like the first connect
        assert!(needs_subscribe(&fresh));

        let resumed = ConnAck::new(ConnectReturnCode::Success, true);
        assert!(!needs_subscribe(&resumed));

        let refused = ConnAck::new(ConnectReturnCode::NotAuthorized, false);
        assert!(!needs_subscribe(&refused));
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_frame_message("not json", 1).is_err());
        assert!(parse_frame_message(r#"{"detections": 5}"#, 1).is_err());
    }
}
