//! Event publisher and MQTT transport
//!
//! The publisher drains the event queue one event at a time in emission order
//! and hands each serialized payload to an `EventTransport`. Delivery is QoS 1
//! (at-least-once) while the transport is connected. While it is not, events
//! go to the diagnostic sink instead and are never retried.

use crate::domain::event::{EventPayload, ZoneEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::diagnostics::DiagnosticSink;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    Disconnected,

    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<ClientError> for TransportError {
    fn from(e: ClientError) -> Self {
        TransportError::Publish(e.to_string())
    }
}

/// Destination for serialized event payloads
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Hand one payload to the transport
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Disconnect; called once at shutdown
    async fn close(&self);
}

/// MQTT transport on rumqttc
///
/// The event loop runs in its own task and reconnects on its own; the
/// connected flag follows ConnAck and connection errors.
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    eventloop_task: JoinHandle<()>,
}

impl MqttTransport {
    pub fn connect(config: &Config, metrics: Arc<Metrics>) -> Self {
        let client_id = format!("zonewatch-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        // Set credentials if configured
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, config.egress_queue_size().max(10));
        let connected = Arc::new(AtomicBool::new(false));
        let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms());

        let flag = connected.clone();
        let eventloop_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        flag.store(true, Ordering::Relaxed);
                        metrics.set_transport_connected(true);
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        // QoS 1 acknowledgement received
                        metrics.record_puback();
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::Relaxed) {
                            metrics.set_transport_connected(false);
                        }
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Self { client, connected, eventloop_task }
    }
}

#[async_trait]
impl EventTransport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        // try_publish: a full client buffer is a failure, not a reason to wait
        self.client.try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "mqtt_egress_disconnect_failed");
        }
        self.eventloop_task.abort();
    }
}

/// Publisher tunables
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub topic: String,
    pub site_id: Option<String>,
    pub shutdown_drain: Duration,
}

impl PublisherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topic: config.egress_topic().to_string(),
            site_id: config.site_id().map(str::to_string),
            shutdown_drain: Duration::from_millis(config.shutdown_drain_ms()),
        }
    }
}

/// Event publisher actor
pub struct EventPublisher<T: EventTransport> {
    transport: T,
    rx: mpsc::Receiver<ZoneEvent>,
    settings: PublisherSettings,
    diagnostics: DiagnosticSink,
    metrics: Arc<Metrics>,
    /// Set while events are going to diagnostics instead of the transport
    degraded: bool,
    degraded_count: u64,
}

impl<T: EventTransport> EventPublisher<T> {
    pub fn new(
        transport: T,
        rx: mpsc::Receiver<ZoneEvent>,
        settings: PublisherSettings,
        diagnostics: DiagnosticSink,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { transport, rx, settings, diagnostics, metrics, degraded: false, degraded_count: 0 }
    }

    /// Run the publisher loop until shutdown or until every sender is gone.
    /// Returns the diagnostic sink so callers can inspect what was recorded.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DiagnosticSink {
        info!(topic = %self.settings.topic, "event_publisher_started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // A dropped shutdown sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        info!("event_publisher_shutdown");
                        break;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(event) => {
                            self.metrics.set_event_queue_depth(self.rx.len() as u64);
                            self.publish_event(event).await;
                        }
                        None => break,
                    }
                }
            }
        }

        self.drain().await;
        self.transport.close().await;
        info!(degraded_records = %self.diagnostics.records(), "event_publisher_stopped");
        self.diagnostics
    }

    /// Publish what is queued until the drain deadline, then discard the rest.
    /// The deadline also bounds a publish that is still in flight.
    async fn drain(&mut self) {
        self.rx.close();
        let deadline = Instant::now() + self.settings.shutdown_drain;
        let mut discarded = 0u64;

        // timeout_at polls its future before the clock, so a non-empty queue
        // would never time out on recv alone
        while Instant::now() < deadline {
            let event = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            };
            if tokio::time::timeout_at(deadline, self.publish_event(event)).await.is_err() {
                discarded += 1;
                break;
            }
        }

        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.metrics.set_event_queue_depth(0);
        if discarded > 0 {
            self.metrics.record_events_discarded(discarded);
            warn!(
                discarded = %discarded,
                drain_ms = %self.settings.shutdown_drain.as_millis(),
                "events_discarded_at_shutdown"
            );
        }
    }

    async fn publish_event(&mut self, event: ZoneEvent) {
        let payload = EventPayload::from_event(&event, self.settings.site_id.as_deref());
        let json = payload.to_json();

        let result = if self.transport.is_connected() {
            self.transport.publish(&self.settings.topic, json.as_bytes()).await
        } else {
            Err(TransportError::Disconnected)
        };

        match result {
            Ok(()) => {
                self.metrics.record_event_published();
                if self.degraded {
                    self.degraded = false;
                    info!(degraded_events = %self.degraded_count, "publisher_recovered");
                    self.degraded_count = 0;
                }
                debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    track_id = %event.track_id,
                    zone_id = %event.zone_id,
                    "event_published"
                );
            }
            Err(e) => {
                let reason = match e {
                    TransportError::Disconnected => "transport_disconnected",
                    TransportError::Publish(_) => {
                        self.metrics.record_publish_failed();
                        "publish_failed"
                    }
                };
                if !self.degraded {
                    self.degraded = true;
                    warn!(error = %e, "publisher_degraded");
                }
                self.degraded_count += 1;
                self.metrics.record_event_degraded();
                self.diagnostics.record(&event.event_id, event.event_type.as_str(), &payload, reason);
            }
        }
    }
}
