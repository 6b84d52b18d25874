//! Bounded queue between the membership engine and the event publisher
//!
//! The engine must never wait on the transport, so sends use `try_send`.
//! A full queue drops the event; both drops and high queue depth are logged
//! at most once per second and exported as metrics.

use crate::domain::event::ZoneEvent;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Rate limiter for repeated warnings
struct WarnLimiter {
    last: Mutex<Instant>,
}

impl WarnLimiter {
    fn new() -> Self {
        // Allow an immediate first warning
        Self { last: Mutex::new(Instant::now() - WARN_INTERVAL * 2) }
    }

    fn ready(&self) -> bool {
        let mut last = self.last.lock();
        if last.elapsed() >= WARN_INTERVAL {
            *last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Outcome of handing an event to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full, event dropped
    Dropped,
    /// Publisher gone (shutdown), event dropped
    Closed,
}

/// Cloneable, non-blocking handle for queueing zone events
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ZoneEvent>,
    capacity: usize,
    high_water: usize,
    metrics: Arc<Metrics>,
    drop_warn: Arc<WarnLimiter>,
    high_water_warn: Arc<WarnLimiter>,
}

impl EventSender {
    /// Queue an event without blocking
    pub fn send(&self, event: ZoneEvent) -> SendOutcome {
        let event_id = event.event_id.clone();
        let outcome = match self.tx.try_send(event) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.metrics.record_event_queue_dropped();
                if self.drop_warn.ready() {
                    warn!(
                        event_id = %event_id,
                        capacity = %self.capacity,
                        dropped_total = %self.metrics.events_queue_dropped(),
                        "event_queue_full"
                    );
                }
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_event_queue_dropped();
                if self.drop_warn.ready() {
                    warn!(event_id = %event_id, "event_queue_closed");
                }
                SendOutcome::Closed
            }
        };

        let depth = self.depth();
        self.metrics.set_event_queue_depth(depth as u64);
        if depth >= self.high_water && self.high_water_warn.ready() {
            warn!(depth = %depth, high_water = %self.high_water, capacity = %self.capacity, "event_queue_high_water");
        }
        outcome
    }

    /// Events currently waiting in the queue
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Create the event queue
///
/// `high_water` is the depth at which a warning is logged; it is clamped to
/// the capacity.
pub fn create_event_channel(
    capacity: usize,
    high_water: usize,
    metrics: Arc<Metrics>,
) -> (EventSender, mpsc::Receiver<ZoneEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = EventSender {
        tx,
        capacity,
        high_water: high_water.clamp(1, capacity),
        metrics,
        drop_warn: Arc::new(WarnLimiter::new()),
        high_water_warn: Arc::new(WarnLimiter::new()),
    };
    (sender, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{DetectionMetadata, ZoneEventType};
    use crate::domain::types::{BoundingBox, Point, ReferencePoint, TrackId, ZoneId};

    fn event(track: i64) -> ZoneEvent {
        ZoneEvent {
            event_id: ZoneEvent::next_id(),
            event_type: ZoneEventType::ZoneEnter,
            track_id: TrackId(track),
            zone_id: ZoneId::new("Z"),
            zone_name: "Z".to_string(),
            aisle_id: "A".to_string(),
            camera_id: "CAM_01".to_string(),
            parent_zone_id: None,
            timestamp_ms: 1000,
            entered_at_ms: Some(1000),
            exited_at_ms: None,
            dwell_seconds: None,
            detection: DetectionMetadata {
                label: "forklift".to_string(),
                confidence: 0.9,
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                reference_point: ReferencePoint::BottomCenter,
                point: Point::new(5.0, 10.0),
            },
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_event_channel(2, 1, metrics.clone());

        assert_eq!(sender.send(event(1)), SendOutcome::Queued);
        assert_eq!(sender.send(event(2)), SendOutcome::Queued);
        assert_eq!(sender.send(event(3)), SendOutcome::Dropped);

        assert_eq!(metrics.events_queue_dropped(), 1);
        assert_eq!(metrics.event_queue_depth(), 2);
        assert_eq!(metrics.event_queue_peak(), 2);

        // FIFO order is preserved for what was queued
        assert_eq!(rx.recv().await.unwrap().track_id, TrackId(1));
        assert_eq!(rx.recv().await.unwrap().track_id, TrackId(2));
        assert_eq!(sender.depth(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let metrics = Arc::new(Metrics::new());
        let (sender, rx) = create_event_channel(4, 3, metrics.clone());
        drop(rx);

        assert_eq!(sender.send(event(1)), SendOutcome::Closed);
        assert_eq!(metrics.events_queue_dropped(), 1);
    }

    #[test]
    fn test_high_water_is_clamped() {
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx) = create_event_channel(4, 100, metrics);
        assert_eq!(sender.high_water, 4);
        assert_eq!(sender.capacity(), 4);
    }

    #[test]
    fn test_warn_limiter() {
        let limiter = WarnLimiter::new();
        assert!(limiter.ready());
        assert!(!limiter.ready());
    }
}
