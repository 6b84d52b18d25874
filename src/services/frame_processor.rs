//! Frame processing loop
//!
//! Single consumer of the frame channel and sole owner of the membership
//! engine. Each frame is fully folded into membership state before the next
//! one is taken; resulting events go to the publisher queue, which never
//! blocks.

use crate::domain::detection::DetectionFrame;
use crate::io::event_channel::{EventSender, SendOutcome};
use crate::services::membership::MembershipEngine;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Totals for one processor run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStats {
    pub frames: u64,
    pub rejected: u64,
    pub events: u64,
    pub events_not_queued: u64,
}

pub struct FrameProcessor {
    engine: MembershipEngine,
    events: EventSender,
    stats: ProcessorStats,
}

impl FrameProcessor {
    pub fn new(engine: MembershipEngine, events: EventSender) -> Self {
        Self { engine, events, stats: ProcessorStats::default() }
    }

    /// Consume frames until the channel closes or shutdown is signalled.
    ///
    /// Open memberships are dropped with the engine; no exits are
    /// synthesized on shutdown.
    pub async fn run(
        mut self,
        mut frame_rx: mpsc::Receiver<DetectionFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProcessorStats {
        info!(zones = %self.engine.geometry().len(), "frame_processor_started");

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(&frame),
                        None => {
                            info!("frame_channel_closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            frames = %self.stats.frames,
            rejected = %self.stats.rejected,
            events = %self.stats.events,
            open_memberships = %self.engine.active_memberships(),
            "frame_processor_stopped"
        );
        self.stats
    }

    /// Process one frame and queue its events in emission order
    pub fn handle_frame(&mut self, frame: &DetectionFrame) {
        let events = match self.engine.process_frame(frame) {
            Ok(events) => events,
            Err(_) => {
                // Logged and counted by the engine
                self.stats.rejected += 1;
                return;
            }
        };
        self.stats.frames += 1;

        if !events.is_empty() {
            debug!(timestamp_ms = %frame.timestamp_ms, events = %events.len(), "frame_events");
        }
        for event in events {
            self.stats.events += 1;
            if self.events.send(event) != SendOutcome::Queued {
                self.stats.events_not_queued += 1;
            }
        }
    }

    pub fn engine(&self) -> &MembershipEngine {
        &self.engine
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{ZoneEvent, ZoneEventType};
    use crate::domain::types::TrackId;
    use crate::domain::zone::Zone;
    use crate::infra::metrics::Metrics;
    use crate::io::event_channel::create_event_channel;
    use crate::services::geometry::GeometryIndex;
    use crate::services::membership::EngineSettings;
    use std::sync::Arc;

    fn processor(queue: usize) -> (FrameProcessor, mpsc::Receiver<ZoneEvent>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let geometry = GeometryIndex::new(vec![Zone::new(
            "A",
            &[(100.0, 100.0), (500.0, 100.0), (500.0, 500.0), (100.0, 500.0)],
        )])
        .unwrap();
        let engine = MembershipEngine::new(geometry, EngineSettings::default(), metrics.clone());
        let (sender, rx) = create_event_channel(queue, queue, metrics.clone());
        (FrameProcessor::new(engine, sender), rx, metrics)
    }

    fn frame(timestamp_ms: u64, inside: bool) -> DetectionFrame {
        let bbox = if inside { [250.0, 200.0, 350.0, 300.0] } else { [800.0, 200.0, 900.0, 300.0] };
        DetectionFrame::new(timestamp_ms).with_detection(1, bbox)
    }

    #[tokio::test]
    async fn test_run_until_channel_closed() {
        let (processor, mut rx, metrics) = processor(16);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        frame_tx.send(frame(1_000, true)).await.unwrap();
        frame_tx.send(frame(1_100, false)).await.unwrap();
        frame_tx.send(frame(1_000, false)).await.unwrap(); // out of order
        frame_tx.send(frame(2_200, false)).await.unwrap();
        drop(frame_tx);

        let stats = processor.run(frame_rx, shutdown_rx).await;
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(metrics.frames_rejected(), 1);

        let enter = rx.recv().await.unwrap();
        let exit = rx.recv().await.unwrap();
        assert_eq!(enter.event_type, ZoneEventType::ZoneEnter);
        assert_eq!(exit.event_type, ZoneEventType::ZoneExit);
        assert_eq!(exit.track_id, TrackId(1));
        assert_eq!(exit.exited_at_ms, Some(1_000));
    }

    #[tokio::test]
    async fn test_full_queue_does_not_stall_processing() {
        let (mut processor, _rx, metrics) = processor(1);

        // Two tracks entering in one frame produce two events for a queue of one
        let first = frame(1_000, true).with_detection(2, [300.0, 300.0, 400.0, 400.0]);
        processor.handle_frame(&first);
        processor.handle_frame(&frame(1_100, true));

        assert_eq!(processor.stats().events, 2);
        assert_eq!(processor.stats().events_not_queued, 1);
        assert_eq!(metrics.events_queue_dropped(), 1);
        assert_eq!(processor.engine().active_memberships(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drops_open_memberships_silently() {
        let (processor, mut rx, _metrics) = processor(16);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        frame_tx.send(frame(1_000, true)).await.unwrap();
        let handle = tokio::spawn(processor.run(frame_rx, shutdown_rx));

        let enter = rx.recv().await.unwrap();
        assert_eq!(enter.event_type, ZoneEventType::ZoneEnter);

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.frames, 1);
        assert!(rx.try_recv().is_err());
        drop(frame_tx);
    }
}
