//! Lock-free metrics collection and periodic reporting
//!
//! Shared by the frame processor, the event queue, the publisher and the
//! MQTT event loop. Counter updates are lock-free; `report()` swaps the
//! windowed counters to zero.
//!
//! NOTE: Relaxed ordering throughout. These are statistics only and must not
//! drive engine or publisher decisions.

use crate::domain::event::ZoneEventType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total frames folded into membership state (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Sum of frame processing latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max frame processing latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Frame processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Frames rejected for arriving out of order
    frames_rejected: AtomicU64,
    /// Frames dropped at ingress because the frame queue was full
    frames_dropped: AtomicU64,
    /// Valid detections processed
    detections_total: AtomicU64,
    /// Detections dropped for data errors
    detections_dropped: AtomicU64,
    zone_enter_total: AtomicU64,
    zone_exit_total: AtomicU64,
    dwell_total: AtomicU64,
    /// Exits synthesised for vanished or dropped tracks
    forced_exits_total: AtomicU64,
    /// Memberships abandoned by zone deactivation
    abandoned_total: AtomicU64,
    invariant_violations: AtomicU64,
    /// Events handed to the transport successfully
    events_published: AtomicU64,
    /// Events whose publish call failed
    events_publish_failed: AtomicU64,
    /// Events surfaced only through diagnostics (transport down)
    events_degraded: AtomicU64,
    /// Events dropped because the publisher queue was full
    events_queue_dropped: AtomicU64,
    /// Events discarded at shutdown after the drain deadline
    events_discarded: AtomicU64,
    /// QoS 1 acknowledgements received from the broker
    pubacks_total: AtomicU64,
    /// Current publisher queue depth (snapshot)
    event_queue_depth: AtomicU64,
    /// Highest publisher queue depth observed
    event_queue_peak: AtomicU64,
    /// 1 when the transport is connected
    transport_connected: AtomicU64,
    active_tracks: AtomicU64,
    active_memberships: AtomicU64,
    /// Last report time for rate calculation
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: Default::default(),
            frames_rejected: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            detections_dropped: AtomicU64::new(0),
            zone_enter_total: AtomicU64::new(0),
            zone_exit_total: AtomicU64::new(0),
            dwell_total: AtomicU64::new(0),
            forced_exits_total: AtomicU64::new(0),
            abandoned_total: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_publish_failed: AtomicU64::new(0),
            events_degraded: AtomicU64::new(0),
            events_queue_dropped: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            pubacks_total: AtomicU64::new(0),
            event_queue_depth: AtomicU64::new(0),
            event_queue_peak: AtomicU64::new(0),
            transport_connected: AtomicU64::new(0),
            active_tracks: AtomicU64::new(0),
            active_memberships: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record one processed frame and its latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detections(&self, valid: u64, dropped: u64) {
        self.detections_total.fetch_add(valid, Ordering::Relaxed);
        self.detections_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    #[inline]
    pub fn detections_dropped(&self) -> u64 {
        self.detections_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_event_emitted(&self, event_type: ZoneEventType) {
        let counter = match event_type {
            ZoneEventType::ZoneEnter => &self.zone_enter_total,
            ZoneEventType::ZoneExit => &self.zone_exit_total,
            ZoneEventType::Dwell => &self.dwell_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_emitted(&self, event_type: ZoneEventType) -> u64 {
        match event_type {
            ZoneEventType::ZoneEnter => self.zone_enter_total.load(Ordering::Relaxed),
            ZoneEventType::ZoneExit => self.zone_exit_total.load(Ordering::Relaxed),
            ZoneEventType::Dwell => self.dwell_total.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn record_forced_exit(&self) {
        self.forced_exits_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_abandoned(&self, count: u64) {
        self.abandoned_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invariant_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.events_publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_degraded(&self) {
        self.events_degraded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_degraded(&self) -> u64 {
        self.events_degraded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_event_queue_dropped(&self) {
        self.events_queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_queue_dropped(&self) -> u64 {
        self.events_queue_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_events_discarded(&self, count: u64) {
        self.events_discarded.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_discarded(&self) -> u64 {
        self.events_discarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_puback(&self) {
        self.pubacks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set current publisher queue depth and track the peak
    #[inline]
    pub fn set_event_queue_depth(&self, depth: u64) {
        self.event_queue_depth.store(depth, Ordering::Relaxed);
        update_atomic_max(&self.event_queue_peak, depth);
    }

    #[inline]
    pub fn event_queue_depth(&self) -> u64 {
        self.event_queue_depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn event_queue_peak(&self) -> u64 {
        self.event_queue_peak.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_transport_connected(&self, connected: bool) {
        self.transport_connected.store(connected as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn transport_connected(&self) -> bool {
        self.transport_connected.load(Ordering::Relaxed) == 1
    }

    /// Gauges owned by the frame processor
    #[inline]
    pub fn set_engine_population(&self, tracks: usize, memberships: usize) {
        self.active_tracks.store(tracks as u64, Ordering::Relaxed);
        self.active_memberships.store(memberships as u64, Ordering::Relaxed);
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        // Swap periodic counters to zero and get their values
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(frames_count, latency_sum, max_latency, lat_buckets, elapsed)
    }

    /// Summary of the current reporting window without resetting anything
    /// (used by the scrape endpoint so it does not steal the periodic report)
    pub fn snapshot(&self) -> MetricsSummary {
        let mut lat_buckets = [0u64; NUM_BUCKETS];
        for (i, bucket) in self.latency_buckets.iter().enumerate() {
            lat_buckets[i] = bucket.load(Ordering::Relaxed);
        }
        self.summarize(
            self.frames_since_report.load(Ordering::Relaxed),
            self.latency_sum_us.load(Ordering::Relaxed),
            self.latency_max_us.load(Ordering::Relaxed),
            lat_buckets,
            self.last_report_time.lock().elapsed(),
        )
    }

    fn summarize(
        &self,
        frames_count: u64,
        latency_sum: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
        elapsed: Duration,
    ) -> MetricsSummary {
        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if frames_count > 0 { latency_sum / frames_count } else { 0 };

        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec,
            avg_frame_latency_us: avg_latency,
            max_frame_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_dropped: self.detections_dropped.load(Ordering::Relaxed),
            zone_enter_total: self.zone_enter_total.load(Ordering::Relaxed),
            zone_exit_total: self.zone_exit_total.load(Ordering::Relaxed),
            dwell_total: self.dwell_total.load(Ordering::Relaxed),
            forced_exits_total: self.forced_exits_total.load(Ordering::Relaxed),
            abandoned_total: self.abandoned_total.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_publish_failed: self.events_publish_failed.load(Ordering::Relaxed),
            events_degraded: self.events_degraded.load(Ordering::Relaxed),
            events_queue_dropped: self.events_queue_dropped.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            pubacks_total: self.pubacks_total.load(Ordering::Relaxed),
            event_queue_depth: self.event_queue_depth.load(Ordering::Relaxed),
            event_queue_peak: self.event_queue_peak.load(Ordering::Relaxed),
            transport_connected: self.transport_connected(),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
            active_memberships: self.active_memberships.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    /// Frame processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub frames_rejected: u64,
    pub frames_dropped: u64,
    pub detections_total: u64,
    pub detections_dropped: u64,
    pub zone_enter_total: u64,
    pub zone_exit_total: u64,
    pub dwell_total: u64,
    pub forced_exits_total: u64,
    pub abandoned_total: u64,
    pub invariant_violations: u64,
    pub events_published: u64,
    pub events_publish_failed: u64,
    pub events_degraded: u64,
    pub events_queue_dropped: u64,
    pub events_discarded: u64,
    pub pubacks_total: u64,
    pub event_queue_depth: u64,
    pub event_queue_peak: u64,
    pub transport_connected: bool,
    pub active_tracks: u64,
    pub active_memberships: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            avg_latency_us = %self.avg_frame_latency_us,
            max_latency_us = %self.max_frame_latency_us,
            p99_us = %self.lat_p99_us,
            active_tracks = %self.active_tracks,
            active_memberships = %self.active_memberships,
            enters = %self.zone_enter_total,
            exits = %self.zone_exit_total,
            dwells = %self.dwell_total,
            published = %self.events_published,
            degraded = %self.events_degraded,
            queue_depth = %self.event_queue_depth,
            transport_connected = %self.transport_connected,
            "metrics"
        );
    }
}
