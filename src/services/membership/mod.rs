//! Zone membership state machine
//!
//! For every (track, zone) pair the engine keeps one of three states:
//! OUTSIDE (no entry stored), INSIDE, or GRACE. GRACE absorbs short detector
//! misses; only a GRACE that outlives the tolerance window becomes an exit.
//!
//! The engine is synchronous and owned by a single task. Every transition in a
//! frame is evaluated against that frame's timestamp, so replaying the same
//! frames always produces the same events.

mod transitions;

use crate::domain::detection::{Detection, DetectionError, DetectionFrame};
use crate::domain::event::{DetectionMetadata, ZoneEvent};
use crate::domain::types::{FrameBounds, TrackId, ZoneId};
use crate::infra::config::{Config, HierarchyPolicy};
use crate::infra::metrics::Metrics;
use crate::services::geometry::GeometryIndex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, warn};

/// Externally visible membership status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Outside,
    Inside,
    Grace,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Outside => "outside",
            MembershipStatus::Inside => "inside",
            MembershipStatus::Grace => "grace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Inside,
    /// Not confirmed inside since `since_ms`
    Grace { since_ms: u64 },
}

/// State of one (track, zone) pair that is not OUTSIDE
#[derive(Debug, Clone)]
pub(crate) struct Membership {
    pub(crate) phase: Phase,
    pub(crate) entered_at_ms: u64,
    pub(crate) last_confirmed_ms: u64,
    pub(crate) dwell_emitted: bool,
    /// Last observation of the track, used for events raised without a detection
    pub(crate) detection: DetectionMetadata,
}

impl Membership {
    fn status(&self) -> MembershipStatus {
        match self.phase {
            Phase::Inside => MembershipStatus::Inside,
            Phase::Grace { .. } => MembershipStatus::Grace,
        }
    }
}

/// Read-only snapshot of a membership for callers and diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipView {
    pub track_id: TrackId,
    pub zone_id: ZoneId,
    pub status: MembershipStatus,
    pub entered_at_ms: u64,
    pub last_confirmed_ms: u64,
    pub dwell_emitted: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackPresence {
    pub(crate) last_seen_ms: u64,
}

/// Tunables for the state machine
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub tolerance_ms: u64,
    pub track_lost_ms: u64,
    /// Fallback dwell threshold; 0 disables dwell for zones without their own
    pub dwell_threshold_ms: u64,
    pub hierarchy_policy: HierarchyPolicy,
    pub frame_bounds: FrameBounds,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tolerance_ms: 1000,
            track_lost_ms: 1000,
            dwell_threshold_ms: 0,
            hierarchy_policy: HierarchyPolicy::Independent,
            frame_bounds: FrameBounds::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tolerance_ms: config.tolerance_ms(),
            track_lost_ms: config.track_lost_ms(),
            dwell_threshold_ms: config.dwell_threshold_ms(),
            hierarchy_policy: config.hierarchy_policy(),
            frame_bounds: config.frame_bounds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame at {timestamp_ms} ms is older than the last frame at {last_ms} ms")]
    OutOfOrder { timestamp_ms: u64, last_ms: u64 },
}

/// Zone membership engine
pub struct MembershipEngine {
    pub(crate) geometry: GeometryIndex,
    /// Runtime copy of each zone's active flag, indexed like `geometry`
    pub(crate) active: Vec<bool>,
    pub(crate) settings: EngineSettings,
    /// Only INSIDE and GRACE pairs are stored; absence means OUTSIDE
    pub(crate) memberships: FxHashMap<(TrackId, usize), Membership>,
    pub(crate) tracks: FxHashMap<TrackId, TrackPresence>,
    pub(crate) last_frame_ms: Option<u64>,
    pub(crate) metrics: Arc<Metrics>,
}

impl MembershipEngine {
    pub fn new(geometry: GeometryIndex, settings: EngineSettings, metrics: Arc<Metrics>) -> Self {
        let active = geometry.zones().map(|z| z.active).collect();
        Self {
            geometry,
            active,
            settings,
            memberships: FxHashMap::default(),
            tracks: FxHashMap::default(),
            last_frame_ms: None,
            metrics,
        }
    }

    /// Fold one frame into the membership state and return the events it caused,
    /// in emission order.
    pub fn process_frame(&mut self, frame: &DetectionFrame) -> Result<Vec<ZoneEvent>, FrameError> {
        let process_start = Instant::now();
        let now = frame.timestamp_ms;

        if let Some(last_ms) = self.last_frame_ms {
            if now < last_ms {
                self.metrics.record_frame_rejected();
                warn!(timestamp_ms = %now, last_ms = %last_ms, "frame_out_of_order");
                return Err(FrameError::OutOfOrder { timestamp_ms: now, last_ms });
            }
        }
        self.last_frame_ms = Some(now);

        let detections = self.validate_detections(frame);
        let mut events = Vec::new();
        let mut seen = FxHashSet::default();

        for detection in &detections {
            seen.insert(detection.track_id);
            self.tracks.insert(detection.track_id, TrackPresence { last_seen_ms: now });
            self.observe(detection, now, &mut events);
        }

        for &track_id in &frame.dropped_tracks {
            self.force_exit_track(track_id, now, "dropped", &mut events);
        }

        self.mark_unseen(&seen, now);
        self.expire_grace(now, &mut events);
        self.expire_lost_tracks(now, &mut events);

        if self.check_invariants() > 0 {
            debug_assert!(false, "membership invariants violated");
        }

        self.metrics.set_engine_population(self.tracks.len(), self.memberships.len());
        self.metrics.record_frame_processed(process_start.elapsed().as_micros() as u64);
        Ok(events)
    }

    /// Validate raw detections; invalid ones and repeated track ids are dropped
    /// without affecting the rest of the frame.
    fn validate_detections(&self, frame: &DetectionFrame) -> Vec<Detection> {
        let mut valid = Vec::with_capacity(frame.detections.len());
        let mut ids = FxHashSet::default();
        let mut dropped = 0u64;

        for raw in &frame.detections {
            let result = raw.validate(self.settings.frame_bounds).and_then(|d| {
                if ids.insert(d.track_id) {
                    Ok(d)
                } else {
                    Err(DetectionError::DuplicateTrack(d.track_id.0))
                }
            });
            match result {
                Ok(d) => valid.push(d),
                Err(e) => {
                    dropped += 1;
                    warn!(
                        timestamp_ms = %frame.timestamp_ms,
                        track_id = ?raw.track_id,
                        kind = e.kind(),
                        error = %e,
                        "detection_dropped"
                    );
                }
            }
        }

        self.metrics.record_detections(valid.len() as u64, dropped);
        valid
    }

    /// Mark a zone inactive. Its memberships are abandoned without exit events.
    /// Returns the number of memberships abandoned.
    pub fn deactivate_zone(&mut self, zone_id: &ZoneId) -> Option<usize> {
        let idx = self.geometry.index_of(zone_id)?;
        self.active[idx] = false;

        let before = self.memberships.len();
        self.memberships.retain(|&(_, zone_idx), _| zone_idx != idx);
        let abandoned = before - self.memberships.len();

        self.metrics.record_abandoned(abandoned as u64);
        warn!(zone_id = %zone_id, abandoned = %abandoned, "zone_deactivated");
        Some(abandoned)
    }

    pub fn is_zone_active(&self, zone_id: &ZoneId) -> bool {
        self.geometry.index_of(zone_id).is_some_and(|idx| self.active[idx])
    }

    /// Current status of a (track, zone) pair; unknown pairs are OUTSIDE
    pub fn status(&self, track_id: TrackId, zone_id: &ZoneId) -> MembershipStatus {
        self.geometry
            .index_of(zone_id)
            .and_then(|idx| self.memberships.get(&(track_id, idx)))
            .map_or(MembershipStatus::Outside, Membership::status)
    }

    pub fn membership(&self, track_id: TrackId, zone_id: &ZoneId) -> Option<MembershipView> {
        let idx = self.geometry.index_of(zone_id)?;
        self.memberships.get(&(track_id, idx)).map(|m| self.view(track_id, idx, m))
    }

    /// All non-OUTSIDE memberships, ordered by track then zone
    pub fn memberships(&self) -> Vec<MembershipView> {
        let mut keys: Vec<_> = self.memberships.keys().copied().collect();
        keys.sort_unstable();
        keys.into_iter()
            .map(|key| self.view(key.0, key.1, &self.memberships[&key]))
            .collect()
    }

    fn view(&self, track_id: TrackId, idx: usize, m: &Membership) -> MembershipView {
        MembershipView {
            track_id,
            zone_id: self.geometry.zone_at(idx).id.clone(),
            status: m.status(),
            entered_at_ms: m.entered_at_ms,
            last_confirmed_ms: m.last_confirmed_ms,
            dwell_emitted: m.dwell_emitted,
        }
    }

    /// Tracks seen within the track-lost window
    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn active_memberships(&self) -> usize {
        self.memberships.len()
    }

    pub fn geometry(&self) -> &GeometryIndex {
        &self.geometry
    }

    /// Verify structural invariants of the stored state. Each violation is
    /// logged and counted; returns the number found.
    pub fn check_invariants(&self) -> usize {
        let mut violations = 0;
        for (&(track_id, idx), m) in &self.memberships {
            let zone_id = &self.geometry.zone_at(idx).id;
            let problem = if m.entered_at_ms > m.last_confirmed_ms {
                Some("entered_after_last_confirmed")
            } else if matches!(m.phase, Phase::Grace { since_ms } if since_ms < m.last_confirmed_ms) {
                Some("grace_before_last_confirmed")
            } else if !self.active[idx] {
                Some("membership_in_inactive_zone")
            } else if !self.tracks.contains_key(&track_id) {
                Some("membership_without_track")
            } else {
                None
            };

            if let Some(problem) = problem {
                violations += 1;
                self.metrics.record_invariant_violation();
                error!(track_id = %track_id, zone_id = %zone_id, problem, "membership_invariant_violated");
            }
        }
        violations
    }
}
