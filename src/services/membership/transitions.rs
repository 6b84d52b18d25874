//! Per-frame transitions of the membership state machine
//!
//! | from    | input                          | to      | emits             |
//! |---------|--------------------------------|---------|-------------------|
//! | OUTSIDE | inside                         | INSIDE  | zone_enter        |
//! | INSIDE  | inside                         | INSIDE  | dwell (once)      |
//! | INSIDE  | outside / track unseen         | GRACE   |                   |
//! | GRACE   | inside                         | INSIDE  | dwell (once)      |
//! | GRACE   | tolerance elapsed              | OUTSIDE | zone_exit         |
//! | any     | track dropped / lost           | OUTSIDE | zone_exit         |

use super::{Membership, MembershipEngine, Phase};
use crate::domain::detection::Detection;
use crate::domain::event::{DetectionMetadata, ZoneEvent, ZoneEventType};
use crate::domain::types::TrackId;
use crate::domain::zone::Zone;
use crate::infra::config::HierarchyPolicy;
use crate::services::reference_point;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use tracing::{debug, info};

/// Zone index plus the resolved observation for it
type Hit = (usize, bool, DetectionMetadata);

impl MembershipEngine {
    /// Evaluate one valid detection against every active zone
    pub(crate) fn observe(&mut self, detection: &Detection, now: u64, events: &mut Vec<ZoneEvent>) {
        let mut hits: SmallVec<[Hit; 8]> = SmallVec::new();
        for idx in 0..self.geometry.len() {
            if !self.active[idx] {
                continue;
            }
            let zone = self.geometry.zone_at(idx);
            let point = reference_point::resolve(&detection.bbox, zone.reference_point);
            let inside = self.geometry.contains_at(idx, point);
            let metadata = DetectionMetadata {
                label: detection.label.clone(),
                confidence: detection.confidence,
                bbox: detection.bbox,
                reference_point: zone.reference_point,
                point,
            };
            hits.push((idx, inside, metadata));
        }

        if self.settings.hierarchy_policy == HierarchyPolicy::Propagate {
            let contained: SmallVec<[usize; 8]> =
                hits.iter().filter(|h| h.1).map(|h| h.0).collect();
            for idx in contained {
                for &ancestor in self.geometry.ancestors_of(idx) {
                    if let Some(hit) = hits.iter_mut().find(|h| h.0 == ancestor) {
                        hit.1 = true;
                    }
                }
            }
        }

        for (idx, inside, metadata) in hits {
            self.apply(detection.track_id, idx, inside, metadata, now, events);
        }
    }

    fn apply(
        &mut self,
        track_id: TrackId,
        idx: usize,
        inside: bool,
        metadata: DetectionMetadata,
        now: u64,
        events: &mut Vec<ZoneEvent>,
    ) {
        let zone = self.geometry.zone_at(idx);
        let dwell_threshold = zone.dwell_threshold_ms.unwrap_or(self.settings.dwell_threshold_ms);

        let membership = match self.memberships.entry((track_id, idx)) {
            Entry::Vacant(_) if !inside => return,
            Entry::Vacant(slot) => {
                let membership = Membership {
                    phase: Phase::Inside,
                    entered_at_ms: now,
                    last_confirmed_ms: now,
                    dwell_emitted: false,
                    detection: metadata,
                };
                events.push(build_event(ZoneEventType::ZoneEnter, track_id, zone, now, &membership));
                self.metrics.record_event_emitted(ZoneEventType::ZoneEnter);
                info!(track_id = %track_id, zone_id = %zone.id, "zone_enter");
                slot.insert(membership);
                return;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if !inside {
            membership.detection = metadata;
            if membership.phase == Phase::Inside {
                membership.phase = Phase::Grace { since_ms: now };
                debug!(track_id = %track_id, zone_id = %zone.id, "grace_started");
            }
            return;
        }

        if let Phase::Grace { since_ms } = membership.phase {
            debug!(
                track_id = %track_id,
                zone_id = %zone.id,
                grace_ms = %(now - since_ms),
                "grace_recovered"
            );
        }
        membership.phase = Phase::Inside;
        membership.last_confirmed_ms = now;
        membership.detection = metadata;

        let dwell_ms = now - membership.entered_at_ms;
        if dwell_threshold > 0 && !membership.dwell_emitted && dwell_ms >= dwell_threshold {
            membership.dwell_emitted = true;
            events.push(build_event(ZoneEventType::Dwell, track_id, zone, now, membership));
            self.metrics.record_event_emitted(ZoneEventType::Dwell);
            info!(track_id = %track_id, zone_id = %zone.id, dwell_ms = %dwell_ms, "dwell");
        }
    }

    /// INSIDE memberships of tracks missing from this frame enter GRACE
    pub(crate) fn mark_unseen(&mut self, seen: &FxHashSet<TrackId>, now: u64) {
        for (&(track_id, _), membership) in self.memberships.iter_mut() {
            if membership.phase == Phase::Inside && !seen.contains(&track_id) {
                membership.phase = Phase::Grace { since_ms: now };
            }
        }
    }

    /// Confirm exits for GRACE memberships older than the tolerance window
    pub(crate) fn expire_grace(&mut self, now: u64, events: &mut Vec<ZoneEvent>) {
        let tolerance = self.settings.tolerance_ms;
        let mut expired: Vec<(TrackId, usize)> = self
            .memberships
            .iter()
            .filter(|(_, m)| matches!(m.phase, Phase::Grace { since_ms } if now - since_ms >= tolerance))
            .map(|(&key, _)| key)
            .collect();
        expired.sort_unstable();

        for key in expired {
            self.exit(key, now, "tolerance_elapsed", events);
        }
    }

    /// Tracks unseen for `track_lost_ms` are gone; their memberships exit now
    pub(crate) fn expire_lost_tracks(&mut self, now: u64, events: &mut Vec<ZoneEvent>) {
        let lost_after = self.settings.track_lost_ms;
        let mut lost: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|(_, p)| now - p.last_seen_ms >= lost_after)
            .map(|(&track_id, _)| track_id)
            .collect();
        lost.sort_unstable();

        for track_id in lost {
            self.force_exit_track(track_id, now, "track_lost", events);
        }
    }

    /// Exit every membership of a track immediately and forget the track
    pub(crate) fn force_exit_track(
        &mut self,
        track_id: TrackId,
        now: u64,
        reason: &'static str,
        events: &mut Vec<ZoneEvent>,
    ) {
        let mut zones: SmallVec<[usize; 8]> = self
            .memberships
            .keys()
            .filter(|(t, _)| *t == track_id)
            .map(|&(_, idx)| idx)
            .collect();
        zones.sort_unstable();

        for idx in zones {
            self.exit((track_id, idx), now, reason, events);
            self.metrics.record_forced_exit();
        }

        if self.tracks.remove(&track_id).is_some() {
            debug!(track_id = %track_id, reason, "track_removed");
        }
    }

    /// GRACE/INSIDE -> OUTSIDE. The exit time is the last confirmed inside
    /// frame, not the frame that confirmed the exit.
    fn exit(&mut self, key: (TrackId, usize), now: u64, reason: &'static str, events: &mut Vec<ZoneEvent>) {
        let Some(membership) = self.memberships.remove(&key) else {
            return;
        };
        let zone = self.geometry.zone_at(key.1);
        let event = build_event(ZoneEventType::ZoneExit, key.0, zone, now, &membership);
        info!(
            track_id = %key.0,
            zone_id = %zone.id,
            dwell_seconds = ?event.dwell_seconds,
            reason,
            "zone_exit"
        );
        events.push(event);
        self.metrics.record_event_emitted(ZoneEventType::ZoneExit);
    }
}

fn build_event(
    event_type: ZoneEventType,
    track_id: TrackId,
    zone: &Zone,
    now: u64,
    membership: &Membership,
) -> ZoneEvent {
    let (exited_at_ms, dwell_ms) = match event_type {
        ZoneEventType::ZoneEnter => (None, None),
        ZoneEventType::Dwell => (None, Some(now - membership.entered_at_ms)),
        ZoneEventType::ZoneExit => (
            Some(membership.last_confirmed_ms),
            Some(membership.last_confirmed_ms - membership.entered_at_ms),
        ),
    };

    ZoneEvent {
        event_id: ZoneEvent::next_id(),
        event_type,
        track_id,
        zone_id: zone.id.clone(),
        zone_name: zone.name.clone(),
        aisle_id: zone.aisle_id.clone(),
        camera_id: zone.camera_id.clone(),
        parent_zone_id: zone.parent_id.clone(),
        timestamp_ms: now,
        entered_at_ms: Some(membership.entered_at_ms),
        exited_at_ms,
        dwell_seconds: dwell_ms.map(|ms| ms as f64 / 1000.0),
        detection: membership.detection.clone(),
    }
}
