//! Zone events and their versioned wire format
//!
//! `ZoneEvent` is what the membership engine emits. It is immutable once built
//! and is moved into the publisher queue. `EventPayload` is the JSON object put
//! on the transport, one per event.

use crate::domain::types::{format_iso_ms, new_uuid_v7, BoundingBox, Point, ReferencePoint, TrackId, ZoneId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire schema version. Bump when the payload structure changes.
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneEventType {
    ZoneEnter,
    ZoneExit,
    Dwell,
}

impl ZoneEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneEventType::ZoneEnter => "zone_enter",
            ZoneEventType::ZoneExit => "zone_exit",
            ZoneEventType::Dwell => "dwell",
        }
    }
}

impl std::fmt::Display for ZoneEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection context attached to an event (last known values for forced exits)
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionMetadata {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub reference_point: ReferencePoint,
    pub point: Point,
}

/// An event emitted by the membership engine
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneEvent {
    pub event_id: String,
    pub event_type: ZoneEventType,
    pub track_id: TrackId,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub aisle_id: String,
    pub camera_id: String,
    pub parent_zone_id: Option<ZoneId>,
    /// Frame time at which the event was decided (epoch ms)
    pub timestamp_ms: u64,
    pub entered_at_ms: Option<u64>,
    /// Last frame the track was confirmed inside (exit only)
    pub exited_at_ms: Option<u64>,
    pub dwell_seconds: Option<f64>,
    pub detection: DetectionMetadata,
}

impl ZoneEvent {
    /// Fresh event id; every other field is filled by the engine
    pub fn next_id() -> String {
        new_uuid_v7()
    }
}

/// Detection block of the wire payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f64; 4],
    pub reference_point: String,
    pub point: [f64; 2],
}

/// JSON wire format, schema 1.0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub schema_version: String,
    pub event_id: String,
    pub event_type: ZoneEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub track_id: i64,
    pub zone_id: String,
    pub zone_name: String,
    pub aisle_id: String,
    pub camera_id: String,
    #[serde(default)]
    pub parent_zone_id: Option<String>,
    /// ISO-8601 UTC
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entered_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_seconds: Option<f64>,
    pub detection: DetectionPayload,
}

impl EventPayload {
    pub fn from_event(event: &ZoneEvent, site: Option<&str>) -> Self {
        let d = &event.detection;
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            site: site.map(str::to_string),
            track_id: event.track_id.0,
            zone_id: event.zone_id.to_string(),
            zone_name: event.zone_name.clone(),
            aisle_id: event.aisle_id.clone(),
            camera_id: event.camera_id.clone(),
            parent_zone_id: event.parent_zone_id.as_ref().map(ZoneId::to_string),
            timestamp: format_iso_ms(event.timestamp_ms),
            entered_at: event.entered_at_ms.map(format_iso_ms),
            exited_at: event.exited_at_ms.map(format_iso_ms),
            // Two decimals is plenty for seconds of dwell
            dwell_seconds: event.dwell_seconds.map(|s| (s * 100.0).round() / 100.0),
            detection: DetectionPayload {
                label: d.label.clone(),
                confidence: d.confidence,
                bbox: d.bbox.as_array(),
                reference_point: d.reference_point.as_str().to_string(),
                point: [d.point.x, d.point.y],
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Only the version field; any JSON type is accepted so a foreign version
/// reads as "not understood" rather than as a decode error
#[derive(Deserialize)]
struct VersionHeader {
    schema_version: Option<serde_json::Value>,
}

/// Decode an event payload the way a downstream consumer should.
///
/// Unknown additional fields are ignored. A payload whose `schema_version` is
/// missing or not understood yields `Ok(None)` so the caller can skip it.
pub fn decode_event(json: &str) -> Result<Option<EventPayload>, WireError> {
    let header: VersionHeader = serde_json::from_str(json)?;
    match header.schema_version {
        Some(serde_json::Value::String(version)) if version == SCHEMA_VERSION => {}
        _ => return Ok(None),
    }
    Ok(Some(serde_json::from_str(json)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(event_type: ZoneEventType) -> ZoneEvent {
        ZoneEvent {
            event_id: ZoneEvent::next_id(),
            event_type,
            track_id: TrackId(7),
            zone_id: ZoneId::new("ROI_A01"),
            zone_name: "Aisle A-01".to_string(),
            aisle_id: "A-01".to_string(),
            camera_id: "CAM_01".to_string(),
            parent_zone_id: Some(ZoneId::new("WAREHOUSE")),
            timestamp_ms: 1_767_630_096_000,
            entered_at_ms: Some(1_767_630_090_000),
            exited_at_ms: Some(1_767_630_095_000),
            dwell_seconds: Some(5.0),
            detection: DetectionMetadata {
                label: "forklift".to_string(),
                confidence: 0.875,
                bbox: BoundingBox::new(10.0, 20.0, 30.0, 40.0),
                reference_point: ReferencePoint::BottomCenter,
                point: Point::new(20.0, 40.0),
            },
        }
    }

    #[test]
    fn test_payload_fields() {
        let event = sample_event(ZoneEventType::ZoneExit);
        let json = EventPayload::from_event(&event, Some("plant-1")).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["schema_version"], "1.0");
        assert_eq!(value["event_type"], "zone_exit");
        assert_eq!(value["track_id"], 7);
        assert_eq!(value["zone_id"], "ROI_A01");
        assert_eq!(value["aisle_id"], "A-01");
        assert_eq!(value["camera_id"], "CAM_01");
        assert_eq!(value["site"], "plant-1");
        assert_eq!(value["dwell_seconds"], 5.0);
        assert_eq!(value["timestamp"], "2026-01-05T16:21:36Z");
        assert_eq!(value["exited_at"], "2026-01-05T16:21:35Z");
        assert_eq!(value["detection"]["reference_point"], "bottom_center");
        assert_eq!(value["detection"]["bbox"][2], 30.0);
    }

    #[test]
    fn test_enter_payload_omits_exit_fields() {
        let mut event = sample_event(ZoneEventType::ZoneEnter);
        event.exited_at_ms = None;
        event.dwell_seconds = None;
        let value: serde_json::Value =
            serde_json::from_str(&EventPayload::from_event(&event, None).to_json()).unwrap();
        assert!(value.get("exited_at").is_none());
        assert!(value.get("dwell_seconds").is_none());
        assert!(value.get("site").is_none());
    }

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let event = sample_event(ZoneEventType::Dwell);
        let mut value = serde_json::to_value(EventPayload::from_event(&event, None)).unwrap();
        value["future_field"] = serde_json::json!({"nested": true});

        let decoded = decode_event(&value.to_string()).unwrap().unwrap();
        assert_eq!(decoded.event_type, ZoneEventType::Dwell);
        assert_eq!(decoded.event_id, event.event_id);
    }

    #[test]
    fn test_decode_skips_unknown_schema_version() {
        let event = sample_event(ZoneEventType::ZoneEnter);
        let mut value = serde_json::to_value(EventPayload::from_event(&event, None)).unwrap();
        value["schema_version"] = serde_json::json!("2.0");
        assert!(decode_event(&value.to_string()).unwrap().is_none());

        assert!(decode_event(r#"{"event_type": "zone_enter"}"#).unwrap().is_none());
        assert!(decode_event(r#"{"schema_version": 2, "event_type": "zone_enter"}"#).unwrap().is_none());
        assert!(decode_event(r#"{"schema_version": {"major": 1}}"#).unwrap().is_none());
        assert!(decode_event(r#"{"schema_version": null}"#).unwrap().is_none());
        assert!(decode_event("garbage").is_err());
    }
}
