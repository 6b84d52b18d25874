//! Detector input: per-frame batches of tracked detections
//!
//! The wire shape (`FrameMessage` / `RawDetection`) is deliberately lenient so a
//! single malformed detection can be dropped without losing the whole frame.
//! `RawDetection::validate` turns it into a `Detection` the engine can trust.

use crate::domain::types::{
    deserialize_timestamp, BoundingBox, FrameBounds, Point, TimestampValue, TrackId,
};
use serde::Deserialize;
use thiserror::Error;

/// Detection exactly as received from the upstream detector/tracker
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDetection {
    #[serde(default)]
    pub track_id: Option<i64>,
    /// `[x1, y1, x2, y2]` in absolute pixels
    #[serde(default)]
    pub bbox: Option<Vec<f64>>,
    #[serde(default, alias = "class_name")]
    pub label: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Set when the entry had the right keys but the wrong value types
    #[serde(skip)]
    pub malformed: Option<String>,
}

/// A validated detection
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

/// Reasons a detection is dropped for the frame
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// Upstream reports untracked detections with a negative id
    #[error("untracked detection (track_id {0})")]
    Untracked(i64),

    #[error("bbox must have 4 values, got {0}")]
    BadBoxArity(usize),

    #[error("bbox has non-finite coordinates")]
    NonFinite,

    #[error("bbox is inverted ({x1},{y1})-({x2},{y2})")]
    Inverted { x1: f64, y1: f64, x2: f64, y2: f64 },

    #[error("bbox ({x1},{y1})-({x2},{y2}) outside frame {width}x{height}")]
    OutOfFrame { x1: f64, y1: f64, x2: f64, y2: f64, width: f64, height: f64 },

    #[error("confidence {0} outside [0, 1]")]
    BadConfidence(f32),

    #[error("duplicate track_id {0} in frame")]
    DuplicateTrack(i64),

    #[error("malformed detection: {0}")]
    BadType(String),
}

impl DetectionError {
    /// Short label for metrics/log fields
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::MissingField(_) => "missing_field",
            DetectionError::Untracked(_) => "untracked",
            DetectionError::BadBoxArity(_) => "bad_bbox",
            DetectionError::NonFinite => "non_finite",
            DetectionError::Inverted { .. } => "inverted_bbox",
            DetectionError::OutOfFrame { .. } => "out_of_frame",
            DetectionError::BadConfidence(_) => "bad_confidence",
            DetectionError::DuplicateTrack(_) => "duplicate_track",
            DetectionError::BadType(_) => "bad_type",
        }
    }
}

impl RawDetection {
    /// Decode one entry of a frame's `detections` array. A type mismatch is
    /// kept as a malformed detection so it is dropped alone at validation.
    pub fn from_value(value: serde_json::Value) -> Self {
        let track_id = value.get("track_id").and_then(serde_json::Value::as_i64);
        match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => RawDetection { track_id, malformed: Some(e.to_string()), ..Default::default() },
        }
    }

    /// Validate against the configured frame resolution
    pub fn validate(&self, bounds: FrameBounds) -> Result<Detection, DetectionError> {
        if let Some(reason) = &self.malformed {
            return Err(DetectionError::BadType(reason.clone()));
        }
        let track_id = self.track_id.ok_or(DetectionError::MissingField("track_id"))?;
        if track_id < 0 {
            return Err(DetectionError::Untracked(track_id));
        }

        let raw = self.bbox.as_ref().ok_or(DetectionError::MissingField("bbox"))?;
        let [x1, y1, x2, y2] = match raw.as_slice() {
            &[x1, y1, x2, y2] => [x1, y1, x2, y2],
            other => return Err(DetectionError::BadBoxArity(other.len())),
        };
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(DetectionError::NonFinite);
        }
        if x2 < x1 || y2 < y1 {
            return Err(DetectionError::Inverted { x1, y1, x2, y2 });
        }
        if !bounds.contains(Point::new(x1, y1)) || !bounds.contains(Point::new(x2, y2)) {
            return Err(DetectionError::OutOfFrame {
                x1,
                y1,
                x2,
                y2,
                width: bounds.width,
                height: bounds.height,
            });
        }

        let label = self.label.clone().ok_or(DetectionError::MissingField("label"))?;
        let confidence = self.confidence.ok_or(DetectionError::MissingField("confidence"))?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(DetectionError::BadConfidence(confidence));
        }

        Ok(Detection { track_id: TrackId(track_id), bbox: BoundingBox::new(x1, y1, x2, y2), label, confidence })
    }
}

/// One frame as published by the detector
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMessage {
    /// Frame capture time, epoch ms or RFC 3339 string
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: TimestampValue,
    #[serde(default)]
    pub detections: Vec<serde_json::Value>,
    /// Tracks the upstream tracker reports as ended in this frame
    #[serde(default)]
    pub dropped_tracks: Vec<i64>,
}

impl FrameMessage {
    /// Resolve into an engine frame, using `fallback_ms` when the message has no
    /// usable timestamp
    pub fn into_frame(self, fallback_ms: u64) -> DetectionFrame {
        DetectionFrame {
            timestamp_ms: self.timestamp.epoch_ms().unwrap_or(fallback_ms),
            detections: self.detections.into_iter().map(RawDetection::from_value).collect(),
            dropped_tracks: self.dropped_tracks.into_iter().map(TrackId).collect(),
        }
    }
}

/// One frame of input for the membership engine. `timestamp_ms` is the single
/// "now" shared by every transition evaluated for this frame.
#[derive(Debug, Clone, Default)]
pub struct DetectionFrame {
    pub timestamp_ms: u64,
    pub detections: Vec<RawDetection>,
    pub dropped_tracks: Vec<TrackId>,
}

impl DetectionFrame {
    pub fn new(timestamp_ms: u64) -> Self {
        Self { timestamp_ms, detections: Vec::new(), dropped_tracks: Vec::new() }
    }

    /// Builder for tests and replay tooling
    pub fn with_detection(mut self, track_id: i64, bbox: [f64; 4]) -> Self {
        self.detections.push(RawDetection {
            track_id: Some(track_id),
            bbox: Some(bbox.to_vec()),
            label: Some("forklift".to_string()),
            confidence: Some(0.9),
            malformed: None,
        });
        self
    }

    pub fn with_dropped(mut self, track_id: i64) -> Self {
        self.dropped_tracks.push(TrackId(track_id));
        self
    }
}
