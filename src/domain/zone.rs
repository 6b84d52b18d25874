//! Zone definitions and the static zone file
//!
//! Zones are loaded once at startup. Anything malformed is a `ZoneError`
//! and the process refuses to start.
//!
//! File format (legacy `rois` / `points` / `is_active` keys are accepted):
//! ```json
//! {
//!   "zones": [
//!     {
//!       "id": "ROI_A01",
//!       "name": "Aisle A-01",
//!       "aisle_id": "A-01",
//!       "camera_id": "CAM_01",
//!       "polygon": [[100, 200], [400, 200], [400, 600], [100, 600]],
//!       "reference_point": "bottom_center",
//!       "parent_id": null,
//!       "active": true,
//!       "dwell_threshold_ms": 5000
//!     }
//!   ]
//! }
//! ```

use crate::domain::types::{FrameBounds, Point, ReferencePoint, ZoneId};
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Load-time configuration errors for zone geometry
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZoneError {
    #[error("invalid zone file: {0}")]
    Parse(String),

    #[error("zone '{zone}': polygon needs at least 3 vertices, found {found}")]
    TooFewVertices { zone: ZoneId, found: usize },

    #[error("zone '{zone}': vertex {index} is malformed")]
    MalformedVertex { zone: ZoneId, index: usize },

    #[error("zone '{zone}': vertex {index} ({x}, {y}) is outside the {width}x{height} frame")]
    VertexOutOfFrame { zone: ZoneId, index: usize, x: f64, y: f64, width: f64, height: f64 },

    #[error("zone '{zone}': polygon has zero area")]
    Degenerate { zone: ZoneId },

    #[error("zone '{zone}': polygon edges {a} and {b} intersect")]
    SelfIntersecting { zone: ZoneId, a: usize, b: usize },

    #[error("zone '{zone}': unknown reference point mode '{mode}'")]
    UnknownReferencePoint { zone: ZoneId, mode: String },

    #[error("zone '{zone}': dwell threshold must be non-negative")]
    BadDwellThreshold { zone: ZoneId },

    #[error("duplicate zone id '{0}'")]
    DuplicateId(ZoneId),

    #[error("zone '{zone}': parent '{parent}' does not exist")]
    UnknownParent { zone: ZoneId, parent: ZoneId },

    #[error("zone '{0}': parent chain forms a cycle")]
    ParentCycle(ZoneId),

    #[error("zone file defines no zones")]
    Empty,
}

/// Zone entry as written in the zone file
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDefinition {
    pub id: String,
    pub name: String,
    pub aisle_id: String,
    pub camera_id: String,
    #[serde(alias = "points")]
    pub polygon: Vec<Vec<f64>>,
    #[serde(default)]
    pub reference_point: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "default_active", alias = "is_active")]
    pub active: bool,
    #[serde(default)]
    pub dwell_threshold_ms: Option<u64>,
    /// Legacy threshold in seconds; `dwell_threshold_ms` wins when both are set
    #[serde(default)]
    pub dwell_threshold_sec: Option<f64>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneFile {
    #[serde(alias = "rois")]
    pub zones: Vec<ZoneDefinition>,
}

/// A validated zone. Immutable after load except for the `active` flag,
/// which only the engine may clear.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub aisle_id: String,
    pub camera_id: String,
    pub parent_id: Option<ZoneId>,
    pub polygon: Vec<Point>,
    pub reference_point: ReferencePoint,
    pub active: bool,
    /// Per-zone dwell threshold; `None` falls back to the configured default
    pub dwell_threshold_ms: Option<u64>,
}

impl Zone {
    /// Convenience constructor used by tests and tooling
    pub fn new(id: &str, polygon: &[(f64, f64)]) -> Self {
        Self {
            id: ZoneId::new(id),
            name: id.to_string(),
            aisle_id: id.to_string(),
            camera_id: "CAM_01".to_string(),
            parent_id: None,
            polygon: polygon.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            reference_point: ReferencePoint::default(),
            active: true,
            dwell_threshold_ms: None,
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent_id = Some(ZoneId::new(parent));
        self
    }

    pub fn with_reference_point(mut self, mode: ReferencePoint) -> Self {
        self.reference_point = mode;
        self
    }

    pub fn with_dwell_threshold_ms(mut self, ms: u64) -> Self {
        self.dwell_threshold_ms = Some(ms);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

impl ZoneDefinition {
    /// Per-zone checks that do not need the rest of the file
    pub fn into_zone(self, bounds: FrameBounds) -> Result<Zone, ZoneError> {
        let id = ZoneId::new(self.id);

        if self.polygon.len() < 3 {
            return Err(ZoneError::TooFewVertices { zone: id, found: self.polygon.len() });
        }

        let mut polygon = Vec::with_capacity(self.polygon.len());
        for (index, vertex) in self.polygon.iter().enumerate() {
            let &[x, y] = vertex.as_slice() else {
                return Err(ZoneError::MalformedVertex { zone: id, index });
            };
            let p = Point::new(x, y);
            if !p.is_finite() {
                return Err(ZoneError::MalformedVertex { zone: id, index });
            }
            if !bounds.contains(p) {
                return Err(ZoneError::VertexOutOfFrame {
                    zone: id,
                    index,
                    x,
                    y,
                    width: bounds.width,
                    height: bounds.height,
                });
            }
            polygon.push(p);
        }
        close_ring(&mut polygon);
        if polygon.len() < 3 {
            return Err(ZoneError::TooFewVertices { zone: id, found: polygon.len() });
        }

        let reference_point = match self.reference_point.as_deref() {
            None => ReferencePoint::default(),
            Some(mode) => mode
                .parse()
                .map_err(|mode| ZoneError::UnknownReferencePoint { zone: id.clone(), mode })?,
        };

        let dwell_threshold_ms = match (self.dwell_threshold_ms, self.dwell_threshold_sec) {
            (Some(ms), _) => Some(ms),
            (None, Some(sec)) if sec.is_finite() && sec >= 0.0 => Some((sec * 1000.0).round() as u64),
            (None, Some(_)) => return Err(ZoneError::BadDwellThreshold { zone: id }),
            (None, None) => None,
        };

        Ok(Zone {
            id,
            name: self.name,
            aisle_id: self.aisle_id,
            camera_id: self.camera_id,
            parent_id: self.parent_id.map(ZoneId::new),
            polygon,
            reference_point,
            active: self.active,
            dwell_threshold_ms,
        })
    }
}

/// Drop repeated consecutive vertices and a closing vertex equal to the first.
/// `[a, b, c, a]` and `[a, b, c]` describe the same ring.
pub(crate) fn close_ring(polygon: &mut Vec<Point>) {
    polygon.dedup();
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
}

/// Parse zone JSON and run per-zone validation. Cross-zone checks (duplicates,
/// parents, polygon simplicity) happen when the geometry index is built.
pub fn parse_zones(json: &str, bounds: FrameBounds) -> Result<Vec<Zone>, ZoneError> {
    let file: ZoneFile = serde_json::from_str(json).map_err(|e| ZoneError::Parse(e.to_string()))?;
    if file.zones.is_empty() {
        return Err(ZoneError::Empty);
    }
    file.zones.into_iter().map(|def| def.into_zone(bounds)).collect()
}

/// Read and parse the zone file
pub fn load_zone_file<P: AsRef<Path>>(path: P, bounds: FrameBounds) -> anyhow::Result<Vec<Zone>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read zone file {}", path.display()))?;
    let zones = parse_zones(&content, bounds)
        .with_context(|| format!("Invalid zone file {}", path.display()))?;
    Ok(zones)
}
