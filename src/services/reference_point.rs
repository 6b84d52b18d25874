//! Reference point resolution
//!
//! Derives the single point of a bounding box used for containment tests.
//! The mode is configured per zone, so one detection may resolve to different
//! points for different zones.

use crate::domain::types::{BoundingBox, Point, ReferencePoint};

/// Resolve a bounding box to a point. Pure and deterministic.
#[inline]
pub fn resolve(bbox: &BoundingBox, mode: ReferencePoint) -> Point {
    let cx = (bbox.x1 + bbox.x2) / 2.0;
    match mode {
        ReferencePoint::BottomCenter => Point::new(cx, bbox.y2),
        ReferencePoint::TopCenter => Point::new(cx, bbox.y1),
        ReferencePoint::Centroid => Point::new(cx, (bbox.y1 + bbox.y2) / 2.0),
    }
}
