//! Geometry index - zone polygons and point containment
//!
//! Built once from the validated zone list and immutable afterwards, so it is
//! shared without locking. Containment is a crossing-number test with an
//! explicit on-edge check first: the polygon is a closed region and a point on
//! an edge or vertex is inside.

use crate::domain::types::{Point, ZoneId};
use crate::domain::zone::{close_ring, Zone, ZoneError};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Distance (pixels) under which a point counts as lying on an edge
const ON_EDGE_EPSILON: f64 = 1e-6;

/// Minimum absolute polygon area (square pixels)
const MIN_AREA: f64 = 1e-9;

#[derive(Debug, Clone)]
struct IndexedZone {
    zone: Zone,
    /// Axis-aligned bounds for a cheap reject: (min_x, min_y, max_x, max_y)
    aabb: (f64, f64, f64, f64),
    /// Parent, grandparent, ... as indices into `zones`
    ancestors: SmallVec<[usize; 4]>,
}

/// Read-only index over all configured zones (active or not)
#[derive(Debug, Clone)]
pub struct GeometryIndex {
    zones: Vec<IndexedZone>,
    by_id: FxHashMap<ZoneId, usize>,
}

impl GeometryIndex {
    /// Build the index, running the cross-zone validation that per-zone
    /// parsing cannot do.
    pub fn new(mut zones: Vec<Zone>) -> Result<Self, ZoneError> {
        if zones.is_empty() {
            return Err(ZoneError::Empty);
        }

        let mut by_id = FxHashMap::default();
        for (idx, zone) in zones.iter_mut().enumerate() {
            // Zero-length edges would read as touching their neighbours
            close_ring(&mut zone.polygon);
            if zone.polygon.len() < 3 {
                return Err(ZoneError::TooFewVertices {
                    zone: zone.id.clone(),
                    found: zone.polygon.len(),
                });
            }
            // Checked before area: a bow-tie can have zero net area
            if let Some((a, b)) = first_self_intersection(&zone.polygon) {
                return Err(ZoneError::SelfIntersecting { zone: zone.id.clone(), a, b });
            }
            if polygon_area(&zone.polygon).abs() < MIN_AREA {
                return Err(ZoneError::Degenerate { zone: zone.id.clone() });
            }
            if by_id.insert(zone.id.clone(), idx).is_some() {
                return Err(ZoneError::DuplicateId(zone.id.clone()));
            }
        }

        let mut indexed = Vec::with_capacity(zones.len());
        for zone in &zones {
            let ancestors = resolve_ancestors(zone, &zones, &by_id)?;
            indexed.push(IndexedZone { aabb: bounding_rect(&zone.polygon), ancestors, zone: zone.clone() });
        }

        Ok(Self { zones: indexed, by_id })
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// All zones in load order
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().map(|z| &z.zone)
    }

    pub fn get(&self, zone_id: &ZoneId) -> Option<&Zone> {
        self.index_of(zone_id).map(|idx| &self.zones[idx].zone)
    }

    pub fn index_of(&self, zone_id: &ZoneId) -> Option<usize> {
        self.by_id.get(zone_id).copied()
    }

    pub(crate) fn zone_at(&self, idx: usize) -> &Zone {
        &self.zones[idx].zone
    }

    pub(crate) fn ancestors_of(&self, idx: usize) -> &[usize] {
        &self.zones[idx].ancestors
    }

    /// Is `point` inside the zone (closed region)?
    ///
    /// # Panics
    /// On an unknown `zone_id`. Zone ids come from the loaded configuration, so
    /// a miss is a programming error.
    pub fn contains(&self, zone_id: &ZoneId, point: Point) -> bool {
        let idx = self
            .index_of(zone_id)
            .unwrap_or_else(|| panic!("containment query for unknown zone '{zone_id}'"));
        self.contains_at(idx, point)
    }

    #[inline]
    pub(crate) fn contains_at(&self, idx: usize, point: Point) -> bool {
        let z = &self.zones[idx];
        let (min_x, min_y, max_x, max_y) = z.aabb;
        if point.x < min_x - ON_EDGE_EPSILON
            || point.x > max_x + ON_EDGE_EPSILON
            || point.y < min_y - ON_EDGE_EPSILON
            || point.y > max_y + ON_EDGE_EPSILON
        {
            return false;
        }
        point_in_polygon(point, &z.zone.polygon)
    }
}

/// Crossing-number test, boundary inclusive
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[j];
        if on_segment(point, a, b) {
            return true;
        }
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let len = (b.x - a.x).hypot(b.y - a.y);
    if len == 0.0 {
        return (p.x - a.x).hypot(p.y - a.y) <= ON_EDGE_EPSILON;
    }
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > ON_EDGE_EPSILON * len {
        return false;
    }
    p.x >= a.x.min(b.x) - ON_EDGE_EPSILON
        && p.x <= a.x.max(b.x) + ON_EDGE_EPSILON
        && p.y >= a.y.min(b.y) - ON_EDGE_EPSILON
        && p.y <= a.y.max(b.y) + ON_EDGE_EPSILON
}

/// Signed shoelace area
fn polygon_area(polygon: &[Point]) -> f64 {
    let n = polygon.len();
    let mut sum = 0.0;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

fn bounding_rect(polygon: &[Point]) -> (f64, f64, f64, f64) {
    polygon.iter().fold(
        (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        |(min_x, min_y, max_x, max_y), p| (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y)),
    )
}

fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn segments_intersect(p1: Point, p2: Point, p3: Point, p4: Point) -> bool {
    let d1 = orientation(p3, p4, p1);
    let d2 = orientation(p3, p4, p2);
    let d3 = orientation(p1, p2, p3);
    let d4 = orientation(p1, p2, p4);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(p1, p3, p4))
        || (d2 == 0.0 && on_segment(p2, p3, p4))
        || (d3 == 0.0 && on_segment(p3, p1, p2))
        || (d4 == 0.0 && on_segment(p4, p1, p2))
}

/// First pair of non-adjacent edges that touch, as edge indices.
/// Edge `i` runs from vertex `i` to vertex `i + 1`.
fn first_self_intersection(polygon: &[Point]) -> Option<(usize, usize)> {
    let n = polygon.len();
    for i in 0..n {
        for j in (i + 2)..n {
            // First and last edge share vertex 0
            if i == 0 && j == n - 1 {
                continue;
            }
            let (a1, a2) = (polygon[i], polygon[(i + 1) % n]);
            let (b1, b2) = (polygon[j], polygon[(j + 1) % n]);
            if segments_intersect(a1, a2, b1, b2) {
                return Some((i, j));
            }
        }
    }
    None
}

fn resolve_ancestors(
    zone: &Zone,
    zones: &[Zone],
    by_id: &FxHashMap<ZoneId, usize>,
) -> Result<SmallVec<[usize; 4]>, ZoneError> {
    let mut ancestors = SmallVec::new();
    let mut current = zone;
    while let Some(parent_id) = &current.parent_id {
        let parent_idx = *by_id.get(parent_id).ok_or_else(|| ZoneError::UnknownParent {
            zone: current.id.clone(),
            parent: parent_id.clone(),
        })?;
        if ancestors.len() >= zones.len() || zones[parent_idx].id == zone.id {
            return Err(ZoneError::ParentCycle(zone.id.clone()));
        }
        ancestors.push(parent_idx);
        current = &zones[parent_idx];
    }
    Ok(ancestors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Zone {
        Zone::new("SQ", &[(100.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0)])
    }

    /// L-shaped (concave) zone with the notch at the top right
    fn ell() -> Zone {
        Zone::new(
            "L",
            &[(0.0, 0.0), (50.0, 0.0), (50.0, 50.0), (100.0, 50.0), (100.0, 100.0), (0.0, 100.0)],
        )
    }

    #[test]
    fn test_square_containment() {
        let index = GeometryIndex::new(vec![square()]).unwrap();
        let id = ZoneId::new("SQ");
        assert!(index.contains(&id, Point::new(150.0, 150.0)));
        assert!(!index.contains(&id, Point::new(50.0, 150.0)));
        assert!(!index.contains(&id, Point::new(150.0, 250.0)));
    }

    #[test]
    fn test_boundary_is_inside() {
        let index = GeometryIndex::new(vec![square()]).unwrap();
        let id = ZoneId::new("SQ");
        // Edges
        assert!(index.contains(&id, Point::new(100.0, 150.0)));
        assert!(index.contains(&id, Point::new(200.0, 150.0)));
        assert!(index.contains(&id, Point::new(150.0, 100.0)));
        assert!(index.contains(&id, Point::new(150.0, 200.0)));
        // Vertices
        assert!(index.contains(&id, Point::new(100.0, 100.0)));
        assert!(index.contains(&id, Point::new(200.0, 200.0)));
        // Just outside
        assert!(!index.contains(&id, Point::new(200.001, 150.0)));
    }

    #[test]
    fn test_concave_polygon() {
        let index = GeometryIndex::new(vec![ell()]).unwrap();
        let id = ZoneId::new("L");
        assert!(index.contains(&id, Point::new(25.0, 25.0)));
        assert!(index.contains(&id, Point::new(75.0, 75.0)));
        // Inside the notch
        assert!(!index.contains(&id, Point::new(75.0, 25.0)));
        // On the inner corner
        assert!(index.contains(&id, Point::new(50.0, 50.0)));
    }

    #[test]
    #[should_panic(expected = "unknown zone")]
    fn test_unknown_zone_panics() {
        let index = GeometryIndex::new(vec![square()]).unwrap();
        index.contains(&ZoneId::new("NOPE"), Point::new(0.0, 0.0));
    }

    #[test]
    fn test_rejects_degenerate_polygon() {
        let line = Zone::new("LINE", &[(0.0, 0.0), (10.0, 10.0), (20.0, 20.0)]);
        assert_eq!(
            GeometryIndex::new(vec![line]).unwrap_err(),
            ZoneError::Degenerate { zone: ZoneId::new("LINE") }
        );
    }

    #[test]
    fn test_rejects_self_intersecting_polygon() {
        let bowtie = Zone::new("BOW", &[(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0)]);
        assert!(matches!(
            GeometryIndex::new(vec![bowtie]),
            Err(ZoneError::SelfIntersecting { .. })
        ));
    }

    #[test]
    fn test_closed_ring_square() {
        let ring = Zone::new(
            "SQ",
            &[(100.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0), (100.0, 100.0)],
        );
        let index = GeometryIndex::new(vec![ring]).unwrap();
        let id = ZoneId::new("SQ");
        assert_eq!(index.get(&id).unwrap().polygon.len(), 4);
        assert!(index.contains(&id, Point::new(150.0, 150.0)));
        assert!(index.contains(&id, Point::new(100.0, 150.0)));
        assert!(!index.contains(&id, Point::new(250.0, 150.0)));
    }

    #[test]
    fn test_repeated_vertex_is_not_an_intersection() {
        let stutter = Zone::new(
            "ST",
            &[(100.0, 100.0), (200.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0)],
        );
        assert!(GeometryIndex::new(vec![stutter]).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        assert_eq!(
            GeometryIndex::new(vec![square(), square()]).unwrap_err(),
            ZoneError::DuplicateId(ZoneId::new("SQ"))
        );
    }

    #[test]
    fn test_parent_resolution() {
        let root = Zone::new("ROOT", &[(0.0, 0.0), (500.0, 0.0), (500.0, 500.0), (0.0, 500.0)]);
        let mid = square().with_parent("ROOT");
        let leaf = Zone::new("LEAF", &[(120.0, 120.0), (140.0, 120.0), (140.0, 140.0)]).with_parent("SQ");
        let index = GeometryIndex::new(vec![root, mid, leaf]).unwrap();

        let leaf_idx = index.index_of(&ZoneId::new("LEAF")).unwrap();
        let ancestors: Vec<&str> =
            index.ancestors_of(leaf_idx).iter().map(|&i| index.zone_at(i).id.as_str()).collect();
        assert_eq!(ancestors, vec!["SQ", "ROOT"]);
    }

    #[test]
    fn test_rejects_unknown_parent() {
        let orphan = square().with_parent("GHOST");
        assert_eq!(
            GeometryIndex::new(vec![orphan]).unwrap_err(),
            ZoneError::UnknownParent { zone: ZoneId::new("SQ"), parent: ZoneId::new("GHOST") }
        );
    }

    #[test]
    fn test_rejects_parent_cycle() {
        let a = Zone::new("A", &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]).with_parent("B");
        let b = Zone::new("B", &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]).with_parent("A");
        assert!(matches!(GeometryIndex::new(vec![a, b]), Err(ZoneError::ParentCycle(_))));

        let selfish = Zone::new("S", &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]).with_parent("S");
        assert!(matches!(GeometryIndex::new(vec![selfish]), Err(ZoneError::ParentCycle(_))));
    }
}
