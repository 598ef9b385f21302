use geo::Coord;
use serde::Serialize;
use std::fmt;

use crate::config::LineComparisonOptions;
use crate::geometry::LocalProjection;
use crate::segments::{LineSegment, SegmentId};

/// Quality thresholds a segment pair satisfies
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct MatchMask(u8);

impl MatchMask {
    pub const BOUNDING_BOX: MatchMask = MatchMask(1);
    pub const DOT_PRODUCT: MatchMask = MatchMask(2);
    pub const DISTANCE: MatchMask = MatchMask(4);
    pub const ALL: MatchMask = MatchMask(7);

    pub fn empty() -> Self {
        MatchMask(0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: MatchMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MatchMask) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for MatchMask {
    type Output = MatchMask;

    fn bitor(self, rhs: MatchMask) -> MatchMask {
        MatchMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for MatchMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::BOUNDING_BOX, "bbox"),
            (Self::DOT_PRODUCT, "dot"),
            (Self::DISTANCE, "distance"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "MatchMask({})", names.join("|"))
    }
}

/// Geometric comparison of two segments
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentComparison {
    /// Cosine of the angle between the segments, signed
    pub dot_product: f64,
    /// Distance from the first segment's midpoint to the second segment's
    /// line along the first segment's normal (meters)
    pub orthogonal_distance: f64,
    pub mid_point_distance: f64,
    pub mask: MatchMask,
}

/// A scored pairing of one route segment with one network segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentMatch {
    pub route_segment: SegmentId,
    pub network_segment: SegmentId,
    pub dot_product: f64,
    pub orthogonal_distance: f64,
    pub mid_point_distance: f64,
    pub mask: MatchMask,
}

impl SegmentMatch {
    pub fn new(route_segment: SegmentId, network_segment: SegmentId, comparison: SegmentComparison) -> Self {
        Self {
            route_segment,
            network_segment,
            dot_product: comparison.dot_product,
            orthogonal_distance: comparison.orthogonal_distance,
            mid_point_distance: comparison.mid_point_distance,
            mask: comparison.mask,
        }
    }

    /// All three quality bits set
    pub fn is_full(&self) -> bool {
        self.mask.contains(MatchMask::ALL)
    }
}

fn cross(a: Coord<f64>, b: Coord<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Distance from `mid` along the normal of `v` to the line through
/// `origin` with direction `w`
fn normal_distance(
    projection: &LocalProjection,
    mid: Coord<f64>,
    v: Coord<f64>,
    lv: f64,
    origin: Coord<f64>,
    w: Coord<f64>,
    lw: f64,
) -> f64 {
    // Solve mid + s * n = origin + t * w for s
    let normal = Coord { x: -v.y, y: v.x };
    let offset = projection.vector(mid, origin);
    let denominator = cross(normal, w);
    if denominator.abs() < 1e-12 * lv * lw {
        // The normal runs along w: zero when it is w's own line
        if cross(offset, w).abs() / lw < 1e-6 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (cross(offset, w) / denominator).abs() * lv
    }
}

/// Compares `a` against `b`.
///
/// Returns `None` unless the search boxes of both segments intersect. All
/// vectors are measured in meters of one projection centred between the two
/// midpoints. The orthogonal distance is the shorter of the two normal
/// projections, so every field is independent of argument order.
pub fn compare_segments(
    a: &LineSegment,
    b: &LineSegment,
    options: &LineComparisonOptions,
) -> Option<SegmentComparison> {
    if !a.search_bounds.intersects(&b.search_bounds) {
        return None;
    }
    let projection = LocalProjection::around(a.midpoint, b.midpoint);
    let va = projection.vector(a.origin, a.destination);
    let vb = projection.vector(b.origin, b.destination);
    let la = va.x.hypot(va.y);
    let lb = vb.x.hypot(vb.y);

    let dot_product = if la == 0.0 || lb == 0.0 {
        0.0
    } else {
        ((va.x * vb.x + va.y * vb.y) / (la * lb)).clamp(-1.0, 1.0)
    };

    let orthogonal_distance = if la == 0.0 || lb == 0.0 {
        f64::INFINITY
    } else {
        let from_a = normal_distance(&projection, a.midpoint, va, la, b.origin, vb, lb);
        let from_b = normal_distance(&projection, b.midpoint, vb, lb, a.origin, va, la);
        from_a.min(from_b)
    };
    let mid_point_distance = projection.distance(a.midpoint, b.midpoint);

    let mut mask = MatchMask::BOUNDING_BOX;
    if dot_product.abs() >= options.min_segment_dot_product() {
        mask.insert(MatchMask::DOT_PRODUCT);
    }
    if orthogonal_distance <= options.max_segment_orthogonal_distance
        && mid_point_distance <= options.max_segment_mid_point_distance
    {
        mask.insert(MatchMask::DISTANCE);
    }

    Some(SegmentComparison {
        dot_product,
        orthogonal_distance,
        mid_point_distance,
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{meters_to_lat_delta, meters_to_lon_delta};
    use crate::segments::SegmentStore;
    use approx::assert_relative_eq;

    const LAT: f64 = 50.85;
    const LON: f64 = 4.35;

    fn at(east: f64, north: f64) -> Coord<f64> {
        Coord {
            x: LON + meters_to_lon_delta(east, LAT),
            y: LAT + meters_to_lat_delta(north),
        }
    }

    fn segment(store: &mut SegmentStore, name: &str, from: (f64, f64), to: (f64, f64)) -> LineSegment {
        let id = store
            .create_route_container(name, &[at(from.0, from.1), at(to.0, to.1)])
            .unwrap();
        store.segments_of(id)[0].clone()
    }

    #[test]
    fn test_parallel_offset_segments() {
        let options = LineComparisonOptions::default();
        let mut store = SegmentStore::new(100.0, options.bounding_box_size);
        let a = segment(&mut store, "a", (0.0, 0.0), (10.0, 0.0));
        let b = segment(&mut store, "b", (0.0, 2.0), (10.0, 2.0));
        let m = compare_segments(&a, &b, &options).unwrap();
        assert_relative_eq!(m.dot_product, 1.0, epsilon = 1e-9);
        assert_relative_eq!(m.orthogonal_distance, 2.0, epsilon = 1e-3);
        assert_relative_eq!(m.mid_point_distance, 2.0, epsilon = 1e-3);
        assert_eq!(m.mask, MatchMask::ALL);
    }

    #[test]
    fn test_opposite_direction_keeps_dot_bit() {
        let options = LineComparisonOptions::default();
        let mut store = SegmentStore::new(100.0, options.bounding_box_size);
        let a = segment(&mut store, "a", (0.0, 0.0), (10.0, 0.0));
        let b = segment(&mut store, "b", (10.0, 1.0), (0.0, 1.0));
        let m = compare_segments(&a, &b, &options).unwrap();
        assert_relative_eq!(m.dot_product, -1.0, epsilon = 1e-9);
        assert!(m.mask.contains(MatchMask::DOT_PRODUCT));
    }

    #[test]
    fn test_perpendicular_and_far_segments() {
        let options = LineComparisonOptions::default();
        let mut store = SegmentStore::new(100.0, options.bounding_box_size);
        let a = segment(&mut store, "a", (0.0, 0.0), (10.0, 0.0));
        let cross = segment(&mut store, "c", (5.0, -5.0), (5.0, 5.0));
        let m = compare_segments(&a, &cross, &options).unwrap();
        assert_relative_eq!(m.dot_product, 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.orthogonal_distance, 0.0, epsilon = 1e-6);
        assert!(!m.mask.contains(MatchMask::DOT_PRODUCT));
        assert!(m.mask.contains(MatchMask::DISTANCE));

        let far = segment(&mut store, "f", (0.0, 100.0), (10.0, 100.0));
        assert!(compare_segments(&a, &far, &options).is_none());

        let offset = segment(&mut store, "o", (0.0, 15.0), (10.0, 15.0));
        let m = compare_segments(&a, &offset, &options).unwrap();
        assert_eq!(m.mask, MatchMask::BOUNDING_BOX | MatchMask::DOT_PRODUCT);
    }

    #[test]
    fn test_comparison_is_symmetric() {
        let options = LineComparisonOptions::default();
        let mut store = SegmentStore::new(100.0, options.bounding_box_size);
        let a = segment(&mut store, "a", (0.0, 0.0), (10.0, 1.0));
        let b = segment(&mut store, "b", (2.0, 3.0), (11.0, 4.5));
        let ab = compare_segments(&a, &b, &options).unwrap();
        let ba = compare_segments(&b, &a, &options).unwrap();
        assert_relative_eq!(ab.dot_product, ba.dot_product, epsilon = 1e-12);
        assert_relative_eq!(ab.mid_point_distance, ba.mid_point_distance, epsilon = 1e-9);
        assert_relative_eq!(ab.orthogonal_distance, ba.orthogonal_distance, epsilon = 1e-9);
        assert_eq!(ab.mask, ba.mask);
    }

    #[test]
    fn test_diverging_segments_use_shorter_normal() {
        let options = LineComparisonOptions::default();
        let mut store = SegmentStore::new(100.0, options.bounding_box_size);
        let a = segment(&mut store, "a", (0.0, 0.0), (10.0, 0.0));
        let b = segment(&mut store, "b", (0.0, 3.0), (10.0, 6.0));
        let ab = compare_segments(&a, &b, &options).unwrap();
        let ba = compare_segments(&b, &a, &options).unwrap();
        // a's normal meets b at 4.5 m, b's normal meets a after about 4.7 m
        assert_relative_eq!(ab.orthogonal_distance, 4.5, epsilon = 1e-2);
        assert_relative_eq!(ba.orthogonal_distance, ab.orthogonal_distance, epsilon = 1e-9);
    }
}
