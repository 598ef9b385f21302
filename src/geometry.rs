use geo::{Coord, Intersects, Rect};
use serde::{Deserialize, Serialize};

/// Length of one degree of latitude (and of longitude at the equator) in meters
pub const METERS_PER_DEGREE: f64 = 111_319.49;

/// Shrink factor of a longitude degree at the given latitude
pub fn latitude_factor(lat: f64) -> f64 {
    lat.to_radians().cos().max(1e-9)
}

pub fn meters_to_lat_delta(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

pub fn meters_to_lon_delta(meters: f64, lat: f64) -> f64 {
    meters / (METERS_PER_DEGREE * latitude_factor(lat))
}

/// Planar distance in meters, x corrected at the mean latitude of both points
pub fn distance_meters(a: Coord<f64>, b: Coord<f64>) -> f64 {
    LocalProjection::around(a, b).distance(a, b)
}

/// Equirectangular projection around a reference latitude.
///
/// Every conversion between coordinate deltas and meters goes through this
/// type so both sides of a comparison share one correction factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    lat_factor: f64,
}

impl LocalProjection {
    pub fn at_latitude(lat: f64) -> Self {
        Self {
            lat_factor: latitude_factor(lat),
        }
    }

    pub fn around(a: Coord<f64>, b: Coord<f64>) -> Self {
        Self::at_latitude((a.y + b.y) / 2.0)
    }

    /// Vector from `from` to `to` in meters
    pub fn vector(&self, from: Coord<f64>, to: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (to.x - from.x) * self.lat_factor * METERS_PER_DEGREE,
            y: (to.y - from.y) * METERS_PER_DEGREE,
        }
    }

    pub fn distance(&self, a: Coord<f64>, b: Coord<f64>) -> f64 {
        let v = self.vector(a, b);
        v.x.hypot(v.y)
    }

    /// How much longer an east-west span measured in this projection comes
    /// out than on the ground at `lat`
    pub fn stretch_at(&self, lat: f64) -> f64 {
        self.lat_factor / latitude_factor(lat)
    }

    pub fn to_local(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: c.x * self.lat_factor * METERS_PER_DEGREE,
            y: c.y * METERS_PER_DEGREE,
        }
    }

    pub fn from_local(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: c.x / (self.lat_factor * METERS_PER_DEGREE),
            y: c.y / METERS_PER_DEGREE,
        }
    }
}

/// Projection of a point onto the segment `a`-`b`
#[derive(Debug, Clone, Copy)]
pub struct SegmentProjection {
    /// Position along the segment, clamped to [0, 1]
    pub t: f64,
    pub point: Coord<f64>,
    pub distance: f64,
}

pub fn project_onto_segment(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> SegmentProjection {
    let projection = LocalProjection::around(a, b);
    let ab = projection.vector(a, b);
    let ap = projection.vector(a, p);
    let len2 = ab.x * ab.x + ab.y * ab.y;
    let t = if len2 == 0.0 {
        0.0
    } else {
        ((ap.x * ab.x + ap.y * ab.y) / len2).clamp(0.0, 1.0)
    };
    let point = Coord {
        x: a.x + (b.x - a.x) * t,
        y: a.y + (b.y - a.y) * t,
    };
    SegmentProjection {
        t,
        point,
        distance: projection.distance(p, point),
    }
}

/// Axis-aligned bounding box in lon/lat degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    rect: Rect<f64>,
}

impl Region {
    pub fn new(a: Coord<f64>, b: Coord<f64>) -> Self {
        Self { rect: Rect::new(a, b) }
    }

    pub fn around(c: Coord<f64>) -> Self {
        Self::new(c, c)
    }

    pub fn from_coords<I: IntoIterator<Item = Coord<f64>>>(coords: I) -> Option<Self> {
        let mut iter = coords.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::around(first), |region, c| region.extend(c)))
    }

    pub fn min(&self) -> Coord<f64> {
        self.rect.min()
    }

    pub fn max(&self) -> Coord<f64> {
        self.rect.max()
    }

    pub fn width(&self) -> f64 {
        self.rect.width()
    }

    pub fn height(&self) -> f64 {
        self.rect.height()
    }

    pub fn rect(&self) -> Rect<f64> {
        self.rect
    }

    pub fn centroid(&self) -> Coord<f64> {
        self.rect.center()
    }

    /// Moves every edge inwards by (`dx`, `dy`); negative values expand.
    /// A box inset past its center collapses to the center.
    pub fn inset(&self, dx: f64, dy: f64) -> Self {
        let c = self.centroid();
        let min = self.min();
        let max = self.max();
        let (min_x, max_x) = if max.x - min.x < 2.0 * dx {
            (c.x, c.x)
        } else {
            (min.x + dx, max.x - dx)
        };
        let (min_y, max_y) = if max.y - min.y < 2.0 * dy {
            (c.y, c.y)
        } else {
            (min.y + dy, max.y - dy)
        };
        Self::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
    }

    /// Expands the box by `meters` on every side, converted at the box's latitude
    pub fn buffered(&self, meters: f64) -> Self {
        let lat = self.centroid().y;
        self.inset(-meters_to_lon_delta(meters, lat), -meters_to_lat_delta(meters))
    }

    pub fn extend(&self, c: Coord<f64>) -> Self {
        self.union(&Self::around(c))
    }

    pub fn union(&self, other: &Region) -> Self {
        let (a, b) = (self.min(), other.min());
        let (c, d) = (self.max(), other.max());
        Self::new(
            Coord {
                x: a.x.min(b.x),
                y: a.y.min(b.y),
            },
            Coord {
                x: c.x.max(d.x),
                y: c.y.max(d.y),
            },
        )
    }

    pub fn intersection(&self, other: &Region) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        let (a, b) = (self.min(), other.min());
        let (c, d) = (self.max(), other.max());
        Some(Self::new(
            Coord {
                x: a.x.max(b.x),
                y: a.y.max(b.y),
            },
            Coord {
                x: c.x.min(d.x),
                y: c.y.min(d.y),
            },
        ))
    }

    /// Closed-interval overlap test (touching boxes intersect)
    pub fn intersects(&self, other: &Region) -> bool {
        self.rect.intersects(&other.rect)
    }

    pub fn contains(&self, c: Coord<f64>) -> bool {
        self.rect.intersects(&c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn c(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    #[test]
    fn test_meter_conversions_round_trip_distance() {
        let origin = c(4.35, 50.85);
        let east = c(origin.x + meters_to_lon_delta(100.0, origin.y), origin.y);
        let north = c(origin.x, origin.y + meters_to_lat_delta(100.0));
        assert_relative_eq!(distance_meters(origin, east), 100.0, epsilon = 1e-6);
        assert_relative_eq!(distance_meters(origin, north), 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_region_inset_expand_and_collapse() {
        let r = Region::new(c(0.0, 0.0), c(2.0, 4.0));
        let grown = r.inset(-1.0, -1.0);
        assert_eq!(grown.min(), c(-1.0, -1.0));
        assert_eq!(grown.max(), c(3.0, 5.0));

        let collapsed = r.inset(1.5, 1.0);
        assert_eq!(collapsed.min().x, 1.0);
        assert_eq!(collapsed.max().x, 1.0);
        assert_eq!(collapsed.min().y, 1.0);
        assert_eq!(collapsed.max().y, 3.0);
    }

    #[test]
    fn test_region_union_intersection_contains() {
        let a = Region::new(c(0.0, 0.0), c(2.0, 2.0));
        let b = Region::new(c(1.0, 1.0), c(3.0, 3.0));
        let far = Region::new(c(5.0, 5.0), c(6.0, 6.0));

        let u = a.union(&b);
        assert_eq!(u.min(), c(0.0, 0.0));
        assert_eq!(u.max(), c(3.0, 3.0));

        let i = a.intersection(&b).unwrap();
        assert_eq!(i.min(), c(1.0, 1.0));
        assert_eq!(i.max(), c(2.0, 2.0));
        assert!(a.intersection(&far).is_none());

        assert!(a.contains(c(2.0, 2.0)));
        assert!(!a.contains(c(2.1, 2.0)));
        assert_eq!(a.centroid(), c(1.0, 1.0));
    }

    #[test]
    fn test_projection_onto_segment_clamps() {
        let a = c(0.0, 0.0);
        let b = c(0.001, 0.0);
        let mid = project_onto_segment(c(0.0005, 0.0001), a, b);
        assert_relative_eq!(mid.t, 0.5, epsilon = 1e-9);
        assert_relative_eq!(mid.distance, 0.0001 * METERS_PER_DEGREE, epsilon = 1e-6);

        let before = project_onto_segment(c(-0.001, 0.0), a, b);
        assert_eq!(before.t, 0.0);
        assert_eq!(before.point, a);
    }
}
