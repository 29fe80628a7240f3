//! Minimal planar geometry for segmented objects and reference regions
//!
//! Coordinates are `(x, y)` in experiment-wide pixel space, with `y` growing
//! downwards. Only what the in-memory persistence backend and the rasterizer
//! need is implemented here; full GIS semantics live in the persistence layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

/// Axis-aligned bounding box as `(min_x, min_y, max_x, max_y)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

/// Simple polygon given by its exterior ring.
///
/// The ring is implicitly closed; a repeated first vertex at the end is
/// tolerated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Point>,
}

impl Polygon {
    pub fn new(exterior: Vec<Point>) -> Self {
        Self { exterior }
    }

    /// Axis-aligned rectangle with its upper-left corner at `(x, y)`
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(vec![
            Point::new(x, y),
            Point::new(x + width, y),
            Point::new(x + width, y + height),
            Point::new(x, y + height),
        ])
    }

    fn ring(&self) -> &[Point] {
        match (self.exterior.first(), self.exterior.last()) {
            (Some(first), Some(last)) if self.exterior.len() > 1 && first == last => {
                &self.exterior[..self.exterior.len() - 1]
            }
            _ => &self.exterior,
        }
    }

    /// A polygon is empty when it has fewer than three distinct vertices or
    /// encloses no area.
    pub fn is_empty(&self) -> bool {
        self.ring().len() < 3 || self.signed_area().abs() <= f64::EPSILON
    }

    fn signed_area(&self) -> f64 {
        let ring = self.ring();
        let n = ring.len();
        (0..n)
            .map(|i| {
                let (a, b) = (ring[i], ring[(i + 1) % n]);
                a.x * b.y - b.x * a.y
            })
            .sum::<f64>()
            / 2.0
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// Area-weighted centroid; falls back to the vertex mean for degenerate
    /// rings.
    pub fn centroid(&self) -> Option<Point> {
        let ring = self.ring();
        if ring.is_empty() {
            return None;
        }
        let area = self.signed_area();
        if area.abs() <= f64::EPSILON {
            let n = ring.len() as f64;
            let (sx, sy) = ring.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
            return Some(Point::new(sx / n, sy / n));
        }
        let n = ring.len();
        let (mut cx, mut cy) = (0.0, 0.0);
        for i in 0..n {
            let (a, b) = (ring[i], ring[(i + 1) % n]);
            let cross = a.x * b.y - b.x * a.y;
            cx += (a.x + b.x) * cross;
            cy += (a.y + b.y) * cross;
        }
        Some(Point::new(cx / (6.0 * area), cy / (6.0 * area)))
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let ring = self.ring();
        let first = ring.first()?;
        Some(ring.iter().fold(
            Bounds {
                min_x: first.x,
                min_y: first.y,
                max_x: first.x,
                max_y: first.y,
            },
            |b, p| Bounds {
                min_x: b.min_x.min(p.x),
                min_y: b.min_y.min(p.y),
                max_x: b.max_x.max(p.x),
                max_y: b.max_y.max(p.y),
            },
        ))
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.exterior.iter().map(|p| p.translate(dx, dy)).collect())
    }

    /// Even-odd rule point-in-polygon test
    pub fn contains_point(&self, point: &Point) -> bool {
        let ring = self.ring();
        let n = ring.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (ring[i], ring[j]);
            if (a.y > point.y) != (b.y > point.y)
                && point.x < (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let ring = self.ring();
        let n = ring.len();
        (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
    }

    /// True if the two polygons share any point (boundary contact included)
    pub fn intersects(&self, other: &Polygon) -> bool {
        let (Some(a), Some(b)) = (self.bounds(), other.bounds()) else {
            return false;
        };
        if !a.overlaps(&b) {
            return false;
        }
        if self.ring().iter().any(|p| other.contains_point(p))
            || other.ring().iter().any(|p| self.contains_point(p))
        {
            return true;
        }
        self.edges()
            .any(|(p1, p2)| other.edges().any(|(q1, q2)| segments_intersect(p1, p2, q1, q2)))
    }
}

fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_area_and_centroid() {
        let rect = Polygon::rectangle(0.0, 0.0, 4.0, 2.0);
        assert_eq!(rect.area(), 8.0);
        assert_eq!(rect.centroid(), Some(Point::new(2.0, 1.0)));
        assert!(!rect.is_empty());
    }

    #[test]
    fn test_degenerate_polygons_are_empty() {
        assert!(Polygon::default().is_empty());
        let line = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
        ]);
        assert!(line.is_empty());
    }

    #[test]
    fn test_closed_ring_is_tolerated() {
        let closed = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(2.0, 2.0),
            Point::new(0.0, 2.0),
            Point::new(0.0, 0.0),
        ]);
        assert_eq!(closed.area(), 4.0);
    }

    #[test]
    fn test_contains_point() {
        let rect = Polygon::rectangle(0.0, 0.0, 10.0, 10.0);
        assert!(rect.contains_point(&Point::new(5.0, 5.0)));
        assert!(!rect.contains_point(&Point::new(15.0, 5.0)));
    }

    #[test]
    fn test_intersects() {
        let site = Polygon::rectangle(0.0, 0.0, 10.0, 10.0);
        let inside = Polygon::rectangle(2.0, 2.0, 1.0, 1.0);
        let crossing = Polygon::rectangle(8.0, 8.0, 5.0, 5.0);
        let outside = Polygon::rectangle(20.0, 20.0, 1.0, 1.0);
        let cross_shape = Polygon::rectangle(-1.0, 4.0, 12.0, 2.0);

        assert!(site.intersects(&inside));
        assert!(inside.intersects(&site));
        assert!(site.intersects(&crossing));
        assert!(!site.intersects(&outside));
        assert!(site.intersects(&cross_shape));
    }
}
