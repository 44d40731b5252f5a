//! Region-of-interest geometry.
//!
//! Zones are simple polygons given as an ordered vertex list. Membership uses
//! the even-odd ray casting rule with half-open edge intervals, so a point on
//! a shared edge belongs to exactly one of two adjacent zones.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Why a polygon cannot be evaluated
#[derive(Error, Debug, PartialEq)]
pub enum GeometryError {
    #[error("Polygon needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),

    #[error("Polygon vertex {0} is not finite")]
    NonFiniteVertex(usize),

    #[error("Polygon has zero area")]
    ZeroArea,
}

/// A configured zone of an analytics job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiZone {
    pub id: String,
    pub name: String,
    pub polygon: Vec<Point>,
    #[serde(default = "default_true")]
    pub alert_on_entry: bool,
    #[serde(default)]
    pub alert_on_exit: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl RoiZone {
    /// Membership test. Malformed polygons never match and are logged.
    pub fn contains(&self, point: Point) -> bool {
        match point_in_polygon(point, &self.polygon) {
            Ok(inside) => inside,
            Err(e) => {
                warn!(zone_id = %self.id, zone = %self.name, error = %e, "Ignoring malformed zone polygon");
                metrics::counter!("vigil.roi.invalid_polygons").increment(1);
                false
            }
        }
    }
}

pub fn validate_polygon(polygon: &[Point]) -> Result<(), GeometryError> {
    if polygon.len() < 3 {
        return Err(GeometryError::TooFewVertices(polygon.len()));
    }
    if let Some(index) = polygon
        .iter()
        .position(|p| !p.x.is_finite() || !p.y.is_finite())
    {
        return Err(GeometryError::NonFiniteVertex(index));
    }
    if signed_area(polygon) == 0.0 {
        return Err(GeometryError::ZeroArea);
    }
    Ok(())
}

/// Shoelace formula
fn signed_area(polygon: &[Point]) -> f64 {
    let n = polygon.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let (a, b) = (polygon[i], polygon[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice / 2.0
}

/// Ray casting towards +x. An edge counts when the point's y lies in
/// `(min_y, max_y]` of the edge and the point is at or left of the crossing.
/// Points on a top or right boundary are inside; bottom and left are not.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> Result<bool, GeometryError> {
    validate_polygon(polygon)?;

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[j], polygon[i]);
        let spans = point.y > pi.y.min(pj.y) && point.y <= pi.y.max(pj.y);
        if spans && point.x <= pi.x.max(pj.x) {
            let x_cross = (point.y - pi.y) * (pj.x - pi.x) / (pj.y - pi.y) + pi.x;
            if point.x <= x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    Ok(inside)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point> {
        vec![
            Point::new(1.0, 1.0),
            Point::new(5.0, 1.0),
            Point::new(5.0, 5.0),
            Point::new(1.0, 5.0),
        ]
    }

    fn zone(polygon: Vec<Point>) -> RoiZone {
        RoiZone {
            id: "zone-1".to_string(),
            name: "Loading dock".to_string(),
            polygon,
            alert_on_entry: true,
            alert_on_exit: false,
            is_active: true,
        }
    }

    #[test]
    fn test_interior_and_exterior_points() {
        assert_eq!(point_in_polygon(Point::new(3.0, 3.0), &square()), Ok(true));
        assert_eq!(point_in_polygon(Point::new(0.0, 0.0), &square()), Ok(false));
        assert_eq!(point_in_polygon(Point::new(6.0, 3.0), &square()), Ok(false));
    }

    #[test]
    fn test_boundary_points_follow_upper_right_rule() {
        let cases = [
            ((1.0, 1.0), false),
            ((5.0, 5.0), true),
            ((5.0, 3.0), true),
            ((1.0, 3.0), false),
            ((3.0, 5.0), true),
            ((3.0, 1.0), false),
        ];
        for ((x, y), expected) in cases {
            assert_eq!(
                point_in_polygon(Point::new(x, y), &square()),
                Ok(expected),
                "point ({x}, {y})"
            );
        }
    }

    #[test]
    fn test_concave_polygon() {
        // U shape opening upwards
        let polygon = vec![
            Point::new(0.0, 0.0),
            Point::new(6.0, 0.0),
            Point::new(6.0, 6.0),
            Point::new(4.0, 6.0),
            Point::new(4.0, 2.0),
            Point::new(2.0, 2.0),
            Point::new(2.0, 6.0),
            Point::new(0.0, 6.0),
        ];
        assert_eq!(point_in_polygon(Point::new(1.0, 4.0), &polygon), Ok(true));
        assert_eq!(point_in_polygon(Point::new(3.0, 4.0), &polygon), Ok(false));
        assert_eq!(point_in_polygon(Point::new(3.0, 1.0), &polygon), Ok(true));
    }

    #[test]
    fn test_malformed_polygons() {
        let two = vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)];
        assert_eq!(
            point_in_polygon(Point::new(0.5, 0.5), &two),
            Err(GeometryError::TooFewVertices(2))
        );

        let collinear = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
        ];
        assert_eq!(validate_polygon(&collinear), Err(GeometryError::ZeroArea));

        let mut nan = square();
        nan[2].x = f64::NAN;
        assert_eq!(validate_polygon(&nan), Err(GeometryError::NonFiniteVertex(2)));
    }

    #[test]
    fn test_zone_treats_malformed_polygon_as_outside() {
        let degenerate = zone(vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0)]);
        assert!(!degenerate.contains(Point::new(0.5, 0.0)));
        assert!(zone(square()).contains(Point::new(2.0, 2.0)));
    }

    #[test]
    fn test_zone_deserializes_with_defaults() {
        let zone: RoiZone = serde_json::from_str(
            r#"{"id":"z","name":"Gate","polygon":[{"x":0,"y":0},{"x":1,"y":0},{"x":0,"y":1}]}"#,
        )
        .unwrap();
        assert!(zone.alert_on_entry);
        assert!(!zone.alert_on_exit);
        assert!(zone.is_active);
        assert_eq!(zone.polygon.len(), 3);
    }
}
