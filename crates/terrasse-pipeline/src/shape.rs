//! Shape measurements shared by the vectorizer, classifier and exporter.
//!
//! Measurements are always taken from the geometry passed in, never
//! cached alongside it, so they stay correct after every simplify,
//! buffer or reprojection step.

use std::f64::consts::PI;

use geo::{Area, Euclidean, Length, LineString, Polygon};
use serde::{Deserialize, Serialize};

/// Length of a ring or open line string.
#[must_use]
pub fn ring_length(ring: &LineString<f64>) -> f64 {
    Euclidean.length(ring)
}

/// Perimeter of a polygon: exterior plus every hole.
#[must_use]
pub fn perimeter(polygon: &Polygon<f64>) -> f64 {
    ring_length(polygon.exterior()) + polygon.interiors().iter().map(ring_length).sum::<f64>()
}

/// Compactness score `P / (2 * sqrt(pi * A))`: 1.0 for a circle, larger
/// for elongated or ragged shapes. Zero-area shapes score 1.0.
#[must_use]
pub fn compactness(area: f64, perimeter: f64) -> f64 {
    if area > 0.0 {
        perimeter / (2.0 * (PI * area).sqrt())
    } else {
        1.0
    }
}

/// `P / sqrt(A)`, the sliver indicator. `None` for zero-area shapes.
#[must_use]
pub fn sliver_ratio(area: f64, perimeter: f64) -> Option<f64> {
    (area > 0.0).then(|| perimeter / area.sqrt())
}

/// Area, perimeter and compactness of one polygon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapeMetrics {
    /// Unsigned area.
    pub area: f64,
    /// Exterior plus hole lengths.
    pub perimeter: f64,
    /// See [`compactness`].
    pub compactness: f64,
}

impl ShapeMetrics {
    /// Measure `polygon`.
    #[must_use]
    pub fn of(polygon: &Polygon<f64>) -> Self {
        let area = polygon.unsigned_area();
        let perimeter = perimeter(polygon);
        Self {
            area,
            perimeter,
            compactness: compactness(area, perimeter),
        }
    }

    /// See [`sliver_ratio`].
    #[must_use]
    pub fn sliver_ratio(&self) -> Option<f64> {
        sliver_ratio(self.area, self.perimeter)
    }
}

#[cfg(test)]
mod tests {
    use geo::{Rect, coord};

    use super::*;

    fn rect(w: f64, h: f64) -> Polygon<f64> {
        Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: w, y: h }).to_polygon()
    }

    #[test]
    fn square_metrics() {
        let m = ShapeMetrics::of(&rect(10.0, 10.0));
        assert!((m.area - 100.0).abs() < 1e-9);
        assert!((m.perimeter - 40.0).abs() < 1e-9);
        let expected = 40.0 / (2.0 * (PI * 100.0).sqrt());
        assert!((m.compactness - expected).abs() < 1e-12);
    }

    #[test]
    fn open_line_length_has_no_closing_segment() {
        let line = LineString::from(vec![(0.0, 0.0), (3.0, 4.0), (3.0, 10.0)]);
        assert!((ring_length(&line) - 11.0).abs() < 1e-12);
    }

    #[test]
    fn perimeter_includes_holes() {
        let hole = rect(2.0, 2.0).exterior().clone();
        let hole = LineString::from(
            hole.coords()
                .map(|c| (c.x + 4.0, c.y + 4.0))
                .collect::<Vec<_>>(),
        );
        let p = Polygon::new(rect(10.0, 10.0).exterior().clone(), vec![hole]);
        assert!((perimeter(&p) - 48.0).abs() < 1e-9);
    }

    #[test]
    fn circle_like_polygon_scores_near_one() {
        let n = 720;
        let coords: Vec<(f64, f64)> = (0..=n)
            .map(|i| {
                let t = f64::from(i) / f64::from(n) * 2.0 * PI;
                (10.0 * t.cos(), 10.0 * t.sin())
            })
            .collect();
        let m = ShapeMetrics::of(&Polygon::new(LineString::from(coords), vec![]));
        assert!((m.compactness - 1.0).abs() < 1e-3, "{}", m.compactness);
    }

    #[test]
    fn elongated_strip_scores_high() {
        let m = ShapeMetrics::of(&rect(100.0, 1.0));
        assert!(m.compactness > 5.0);
    }

    #[test]
    fn zero_area_defaults() {
        assert!((compactness(0.0, 12.0) - 1.0).abs() < f64::EPSILON);
        assert_eq!(sliver_ratio(0.0, 12.0), None);
    }

    #[test]
    fn sliver_ratio_of_square() {
        let m = ShapeMetrics::of(&rect(4.0, 4.0));
        assert_eq!(m.sliver_ratio(), Some(4.0));
    }
}
