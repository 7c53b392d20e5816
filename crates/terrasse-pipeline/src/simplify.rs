//! Ring simplification with [`geo::Simplify`] (Ramer-Douglas-Peucker).
//!
//! A closed ring starts and ends on the same vertex, so the first split
//! falls on the vertex farthest from it. A ring that would collapse
//! (fewer than three distinct vertices, or zero area) keeps its original
//! vertices when it is a shell and is dropped when it is a hole.
//!
//! Used twice: lightly on traced tile polygons and more coarsely at
//! export.

use geo::{Area, LineString, MultiPolygon, Polygon, Simplify};

/// Simplify a closed ring. Returns `None` when the simplified ring would
/// collapse.
///
/// A tolerance of 0.0 preserves every vertex.
#[must_use = "returns the simplified ring"]
pub fn simplify_ring(ring: &LineString<f64>, tolerance: f64) -> Option<LineString<f64>> {
    let mut ring = ring.clone();
    ring.close();
    if ring.0.len() < 4 {
        return None;
    }
    let simplified = Polygon::new(ring.simplify(tolerance), vec![]);
    (simplified.exterior().0.len() >= 4 && simplified.unsigned_area() > 0.0)
        .then(|| simplified.into_inner().0)
}

/// Simplify every ring of a polygon.
///
/// A collapsing shell keeps its original vertices; collapsing holes are
/// dropped.
#[must_use = "returns the simplified polygon"]
pub fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    let exterior = simplify_ring(polygon.exterior(), tolerance)
        .unwrap_or_else(|| polygon.exterior().clone());
    let interiors = polygon
        .interiors()
        .iter()
        .filter_map(|hole| simplify_ring(hole, tolerance))
        .collect();
    Polygon::new(exterior, interiors)
}

/// Simplify every member of a multi-polygon.
#[must_use = "returns the simplified polygons"]
pub fn simplify_polygons(polygons: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
    polygons
        .iter()
        .map(|p| simplify_polygon(p, tolerance))
        .collect()
}
