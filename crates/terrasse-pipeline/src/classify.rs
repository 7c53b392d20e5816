//! Terrace / wall classification of merged polygons.
//!
//! The decision is compactness only: `gc > compactness_cutoff` is a
//! terrace, anything else a wall. Before that, empty or invalid geometry
//! and slivers (`P / sqrt(A) > sliver_cutoff`, typical of tile seams) are
//! labelled wall outright.
//!
//! A perpendicular elevation probe across the polygon's principal axis is
//! still taken and stored as `elevation_delta`, but it does not influence
//! the label.

use geo::{Coord, HasDimensions, MinimumRotatedRect, Polygon, Rect, Validation};
use serde::{Deserialize, Serialize};

use crate::diagnostics::ClassCounts;
use crate::grid::{GridReader, is_missing};
use crate::shape::ShapeMetrics;
use crate::types::{Classification, PipelineConfig, Window};

/// Fractions along the principal axis where probes are taken.
const PROBE_STATIONS: [f64; 3] = [0.25, 0.5, 0.75];

/// Point reads from an elevation grid with plausibility filtering.
#[derive(Debug)]
pub struct ElevationSampler<R> {
    reader: R,
    bounds: Rect<f64>,
    min_elevation: f64,
    max_elevation: f64,
}

impl<R: GridReader<f32>> ElevationSampler<R> {
    /// Wrap `reader`, taking the plausible range from `config`.
    pub fn new(reader: R, config: &PipelineConfig) -> Self {
        let bounds = reader.meta().bounds();
        Self {
            reader,
            bounds,
            min_elevation: config.min_elevation,
            max_elevation: config.max_elevation,
        }
    }

    /// Elevation at a world coordinate.
    ///
    /// `None` when the point is outside the grid, the sample is no-data or
    /// NaN, the sample is outside the plausible range, or the read fails.
    pub fn sample(&mut self, at: Coord<f64>) -> Option<f64> {
        let (min, max) = (self.bounds.min(), self.bounds.max());
        if at.x < min.x || at.x > max.x || at.y < min.y || at.y > max.y {
            return None;
        }
        let meta = self.reader.meta();
        let (col, row) = meta.transform.invert(at)?;
        let (col, row) = (col.floor(), row.floor());
        if col < 0.0 || row < 0.0 || col >= f64::from(meta.width) || row >= f64::from(meta.height) {
            return None;
        }
        let nodata = meta.nodata;

        #[allow(clippy::cast_possible_truncation)]
        let window = Window::new(col as i64, row as i64, 1, 1);
        let block = match self.reader.read_window(window, f32::NAN) {
            Ok(block) => block,
            Err(e) => {
                log::debug!("elevation read at {at:?} failed: {e}");
                return None;
            }
        };
        let raw = block.get_pixel(0, 0)[0];
        if is_missing(raw, nodata) {
            return None;
        }
        let value = f64::from(raw);
        (self.min_elevation..=self.max_elevation)
            .contains(&value)
            .then_some(value)
    }
}

/// How a polygon reached its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifyOutcome {
    /// Decided by compactness.
    Classified,
    /// Rejected by the sliver rule.
    Sliver,
    /// The bounding rectangle had no usable axis.
    Degenerate,
    /// Empty or invalid geometry.
    Error,
}

/// Classification of one polygon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolygonClass {
    /// Label.
    pub class: Classification,
    /// Path that produced the label.
    pub outcome: ClassifyOutcome,
    /// Measurements of the classified geometry.
    pub metrics: ShapeMetrics,
    /// Median absolute elevation difference across the axis, 0 when no
    /// station had two valid readings.
    pub elevation_delta: f64,
    /// Stations that contributed to `elevation_delta`.
    pub probe_stations: usize,
}

impl PolygonClass {
    const fn wall(outcome: ClassifyOutcome, metrics: ShapeMetrics) -> Self {
        Self {
            class: Classification::Wall,
            outcome,
            metrics,
            elevation_delta: 0.0,
            probe_stations: 0,
        }
    }
}

impl ClassCounts {
    /// Tally one classified polygon.
    pub const fn record(&mut self, class: &PolygonClass) {
        match class.class {
            Classification::Terrace => self.terrace += 1,
            Classification::Wall => self.wall += 1,
        }
        match class.outcome {
            ClassifyOutcome::Sliver => self.sliver += 1,
            ClassifyOutcome::Error => self.error += 1,
            ClassifyOutcome::Classified | ClassifyOutcome::Degenerate => {}
        }
    }
}

/// Label for a compactness score. Exactly at the cutoff is a wall.
#[must_use]
pub fn label_for(compactness: f64, cutoff: f64) -> Classification {
    if compactness > cutoff {
        Classification::Terrace
    } else {
        Classification::Wall
    }
}

/// Principal axis of a polygon: the longer edge of its minimum-area
/// bounding rectangle, as `(start, end)`.
#[must_use]
pub fn principal_axis(polygon: &Polygon<f64>) -> Option<(Coord<f64>, Coord<f64>)> {
    let rect = polygon.minimum_rotated_rect()?;
    let c = &rect.exterior().0;
    if c.len() < 3 {
        return None;
    }
    let len = |a: Coord<f64>, b: Coord<f64>| (b.x - a.x).hypot(b.y - a.y);
    let axis = if len(c[0], c[1]) >= len(c[1], c[2]) {
        (c[0], c[1])
    } else {
        (c[1], c[2])
    };
    (len(axis.0, axis.1) > 0.0).then_some(axis)
}

/// Median absolute elevation difference across `axis` at the probe
/// stations, and the number of stations that contributed.
pub fn probe_delta<R: GridReader<f32>>(
    sampler: &mut ElevationSampler<R>,
    axis: (Coord<f64>, Coord<f64>),
    distance: f64,
) -> (f64, usize) {
    let (start, end) = axis;
    let (dx, dy) = (end.x - start.x, end.y - start.y);
    let length = dx.hypot(dy);
    if length == 0.0 {
        return (0.0, 0);
    }
    let (px, py) = (-dy / length, dx / length);

    let mut deltas: Vec<f64> = PROBE_STATIONS
        .iter()
        .filter_map(|&t| {
            let station = Coord {
                x: dx.mul_add(t, start.x),
                y: dy.mul_add(t, start.y),
            };
            let a = sampler.sample(Coord {
                x: px.mul_add(distance, station.x),
                y: py.mul_add(distance, station.y),
            })?;
            let b = sampler.sample(Coord {
                x: px.mul_add(-distance, station.x),
                y: py.mul_add(-distance, station.y),
            })?;
            Some((a - b).abs())
        })
        .collect();
    if deltas.is_empty() {
        return (0.0, 0);
    }
    deltas.sort_by(f64::total_cmp);
    (deltas[deltas.len() / 2], deltas.len())
}

/// Classify one polygon in the working CRS.
///
/// `sampler` is optional; without it the elevation delta stays 0.
pub fn classify_polygon<R: GridReader<f32>>(
    polygon: &Polygon<f64>,
    sampler: Option<&mut ElevationSampler<R>>,
    config: &PipelineConfig,
) -> PolygonClass {
    let metrics = ShapeMetrics::of(polygon);
    if polygon.is_empty() || !polygon.is_valid() {
        return PolygonClass::wall(ClassifyOutcome::Error, metrics);
    }
    if metrics
        .sliver_ratio()
        .is_some_and(|ratio| ratio > config.sliver_cutoff)
    {
        return PolygonClass::wall(ClassifyOutcome::Sliver, metrics);
    }
    let Some(axis) = principal_axis(polygon) else {
        return PolygonClass::wall(ClassifyOutcome::Degenerate, metrics);
    };

    let (elevation_delta, probe_stations) = sampler.map_or((0.0, 0), |sampler| {
        probe_delta(sampler, axis, config.probe_distance)
    });

    PolygonClass {
        class: label_for(metrics.compactness, config.compactness_cutoff),
        outcome: ClassifyOutcome::Classified,
        metrics,
        elevation_delta,
        probe_stations,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::coord;

    use super::*;
    use crate::grid::MemoryGrid;
    use crate::types::{Crs, GeoTransform, GridMeta};

    fn rect(x: f64, y: f64, w: f64, h: f64) -> Polygon<f64> {
        Rect::new(coord! { x: x, y: y }, coord! { x: x + w, y: y + h }).to_polygon()
    }

    /// 200 x 40 m grid, 1 m pixels, origin (0, 40). Elevation 110 north of
    /// y = 20, 100 south of it.
    fn step_grid() -> MemoryGrid<f32> {
        let meta = GridMeta {
            width: 200,
            height: 40,
            transform: GeoTransform::north_up(0.0, 40.0, 1.0, 1.0),
            crs: Crs::LAMBERT_93,
            nodata: Some(-9999.0),
        };
        MemoryGrid::from_fn(meta, |_, row| if row < 20 { 110.0 } else { 100.0 })
    }

    type NoSampler = ElevationSampler<MemoryGrid<f32>>;

    #[test]
    fn elongated_strip_is_terrace() {
        let strip = rect(10.0, 19.5, 80.0, 1.0);
        let class = classify_polygon::<MemoryGrid<f32>>(&strip, None, &PipelineConfig::default());
        assert_eq!(class.outcome, ClassifyOutcome::Classified);
        assert_eq!(class.class, Classification::Terrace);
        assert!(class.metrics.compactness > 5.0);
    }

    #[test]
    fn compact_square_is_wall() {
        let square = rect(0.0, 0.0, 10.0, 10.0);
        let class = classify_polygon::<MemoryGrid<f32>>(&square, None, &PipelineConfig::default());
        assert_eq!(class.outcome, ClassifyOutcome::Classified);
        assert_eq!(class.class, Classification::Wall);
    }

    #[test]
    fn sliver_is_wall_regardless_of_compactness() {
        let sliver = rect(0.0, 0.0, 120.0, 1.0);
        let class = classify_polygon::<MemoryGrid<f32>>(&sliver, None, &PipelineConfig::default());
        assert!(class.metrics.compactness > 5.0);
        assert!(class.metrics.sliver_ratio().unwrap() > 20.0);
        assert_eq!(class.outcome, ClassifyOutcome::Sliver);
        assert_eq!(class.class, Classification::Wall);
        assert!(class.elevation_delta.abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_geometry_is_error_wall() {
        let bow_tie = Polygon::new(
            vec![(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0), (0.0, 0.0)].into(),
            vec![],
        );
        let class = classify_polygon::<MemoryGrid<f32>>(&bow_tie, None, &PipelineConfig::default());
        assert_eq!(class.outcome, ClassifyOutcome::Error);
        assert_eq!(class.class, Classification::Wall);

        let empty = Polygon::new(geo::LineString::new(vec![]), vec![]);
        let class = classify_polygon::<MemoryGrid<f32>>(&empty, None, &PipelineConfig::default());
        assert_eq!(class.outcome, ClassifyOutcome::Error);
    }

    #[test]
    fn boundary_compactness_is_wall() {
        assert_eq!(label_for(5.0, 5.0), Classification::Wall);
        assert_eq!(label_for(5.000_001, 5.0), Classification::Terrace);
        assert_eq!(label_for(4.99, 5.0), Classification::Wall);
    }

    #[test]
    fn principal_axis_is_long_edge() {
        let (a, b) = principal_axis(&rect(0.0, 0.0, 30.0, 2.0)).unwrap();
        let len = (b.x - a.x).hypot(b.y - a.y);
        assert!((len - 30.0).abs() < 1e-6);
    }

    #[test]
    fn probe_measures_step_across_axis() {
        let config = PipelineConfig::default();
        let mut sampler = ElevationSampler::new(step_grid(), &config);
        let strip = rect(10.0, 19.5, 80.0, 1.0);
        let class = classify_polygon(&strip, Some(&mut sampler), &config);
        assert_eq!(class.probe_stations, 3);
        assert!((class.elevation_delta - 10.0).abs() < 1e-9);
        assert_eq!(class.class, Classification::Terrace);
    }

    #[test]
    fn probe_outside_grid_contributes_nothing() {
        let config = PipelineConfig::default();
        let mut sampler = ElevationSampler::new(step_grid(), &config);
        let far = rect(5000.0, 5000.0, 80.0, 1.0);
        let class = classify_polygon(&far, Some(&mut sampler), &config);
        assert_eq!(class.probe_stations, 0);
        assert!(class.elevation_delta.abs() < f64::EPSILON);
    }

    #[test]
    fn sampler_rejects_nodata_and_implausible_values() {
        let meta = GridMeta {
            width: 3,
            height: 1,
            transform: GeoTransform::north_up(0.0, 1.0, 1.0, 1.0),
            crs: Crs::LAMBERT_93,
            nodata: Some(-9999.0),
        };
        let grid = MemoryGrid::from_fn(meta, |col, _| [-9999.0, 6000.0, 250.0][col as usize]);
        let mut sampler = ElevationSampler::new(grid, &PipelineConfig::default());
        assert_eq!(sampler.sample(coord! { x: 0.5, y: 0.5 }), None);
        assert_eq!(sampler.sample(coord! { x: 1.5, y: 0.5 }), None);
        assert_eq!(sampler.sample(coord! { x: 2.5, y: 0.5 }), Some(250.0));
        assert_eq!(sampler.sample(coord! { x: 3.5, y: 0.5 }), None);
        assert_eq!(sampler.sample(coord! { x: -0.5, y: 0.5 }), None);
    }

    #[test]
    fn class_counts_record() {
        let config = PipelineConfig::default();
        let mut counts = ClassCounts::default();
        for polygon in [
            rect(0.0, 0.0, 80.0, 1.0),
            rect(0.0, 0.0, 120.0, 1.0),
            rect(0.0, 0.0, 5.0, 5.0),
        ] {
            counts.record(&classify_polygon::<MemoryGrid<f32>>(&polygon, None, &config));
        }
        assert_eq!(counts.terrace, 1);
        assert_eq!(counts.wall, 2);
        assert_eq!(counts.sliver, 1);
        assert_eq!(counts.error, 0);
    }

    #[test]
    fn missing_sampler_leaves_delta_zero() {
        let class = classify_polygon(
            &rect(0.0, 0.0, 3.0, 3.0),
            None::<&mut NoSampler>,
            &PipelineConfig::default(),
        );
        assert_eq!(class.probe_stations, 0);
        assert!(class.elevation_delta.abs() < f64::EPSILON);
    }
}
