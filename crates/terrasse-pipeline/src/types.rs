//! Shared types for the terrasse processing pipeline.
//!
//! Georeferencing ([`GeoTransform`], [`Crs`], [`GridMeta`]), pixel
//! windows ([`Window`]), the configuration struct threaded through every
//! stage ([`PipelineConfig`]), the classification labels, and the error
//! types.

use std::hash::{Hash, Hasher};

use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::grid::Sample;
use crate::trace::TracerKind;

// ---------------------------------------------------------------------------
// Georeferencing
// ---------------------------------------------------------------------------

/// Six-parameter affine transform from pixel space to world space.
///
/// Uses the GDAL parameter order:
///
/// ```text
/// x = origin_x + col * pixel_width  + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
///
/// `pixel_height` is negative for the usual north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// World x of the top-left corner of pixel (0, 0).
    pub origin_x: f64,
    /// World x advance per column.
    pub pixel_width: f64,
    /// World x advance per row (zero for north-up rasters).
    pub row_rotation: f64,
    /// World y of the top-left corner of pixel (0, 0).
    pub origin_y: f64,
    /// World y advance per column (zero for north-up rasters).
    pub col_rotation: f64,
    /// World y advance per row (negative for north-up rasters).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-ish pixels.
    #[must_use]
    pub const fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -pixel_height,
        }
    }

    /// Map fractional pixel coordinates (column, row) to world space.
    #[must_use]
    pub fn apply(&self, col: f64, row: f64) -> Coord<f64> {
        Coord {
            x: self.pixel_width.mul_add(col, self.row_rotation.mul_add(row, self.origin_x)),
            y: self.col_rotation.mul_add(col, self.pixel_height.mul_add(row, self.origin_y)),
        }
    }

    /// Map a world coordinate back to fractional pixel coordinates
    /// `(col, row)`.
    ///
    /// Returns `None` when the transform is singular.
    #[must_use]
    pub fn invert(&self, world: Coord<f64>) -> Option<(f64, f64)> {
        let det = self
            .pixel_width
            .mul_add(self.pixel_height, -(self.row_rotation * self.col_rotation));
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = world.x - self.origin_x;
        let dy = world.y - self.origin_y;
        let col = self.pixel_height.mul_add(dx, -(self.row_rotation * dy)) / det;
        let row = self.pixel_width.mul_add(dy, -(self.col_rotation * dx)) / det;
        Some((col, row))
    }

    /// Transform of a window whose top-left pixel is `(col_off, row_off)`
    /// in this grid. Offsets may be negative (padded windows).
    #[must_use]
    pub fn window_transform(&self, window: &Window) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let origin = self.apply(window.col_off as f64, window.row_off as f64);
        Self {
            origin_x: origin.x,
            origin_y: origin.y,
            ..*self
        }
    }

    /// World-space bounding rectangle of a `width` x `height` grid.
    #[must_use]
    pub fn bounds(&self, width: u32, height: u32) -> Rect<f64> {
        let w = f64::from(width);
        let h = f64::from(height);
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ];
        let min_x = corners.iter().map(|c| c.x).fold(f64::INFINITY, f64::min);
        let max_x = corners.iter().map(|c| c.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = corners.iter().map(|c| c.y).fold(f64::INFINITY, f64::min);
        let max_y = corners.iter().map(|c| c.y).fold(f64::NEG_INFINITY, f64::max);
        Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
    }

    /// Ground distance covered by one column step.
    #[must_use]
    pub fn pixel_size_x(&self) -> f64 {
        self.pixel_width.hypot(self.col_rotation)
    }

    /// Ground distance covered by one row step.
    #[must_use]
    pub fn pixel_size_y(&self) -> f64 {
        self.row_rotation.hypot(self.pixel_height)
    }
}

/// Coordinate reference system identifier of a grid or geometry set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// An EPSG code such as `2154` (Lambert-93).
    Epsg(u32),
    /// The file carried no usable CRS information.
    Unknown,
}

impl Crs {
    /// Lambert-93, the projected metric system of the reference data.
    pub const LAMBERT_93: Self = Self::Epsg(2154);

    /// OGC URN form, e.g. `urn:ogc:def:crs:EPSG::2154`.
    #[must_use]
    pub fn urn(&self) -> Option<String> {
        match self {
            Self::Epsg(code) => Some(format!("urn:ogc:def:crs:EPSG::{code}")),
            Self::Unknown => None,
        }
    }
}

/// Everything about a grid except its samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMeta {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel to world mapping.
    pub transform: GeoTransform,
    /// Coordinate reference system of `transform`.
    pub crs: Crs,
    /// Sentinel marking missing samples, if any.
    pub nodata: Option<f64>,
}

impl GridMeta {
    /// World-space bounds of the whole grid.
    #[must_use]
    pub fn bounds(&self) -> Rect<f64> {
        self.transform.bounds(self.width, self.height)
    }

    /// The window covering the whole grid.
    #[must_use]
    pub const fn full_window(&self) -> Window {
        Window::new(0, 0, self.width, self.height)
    }

    /// The no-data sentinel as a `T` sample, or `fallback` when the grid
    /// declares none. Fill value for reads past the grid edge.
    #[must_use]
    pub fn nodata_or<T: Sample>(&self, fallback: T) -> T {
        self.nodata.map_or(fallback, T::from_f64)
    }

    /// Same georeferencing, different no-data sentinel. Used when a stage
    /// derives a new grid from this one.
    #[must_use]
    pub fn with_nodata(&self, nodata: Option<f64>) -> Self {
        Self {
            nodata,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

/// Axis-aligned pixel rectangle, possibly extending past the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Column of the top-left pixel (may be negative).
    pub col_off: i64,
    /// Row of the top-left pixel (may be negative).
    pub row_off: i64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Window {
    /// Create a window.
    #[must_use]
    pub const fn new(col_off: i64, row_off: i64, width: u32, height: u32) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    /// Grow the window by `margin` pixels on all four sides.
    #[must_use]
    pub const fn padded(&self, margin: u32) -> Self {
        Self {
            col_off: self.col_off - margin as i64,
            row_off: self.row_off - margin as i64,
            width: self.width + 2 * margin,
            height: self.height + 2 * margin,
        }
    }

    /// Exclusive right column.
    #[must_use]
    pub const fn col_end(&self) -> i64 {
        self.col_off + self.width as i64
    }

    /// Exclusive bottom row.
    #[must_use]
    pub const fn row_end(&self) -> i64 {
        self.row_off + self.height as i64
    }

    /// Number of pixels covered.
    #[must_use]
    pub const fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Overlap with `other`, or `None` when they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let col_off = self.col_off.max(other.col_off);
        let row_off = self.row_off.max(other.row_off);
        let col_end = self.col_end().min(other.col_end());
        let row_end = self.row_end().min(other.row_end());
        if col_end <= col_off || row_end <= row_off {
            return None;
        }
        let width = u32::try_from(col_end - col_off).ok()?;
        let height = u32::try_from(row_end - row_off).ok()?;
        Some(Self::new(col_off, row_off, width, height))
    }

    /// Whether the window lies entirely inside a `width` x `height` grid.
    #[must_use]
    pub const fn is_within(&self, width: u32, height: u32) -> bool {
        self.col_off >= 0
            && self.row_off >= 0
            && self.col_end() <= width as i64
            && self.row_end() <= height as i64
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Class label assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Elongated, contour-following shape: an agricultural terrace.
    Terrace,
    /// Compact fragment: a retaining wall, stone heap or artifact.
    Wall,
}

impl Classification {
    /// Single-letter code written to the `c` property.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Terrace => "t",
            Self::Wall => "m",
        }
    }

    /// Numeric type id written to the `t` property.
    #[must_use]
    pub const fn type_id(self) -> u8 {
        match self {
            Self::Terrace => 1,
            Self::Wall => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Units of the slope grid and therefore of the slope threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SlopeUnits {
    /// `atan(|gradient|)` in degrees.
    #[default]
    Degrees,
    /// Raw Sobel magnitude, not normalised by pixel size.
    RawGradient,
}

/// How the vectorizer treats traced fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorizePolicy {
    /// Closing over the whole tile merges fragments within
    /// `2 * smoothing_radius` and smooths raster edges.
    #[default]
    OrganicMerge,
    /// No closing: one polygon per connected mask region.
    Fragments,
}

/// Configuration for the whole pipeline.
///
/// Built once at startup and passed by reference to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slope above which a pixel is a breakline candidate.
    pub slope_threshold: f64,

    /// Units of `slope_threshold` and of the slope grid.
    pub slope_units: SlopeUnits,

    /// Side length in pixels of the processing blocks.
    pub block_size: u32,

    /// Context margin read around each block by the slope stage.
    pub slope_padding: u32,

    /// Context margin read around each block by the vectorizer.
    pub vectorize_padding: u32,

    /// Mask tracing algorithm.
    pub tracer: TracerKind,

    /// Light simplification applied to traced polygons (world units).
    pub tile_simplify_tolerance: f64,

    /// Coarser simplification applied at export (world units).
    pub export_simplify_tolerance: f64,

    /// Smallest retained polygon area (world units squared).
    pub min_area: f64,

    /// Largest retained polygon area (world units squared).
    pub max_area: f64,

    /// Closing radius in world units.
    pub smoothing_radius: f64,

    /// Whether tiles are merged with a closing or kept as fragments.
    pub vectorize_policy: VectorizePolicy,

    /// Compactness strictly above this is a terrace.
    pub compactness_cutoff: f64,

    /// `perimeter / sqrt(area)` strictly above this is a sliver.
    pub sliver_cutoff: f64,

    /// Perpendicular standoff of the elevation probe (world units).
    pub probe_distance: f64,

    /// Lowest plausible elevation; lower readings are ignored.
    pub min_elevation: f64,

    /// Highest plausible elevation; higher readings are ignored.
    pub max_elevation: f64,

    /// Blocks per worker task.
    pub batch_size: usize,

    /// Polygons per chunk in the fallback union.
    pub union_chunk_size: usize,

    /// Worker threads for vectorization (0 = one per core).
    pub workers: usize,

    /// Decimal places kept in exported coordinates.
    pub coordinate_precision: u32,

    /// Abort the vectorize stage when more than this fraction of blocks
    /// fail. `1.0` never aborts.
    pub max_block_failure_ratio: f64,
}

impl PipelineConfig {
    /// Default slope threshold (degrees).
    pub const DEFAULT_SLOPE_THRESHOLD: f64 = 15.0;
    /// Default block side length (pixels).
    pub const DEFAULT_BLOCK_SIZE: u32 = 256;
    /// Default slope context margin (pixels).
    pub const DEFAULT_SLOPE_PADDING: u32 = 8;
    /// Default vectorizer context margin (pixels).
    pub const DEFAULT_VECTORIZE_PADDING: u32 = 2;
    /// Default tile simplification tolerance (meters).
    pub const DEFAULT_TILE_SIMPLIFY_TOLERANCE: f64 = 0.5;
    /// Default export simplification tolerance (meters).
    pub const DEFAULT_EXPORT_SIMPLIFY_TOLERANCE: f64 = 2.0;
    /// Default minimum area (square meters).
    pub const DEFAULT_MIN_AREA: f64 = 20.0;
    /// Default maximum area (square meters, one hectare).
    pub const DEFAULT_MAX_AREA: f64 = 10_000.0;
    /// Default closing radius (meters).
    pub const DEFAULT_SMOOTHING_RADIUS: f64 = 3.0;
    /// Default compactness cutoff.
    pub const DEFAULT_COMPACTNESS_CUTOFF: f64 = 5.0;
    /// Default sliver cutoff on `perimeter / sqrt(area)`.
    pub const DEFAULT_SLIVER_CUTOFF: f64 = 20.0;
    /// Default probe standoff (meters).
    pub const DEFAULT_PROBE_DISTANCE: f64 = 5.0;
    /// Default lowest plausible elevation (meters).
    pub const DEFAULT_MIN_ELEVATION: f64 = -100.0;
    /// Default highest plausible elevation (meters).
    pub const DEFAULT_MAX_ELEVATION: f64 = 5000.0;
    /// Default blocks per worker task.
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    /// Default fallback union chunk size.
    pub const DEFAULT_UNION_CHUNK_SIZE: usize = 1000;
    /// Default exported coordinate precision (about 10 cm).
    pub const DEFAULT_COORDINATE_PRECISION: u32 = 6;

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let finite = [
            ("slope_threshold", self.slope_threshold),
            ("tile_simplify_tolerance", self.tile_simplify_tolerance),
            ("export_simplify_tolerance", self.export_simplify_tolerance),
            ("min_area", self.min_area),
            ("max_area", self.max_area),
            ("smoothing_radius", self.smoothing_radius),
            ("compactness_cutoff", self.compactness_cutoff),
            ("sliver_cutoff", self.sliver_cutoff),
            ("probe_distance", self.probe_distance),
            ("min_elevation", self.min_elevation),
            ("max_elevation", self.max_elevation),
            ("max_block_failure_ratio", self.max_block_failure_ratio),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(PipelineError::InvalidConfig(format!("{name} must be finite")));
            }
        }
        if self.tile_simplify_tolerance < 0.0 || self.export_simplify_tolerance < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "simplify tolerances must be >= 0".to_string(),
            ));
        }
        if self.smoothing_radius < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "smoothing_radius must be >= 0".to_string(),
            ));
        }
        if self.min_area < 0.0 || self.min_area > self.max_area {
            return Err(PipelineError::InvalidConfig(
                "area range must satisfy 0 <= min_area <= max_area".to_string(),
            ));
        }
        if self.min_elevation > self.max_elevation {
            return Err(PipelineError::InvalidConfig(
                "min_elevation must not exceed max_elevation".to_string(),
            ));
        }
        if self.block_size == 0 || self.batch_size == 0 || self.union_chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "block_size, batch_size and union_chunk_size must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_block_failure_ratio) {
            return Err(PipelineError::InvalidConfig(
                "max_block_failure_ratio must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Stable 64-bit fingerprint of every field, used to key cached
    /// artifacts.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = SipHasher13::new();
        self.slope_threshold.to_bits().hash(&mut hasher);
        (self.slope_units as u8).hash(&mut hasher);
        self.block_size.hash(&mut hasher);
        self.slope_padding.hash(&mut hasher);
        self.vectorize_padding.hash(&mut hasher);
        (self.tracer as u8).hash(&mut hasher);
        self.tile_simplify_tolerance.to_bits().hash(&mut hasher);
        self.export_simplify_tolerance.to_bits().hash(&mut hasher);
        self.min_area.to_bits().hash(&mut hasher);
        self.max_area.to_bits().hash(&mut hasher);
        self.smoothing_radius.to_bits().hash(&mut hasher);
        (self.vectorize_policy as u8).hash(&mut hasher);
        self.compactness_cutoff.to_bits().hash(&mut hasher);
        self.sliver_cutoff.to_bits().hash(&mut hasher);
        self.probe_distance.to_bits().hash(&mut hasher);
        self.min_elevation.to_bits().hash(&mut hasher);
        self.max_elevation.to_bits().hash(&mut hasher);
        self.batch_size.hash(&mut hasher);
        self.union_chunk_size.hash(&mut hasher);
        self.coordinate_precision.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slope_threshold: Self::DEFAULT_SLOPE_THRESHOLD,
            slope_units: SlopeUnits::default(),
            block_size: Self::DEFAULT_BLOCK_SIZE,
            slope_padding: Self::DEFAULT_SLOPE_PADDING,
            vectorize_padding: Self::DEFAULT_VECTORIZE_PADDING,
            tracer: TracerKind::default(),
            tile_simplify_tolerance: Self::DEFAULT_TILE_SIMPLIFY_TOLERANCE,
            export_simplify_tolerance: Self::DEFAULT_EXPORT_SIMPLIFY_TOLERANCE,
            min_area: Self::DEFAULT_MIN_AREA,
            max_area: Self::DEFAULT_MAX_AREA,
            smoothing_radius: Self::DEFAULT_SMOOTHING_RADIUS,
            vectorize_policy: VectorizePolicy::default(),
            compactness_cutoff: Self::DEFAULT_COMPACTNESS_CUTOFF,
            sliver_cutoff: Self::DEFAULT_SLIVER_CUTOFF,
            probe_distance: Self::DEFAULT_PROBE_DISTANCE,
            min_elevation: Self::DEFAULT_MIN_ELEVATION,
            max_elevation: Self::DEFAULT_MAX_ELEVATION,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            union_chunk_size: Self::DEFAULT_UNION_CHUNK_SIZE,
            workers: 0,
            coordinate_precision: Self::DEFAULT_COORDINATE_PRECISION,
            max_block_failure_ratio: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by grid readers and block sinks.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// A block did not have the size of the window it was written to.
    #[error("block is {actual_width}x{actual_height}, window expects {width}x{height}")]
    BlockShape {
        /// Expected width.
        width: u32,
        /// Expected height.
        height: u32,
        /// Supplied width.
        actual_width: u32,
        /// Supplied height.
        actual_height: u32,
    },

    /// A block was written outside the grid or out of plan order.
    #[error("window {0:?} cannot be written here")]
    BadWindow(Window),

    /// The grid has no usable georeferencing.
    #[error("grid has no usable georeferencing: {0}")]
    MissingGeoreference(String),

    /// The sample type stored in the file is not supported.
    #[error("unsupported sample type: {0}")]
    UnsupportedSampleType(String),

    /// Failure reported by the storage backend.
    #[error("grid backend error: {0}")]
    Backend(String),
}

/// Errors that abort a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// Reading or writing a grid failed.
    #[error(transparent)]
    Grid(#[from] GridError),

    /// The worker pool could not be built.
    #[error("worker pool error: {0}")]
    WorkerPool(String),

    /// Too many blocks failed during vectorization.
    #[error("{failed} of {total} blocks failed, above the configured ratio")]
    TooManyFailures {
        /// Failed block count.
        failed: usize,
        /// Total block count.
        total: usize,
    },

    /// Both the bulk union and the chunked fallback failed.
    #[error("polygon union failed: {0}")]
    Union(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn north_up_transform_maps_corners() {
        let t = GeoTransform::north_up(1000.0, 2000.0, 0.5, 0.5);
        let c = t.apply(2.0, 4.0);
        assert!((c.x - 1001.0).abs() < 1e-12);
        assert!((c.y - 1998.0).abs() < 1e-12);
    }

    #[test]
    fn invert_round_trips() {
        let t = GeoTransform {
            origin_x: 10.0,
            pixel_width: 2.0,
            row_rotation: 0.3,
            origin_y: 50.0,
            col_rotation: -0.2,
            pixel_height: -2.0,
        };
        let world = t.apply(7.25, 3.5);
        let (col, row) = t.invert(world).unwrap();
        assert!((col - 7.25).abs() < 1e-9);
        assert!((row - 3.5).abs() < 1e-9);
    }

    #[test]
    fn singular_transform_does_not_invert() {
        let t = GeoTransform::north_up(0.0, 0.0, 0.0, 1.0);
        assert!(t.invert(Coord { x: 1.0, y: 1.0 }).is_none());
    }

    #[test]
    fn window_transform_follows_negative_offsets() {
        let t = GeoTransform::north_up(100.0, 100.0, 1.0, 1.0);
        let w = Window::new(4, 4, 8, 8).padded(6);
        let wt = t.window_transform(&w);
        assert!((wt.origin_x - 98.0).abs() < 1e-12);
        assert!((wt.origin_y - 102.0).abs() < 1e-12);
    }

    #[test]
    fn bounds_of_north_up_grid() {
        let t = GeoTransform::north_up(0.0, 10.0, 1.0, 1.0);
        let b = t.bounds(4, 10);
        assert!((b.min().x).abs() < 1e-12);
        assert!((b.max().x - 4.0).abs() < 1e-12);
        assert!((b.min().y).abs() < 1e-12);
        assert!((b.max().y - 10.0).abs() < 1e-12);
    }

    #[test]
    fn window_intersection() {
        let a = Window::new(-2, -2, 6, 6);
        let grid = Window::new(0, 0, 3, 10);
        assert_eq!(a.intersection(&grid), Some(Window::new(0, 0, 3, 4)));
        assert_eq!(Window::new(5, 5, 2, 2).intersection(&grid), None);
    }

    #[test]
    fn padded_window_is_not_within_grid() {
        let w = Window::new(0, 0, 4, 4);
        assert!(w.is_within(4, 4));
        assert!(!w.padded(1).is_within(4, 4));
    }

    #[test]
    fn classification_codes() {
        assert_eq!(Classification::Terrace.code(), "t");
        assert_eq!(Classification::Wall.code(), "m");
        assert_eq!(Classification::Terrace.type_id(), 1);
        assert_eq!(Classification::Wall.type_id(), 0);
    }

    #[test]
    fn crs_urn() {
        assert_eq!(
            Crs::LAMBERT_93.urn().as_deref(),
            Some("urn:ogc:def:crs:EPSG::2154")
        );
        assert_eq!(Crs::Unknown.urn(), None);
    }

    #[test]
    fn pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert!((config.slope_threshold - 15.0).abs() < f64::EPSILON);
        assert_eq!(config.slope_padding, 8);
        assert_eq!(config.vectorize_padding, 2);
        assert!((config.min_area - 20.0).abs() < f64::EPSILON);
        assert!((config.max_area - 10_000.0).abs() < f64::EPSILON);
        assert!((config.smoothing_radius - 3.0).abs() < f64::EPSILON);
        assert!((config.compactness_cutoff - 5.0).abs() < f64::EPSILON);
        assert!((config.sliver_cutoff - 20.0).abs() < f64::EPSILON);
        assert!((config.probe_distance - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.union_chunk_size, 1000);
        assert_eq!(config.coordinate_precision, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_area_range() {
        let config = PipelineConfig {
            min_area: 500.0,
            max_area: 100.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_non_finite() {
        let config = PipelineConfig {
            slope_threshold: f64::NAN,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fingerprint_tracks_changes() {
        let a = PipelineConfig::default();
        let b = PipelineConfig {
            slope_threshold: 16.0,
            ..PipelineConfig::default()
        };
        assert_eq!(a.fingerprint(), PipelineConfig::default().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_worker_count() {
        let a = PipelineConfig::default();
        let b = PipelineConfig {
            workers: 3,
            ..PipelineConfig::default()
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn pipeline_config_serde_round_trip() {
        let config = PipelineConfig {
            slope_threshold: 20.0,
            vectorize_policy: VectorizePolicy::Fragments,
            ..PipelineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn partial_config_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"min_area": 30.0}"#).unwrap();
        assert!((config.min_area - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.block_size, PipelineConfig::DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn error_display() {
        let err = PipelineError::InvalidConfig("min_area > max_area".to_string());
        assert_eq!(
            err.to_string(),
            "invalid pipeline configuration: min_area > max_area"
        );
        let err = PipelineError::TooManyFailures {
            failed: 3,
            total: 4,
        };
        assert_eq!(
            err.to_string(),
            "3 of 4 blocks failed, above the configured ratio"
        );
    }
}
