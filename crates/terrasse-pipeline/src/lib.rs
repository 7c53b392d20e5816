//! terrasse-pipeline: terrace and retaining-wall detection core (sans-IO).
//!
//! Turns an elevation grid into classified polygons through:
//! slope -> break mask -> tile vectorization (parallel) -> global merge ->
//! classification.
//!
//! This crate has **no file I/O** -- grids are reached through the
//! [`grid::GridReader`], [`grid::BlockSink`] and [`grid::GridSource`]
//! traits, with [`grid::MemoryGrid`] as the in-memory implementation.
//! GeoTIFF files, the artifact cache and the stage runner live in
//! `terrasse-io`; the feature collection format lives in
//! `terrasse-export`.

pub mod breaks;
pub mod classify;
pub mod diagnostics;
pub mod grid;
pub mod merge;
pub mod shape;
pub mod simplify;
pub mod slope;
pub mod trace;
pub mod types;
pub mod vectorize;

pub use classify::{ClassifyOutcome, ElevationSampler, PolygonClass, classify_polygon};
pub use diagnostics::{RunDiagnostics, StageDiagnostics, StageMetrics, StageOutcome};
pub use grid::{Block, BlockPlan, BlockSink, GridReader, GridSource, MemoryGrid};
pub use merge::{MergeOutcome, OverlayUnion, UnionEngine, UnionStrategy};
pub use shape::ShapeMetrics;
pub use trace::{PolygonTracer, TracerKind};
pub use types::{
    Classification, Crs, GeoTransform, GridError, GridMeta, PipelineConfig, PipelineError,
    Window,
};

use std::time::Instant;

use geo::Polygon;

use crate::diagnostics::ClassCounts;

/// Everything [`detect`] produces.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Slope grid.
    pub slope: MemoryGrid<f32>,
    /// Break mask grid.
    pub breaks: MemoryGrid<u8>,
    /// Merged polygons in the working CRS.
    pub polygons: Vec<Polygon<f64>>,
    /// Classification of each polygon, same order as `polygons`.
    pub classes: Vec<PolygonClass>,
    /// Per-stage diagnostics.
    pub diagnostics: RunDiagnostics,
}

/// Run the whole detection on an in-memory elevation grid.
///
/// # Pipeline steps
///
/// 1. Slope with padded blocks
/// 2. Break mask (slope strictly above the threshold)
/// 3. Tile vectorization on the worker pool
/// 4. Global union with chunked fallback
/// 5. Compactness classification with elevation probes
///
/// No export simplification or reprojection happens here; polygons stay
/// in the grid's CRS.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `config` does not
/// validate, and propagates stage errors.
pub fn detect(
    elevation: &MemoryGrid<f32>,
    config: &PipelineConfig,
) -> Result<Detection, PipelineError> {
    config.validate()?;
    let start = Instant::now();
    let mut diagnostics = RunDiagnostics::default();

    // 1. Slope.
    let mut slope = MemoryGrid::filled(slope::slope_meta(elevation.meta()), 0.0);
    let diag = slope::run_slope(&mut &*elevation, &mut slope, config)?;
    diagnostics.push("slope", StageOutcome::Ran(diag));

    // 2. Break mask.
    let mut breaks = MemoryGrid::filled(breaks::mask_meta(slope.meta()), breaks::BACKGROUND);
    let diag = breaks::run_breaks(&mut &slope, &mut breaks, config)?;
    diagnostics.push("breaks", StageOutcome::Ran(diag));

    // 3. Vectorize.
    let (report, diag) = vectorize::run_vectorize(&breaks, config)?;
    diagnostics.push("vectorize", StageOutcome::Ran(diag));

    // 4. Merge.
    let (merged, diag) = merge::run_merge(report.polygons, &OverlayUnion, config.union_chunk_size)?;
    diagnostics.push("merge", StageOutcome::Ran(diag));

    // 5. Classify.
    let classify_start = Instant::now();
    let mut sampler = ElevationSampler::new(elevation, config);
    let classes: Vec<PolygonClass> = merged
        .polygons
        .iter()
        .map(|p| classify_polygon(p, Some(&mut sampler), config))
        .collect();
    let mut counts = ClassCounts::default();
    for class in &classes {
        counts.record(class);
    }
    diagnostics.push(
        "classify",
        StageOutcome::Ran(StageDiagnostics {
            duration: classify_start.elapsed(),
            metrics: StageMetrics::Classify {
                features: classes.len(),
                counts,
                probed: classes.iter().filter(|c| c.probe_stations > 0).count(),
            },
        }),
    );

    diagnostics.total_duration = start.elapsed();
    Ok(Detection {
        slope,
        breaks,
        polygons: merged.polygons,
        classes,
        diagnostics,
    })
}
