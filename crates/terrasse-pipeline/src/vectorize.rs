//! Tile vectorization: mask blocks to world-space polygons, in parallel.
//!
//! Work is cut into batches of [`PipelineConfig::batch_size`] blocks and
//! run on a rayon pool. Each batch opens its own reader from the
//! [`GridSource`], so batches share nothing and can finish in any order.
//!
//! Per block:
//!
//! 1. read a padded window (boundless, fill 0);
//! 2. skip the block if it has no break pixels;
//! 3. trace the mask with the block's own affine transform;
//! 4. lightly simplify each polygon;
//! 5. close the whole tile's polygon set (buffer out, then in) when the
//!    policy is [`VectorizePolicy::OrganicMerge`];
//! 6. repair invalid results with a zero-distance buffer and keep only
//!    polygons whose area is within `[min_area, max_area]`.
//!
//! Filtering happens after closing so that fragments too small on their
//! own survive once merged with a neighbour.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use geo::{Area, Buffer, HasDimensions, MultiPolygon, Polygon, Validation, unary_union};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::breaks::BACKGROUND;
use crate::diagnostics::{RejectionCounts, StageDiagnostics, StageMetrics};
use crate::grid::{BlockPlan, GridReader, GridSource};
use crate::simplify::simplify_polygon;
use crate::trace::PolygonTracer;
use crate::types::{PipelineConfig, PipelineError, VectorizePolicy, Window};

/// Why a polygon was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolygonRejection {
    /// Nothing left after closing or repair.
    Empty,
    /// Still invalid after repair.
    Invalid,
    /// Area below the minimum.
    TooSmall,
    /// Area above the maximum.
    TooLarge,
}

impl RejectionCounts {
    /// Count one rejection.
    pub const fn record(&mut self, rejection: PolygonRejection) {
        match rejection {
            PolygonRejection::Empty => self.empty += 1,
            PolygonRejection::Invalid => self.invalid += 1,
            PolygonRejection::TooSmall => self.too_small += 1,
            PolygonRejection::TooLarge => self.too_large += 1,
        }
    }
}

/// A block that could not be vectorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFailure {
    /// The plan window of the block.
    pub window: Window,
    /// What went wrong.
    pub reason: String,
}

/// Polygons and tallies from one block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockPolygons {
    /// Kept polygons, world coordinates.
    pub polygons: Vec<Polygon<f64>>,
    /// Polygons produced by tracing.
    pub traced: usize,
    /// Whether the block had no break pixels.
    pub empty: bool,
    /// Discarded polygons by reason.
    pub rejected: RejectionCounts,
}

/// Aggregated result of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Kept polygons from every block of the batch.
    pub polygons: Vec<Polygon<f64>>,
    /// Blocks attempted.
    pub blocks: usize,
    /// Blocks with no break pixels.
    pub empty_blocks: usize,
    /// Polygons produced by tracing.
    pub traced: usize,
    /// Discarded polygons by reason.
    pub rejected: RejectionCounts,
    /// Blocks that failed.
    pub failures: Vec<BlockFailure>,
}

impl BatchReport {
    fn absorb_block(&mut self, block: BlockPolygons) {
        self.blocks += 1;
        self.empty_blocks += usize::from(block.empty);
        self.traced += block.traced;
        self.rejected.absorb(&block.rejected);
        self.polygons.extend(block.polygons);
    }

    fn absorb(&mut self, other: Self) {
        self.blocks += other.blocks;
        self.empty_blocks += other.empty_blocks;
        self.traced += other.traced;
        self.rejected.absorb(&other.rejected);
        self.polygons.extend(other.polygons);
        self.failures.extend(other.failures);
    }
}

/// Closing of a polygon set: buffer out by `radius`, then back in.
///
/// Merges pieces closer than `2 * radius` and rounds raster staircase
/// edges. A non-positive radius returns the input unchanged.
#[must_use]
pub fn close_polygons(polygons: Vec<Polygon<f64>>, radius: f64) -> MultiPolygon<f64> {
    let polygons = MultiPolygon::new(polygons);
    if radius <= 0.0 || polygons.0.is_empty() {
        return polygons;
    }
    polygons.buffer(radius).buffer(-radius)
}

/// Rebuild an invalid polygon with a zero-distance buffer, falling back to
/// a self-union when the buffer comes back empty.
fn repair(polygon: &Polygon<f64>) -> MultiPolygon<f64> {
    let buffered = polygon.buffer(0.0);
    if buffered.0.is_empty() {
        unary_union(std::iter::once(polygon))
    } else {
        buffered
    }
}

/// Repair and area-filter one polygon.
///
/// Invalid input is repaired first, which may split it into several
/// parts; each part is filtered on its own.
pub fn filter_polygon(
    polygon: Polygon<f64>,
    config: &PipelineConfig,
    rejected: &mut RejectionCounts,
) -> Vec<Polygon<f64>> {
    if polygon.is_empty() {
        rejected.record(PolygonRejection::Empty);
        return Vec::new();
    }
    let parts = if polygon.is_valid() {
        vec![polygon]
    } else {
        let repaired = repair(&polygon);
        if repaired.0.is_empty() {
            rejected.record(PolygonRejection::Empty);
            return Vec::new();
        }
        if !repaired.is_valid() {
            rejected.record(PolygonRejection::Invalid);
            return Vec::new();
        }
        repaired.0
    };

    parts
        .into_iter()
        .filter(|part| {
            let area = part.unsigned_area();
            if area < config.min_area {
                rejected.record(PolygonRejection::TooSmall);
                false
            } else if area > config.max_area {
                rejected.record(PolygonRejection::TooLarge);
                false
            } else {
                true
            }
        })
        .collect()
}

/// Vectorize one plan block.
///
/// # Errors
///
/// Propagates read failures from `reader`.
pub fn vectorize_block<R: GridReader<u8>>(
    reader: &mut R,
    window: Window,
    config: &PipelineConfig,
) -> Result<BlockPolygons, PipelineError> {
    let padded = window.padded(config.vectorize_padding);
    let fill = reader.meta().nodata_or(BACKGROUND);
    let mask = reader.read_window(padded, fill)?;
    if !mask.pixels().any(|p| p[0] != 0) {
        return Ok(BlockPolygons {
            empty: true,
            ..BlockPolygons::default()
        });
    }

    let transform = reader.meta().transform.window_transform(&padded);
    let traced = config.tracer.trace(&mask, &transform);
    let traced_count = traced.len();
    let simplified: Vec<Polygon<f64>> = traced
        .iter()
        .map(|p| simplify_polygon(p, config.tile_simplify_tolerance))
        .collect();

    let merged = match config.vectorize_policy {
        VectorizePolicy::OrganicMerge => close_polygons(simplified, config.smoothing_radius),
        VectorizePolicy::Fragments => MultiPolygon::new(simplified),
    };

    let mut block = BlockPolygons {
        traced: traced_count,
        ..BlockPolygons::default()
    };
    for polygon in merged {
        let kept = filter_polygon(polygon, config, &mut block.rejected);
        block.polygons.extend(kept);
    }
    Ok(block)
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Vectorize a batch of blocks with a reader of its own.
///
/// Never fails as a whole: a block that errors or panics becomes a
/// [`BlockFailure`] and the batch moves on. When the reader cannot be
/// opened every block of the batch is reported failed and no polygons are
/// returned.
pub fn vectorize_batch<S: GridSource<u8>>(
    source: &S,
    windows: &[Window],
    config: &PipelineConfig,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut reader = match source.open() {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("vectorize: batch of {} blocks lost: {e}", windows.len());
            report.blocks = windows.len();
            report.failures = windows
                .iter()
                .map(|&window| BlockFailure {
                    window,
                    reason: e.to_string(),
                })
                .collect();
            return report;
        }
    };

    for &window in windows {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            vectorize_block(&mut reader, window, config)
        }));
        let reason = match outcome {
            Ok(Ok(block)) => {
                report.absorb_block(block);
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };
        log::warn!("vectorize: block {window:?} failed: {reason}");
        report.blocks += 1;
        report.failures.push(BlockFailure { window, reason });
    }
    report
}

/// Vectorize the whole mask behind `source` on a worker pool.
///
/// Returns the kept polygons (in no particular order), the failures, and
/// the stage diagnostics.
///
/// # Errors
///
/// Returns [`PipelineError::WorkerPool`] when the pool cannot be built and
/// [`PipelineError::TooManyFailures`] when the failed block ratio exceeds
/// [`PipelineConfig::max_block_failure_ratio`].
pub fn run_vectorize<S: GridSource<u8>>(
    source: &S,
    config: &PipelineConfig,
) -> Result<(BatchReport, StageDiagnostics), PipelineError> {
    let start = Instant::now();
    let plan = BlockPlan::for_grid(source.meta(), config.block_size);
    let batches = plan.batches(config.batch_size);
    log::info!(
        "vectorize: {} blocks in {} batches, policy {:?}",
        plan.len(),
        batches.len(),
        config.vectorize_policy
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
    let reports: Vec<BatchReport> = pool.install(|| {
        batches
            .par_iter()
            .map(|windows| vectorize_batch(source, windows, config))
            .collect()
    });

    let mut total = BatchReport::default();
    for report in reports {
        total.absorb(report);
    }

    let failed = total.failures.len();
    #[allow(clippy::cast_precision_loss)]
    let failure_ratio = if total.blocks == 0 {
        0.0
    } else {
        failed as f64 / total.blocks as f64
    };
    if failure_ratio > config.max_block_failure_ratio {
        return Err(PipelineError::TooManyFailures {
            failed,
            total: total.blocks,
        });
    }

    let diagnostics = StageDiagnostics {
        duration: start.elapsed(),
        metrics: StageMetrics::Vectorize {
            batches: batches.len(),
            blocks: total.blocks,
            empty_blocks: total.empty_blocks,
            failed_blocks: failed,
            traced: total.traced,
            kept: total.polygons.len(),
            rejected: total.rejected,
        },
    };
    log::info!(
        "vectorize: {} traced, {} kept, {} rejected, {failed} failed blocks in {:.3}s",
        total.traced,
        total.polygons.len(),
        total.rejected.total(),
        diagnostics.duration.as_secs_f64()
    );
    Ok((total, diagnostics))
}
