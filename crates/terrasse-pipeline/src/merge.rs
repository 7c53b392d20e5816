//! Global merge: union every tile polygon into disjoint polygons.
//!
//! One bulk union is attempted first. A boolean overlay over many, or
//! slightly malformed, polygons can fail; a panic or an invalid result
//! counts as a failure and triggers the chunked fallback. The fallback
//! orders polygons spatially (R-tree bulk-load order), unions them in
//! fixed-size chunks, then unions the per-chunk results.
//!
//! The overlay is reached through [`UnionEngine`] so the fallback path
//! can be exercised with an engine that fails on demand.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use geo::{BoundingRect, MultiPolygon, Polygon, Validation, unary_union};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{StageDiagnostics, StageMetrics};
use crate::types::PipelineError;
use crate::vectorize::panic_message;

/// Boolean union backend.
pub trait UnionEngine: Sync {
    /// Union `polygons` into a set of disjoint polygons.
    ///
    /// # Errors
    ///
    /// Returns a description of the topology failure.
    fn union(&self, polygons: &[Polygon<f64>]) -> Result<MultiPolygon<f64>, String>;
}

/// Union through `geo`'s overlay, treating panics and invalid output as
/// failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayUnion;

impl UnionEngine for OverlayUnion {
    fn union(&self, polygons: &[Polygon<f64>]) -> Result<MultiPolygon<f64>, String> {
        let merged = catch_unwind(AssertUnwindSafe(|| unary_union(polygons.iter())))
            .map_err(|payload| format!("overlay panicked: {}", panic_message(payload.as_ref())))?;
        if merged.is_valid() {
            Ok(merged)
        } else {
            Err("overlay produced invalid geometry".to_string())
        }
    }
}

/// Which path produced a [`MergeOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnionStrategy {
    /// Single bulk union.
    Bulk,
    /// Chunked fallback after the bulk union failed.
    Chunked,
    /// Nothing to merge.
    Empty,
}

/// Result of the global merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Disjoint merged polygons. Empty when there was no input.
    pub polygons: Vec<Polygon<f64>>,
    /// Path taken.
    pub strategy: UnionStrategy,
    /// Number of polygons consumed.
    pub input_count: usize,
}

/// Order polygons so that consecutive ones are spatially close.
fn spatial_order(polygons: Vec<Polygon<f64>>) -> Vec<Polygon<f64>> {
    let entries: Vec<GeomWithData<Rectangle<[f64; 2]>, usize>> = polygons
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            p.bounding_rect().map(|r| {
                GeomWithData::new(
                    Rectangle::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]),
                    i,
                )
            })
        })
        .collect();
    let tree = RTree::bulk_load(entries);

    let mut slots: Vec<Option<Polygon<f64>>> = polygons.into_iter().map(Some).collect();
    let mut ordered: Vec<Polygon<f64>> = tree.iter().filter_map(|e| slots[e.data].take()).collect();
    // Polygons without a bounding box (empty) go last.
    ordered.extend(slots.into_iter().flatten());
    ordered
}

/// Chunked fallback union.
fn chunked_union<E: UnionEngine>(
    polygons: Vec<Polygon<f64>>,
    engine: &E,
    chunk_size: usize,
) -> Result<MultiPolygon<f64>, String> {
    let ordered = spatial_order(polygons);
    let mut partials: Vec<Polygon<f64>> = Vec::new();
    for (i, chunk) in ordered.chunks(chunk_size.max(1)).enumerate() {
        let merged = engine
            .union(chunk)
            .map_err(|e| format!("chunk {i} of {} polygons: {e}", chunk.len()))?;
        partials.extend(merged);
    }
    engine
        .union(&partials)
        .map_err(|e| format!("final union of {} partials: {e}", partials.len()))
}

/// Union all tile polygons. Consumes the input.
///
/// # Errors
///
/// Returns [`PipelineError::Union`] when both the bulk union and the
/// chunked fallback fail.
pub fn merge_polygons<E: UnionEngine>(
    polygons: Vec<Polygon<f64>>,
    engine: &E,
    chunk_size: usize,
) -> Result<MergeOutcome, PipelineError> {
    let input_count = polygons.len();
    if polygons.is_empty() {
        return Ok(MergeOutcome {
            polygons: Vec::new(),
            strategy: UnionStrategy::Empty,
            input_count,
        });
    }

    match engine.union(&polygons) {
        Ok(merged) => Ok(MergeOutcome {
            polygons: merged.0,
            strategy: UnionStrategy::Bulk,
            input_count,
        }),
        Err(reason) => {
            log::warn!("merge: bulk union of {input_count} polygons failed ({reason}), chunking");
            let merged = chunked_union(polygons, engine, chunk_size).map_err(PipelineError::Union)?;
            Ok(MergeOutcome {
                polygons: merged.0,
                strategy: UnionStrategy::Chunked,
                input_count,
            })
        }
    }
}

/// [`merge_polygons`] with timing and logging.
///
/// # Errors
///
/// See [`merge_polygons`].
pub fn run_merge<E: UnionEngine>(
    polygons: Vec<Polygon<f64>>,
    engine: &E,
    chunk_size: usize,
) -> Result<(MergeOutcome, StageDiagnostics), PipelineError> {
    let start = Instant::now();
    log::info!("merge: {} polygons", polygons.len());
    let outcome = merge_polygons(polygons, engine, chunk_size)?;
    let diagnostics = StageDiagnostics {
        duration: start.elapsed(),
        metrics: StageMetrics::Merge {
            strategy: format!("{:?}", outcome.strategy),
            input: outcome.input_count,
            output: outcome.polygons.len(),
        },
    };
    log::info!(
        "merge: {:?} union {} -> {} polygons in {:.3}s",
        outcome.strategy,
        outcome.input_count,
        outcome.polygons.len(),
        diagnostics.duration.as_secs_f64()
    );
    Ok((outcome, diagnostics))
}
