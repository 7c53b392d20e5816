//! Export and classification rewrite of the merged polygons.
//!
//! Export: coarse simplification, measurement of the simplified geometry,
//! area filter, reprojection to the output CRS, coordinate rounding, and
//! streaming to a [`FeatureWriter`].
//!
//! Rewrite: every exported feature is brought back to the working CRS,
//! measured and classified there, and written out again with updated
//! properties. Stored geometry is passed through untouched.

use std::io::Write;
use std::time::Instant;

use geo::Polygon;
use terrasse_pipeline::diagnostics::ClassCounts;
use terrasse_pipeline::simplify::simplify_polygon;
use terrasse_pipeline::{
    ElevationSampler, GridReader, PipelineConfig, ShapeMetrics, StageDiagnostics, StageMetrics,
    classify_polygon,
};

use crate::ExportError;
use crate::collection::{Collection, CollectionMeta, FeatureProperties, FeatureWriter};
use crate::reproject::{Reprojector, polygon_to_output, polygon_to_working, round_polygon};

/// Why [`prepare_feature`] dropped a polygon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRejection {
    /// Below the minimum area after simplification.
    TooSmall,
    /// Above the maximum area after simplification.
    TooLarge,
}

/// Simplify, measure and filter one polygon in the working CRS.
///
/// Measurements come from the simplified geometry.
pub fn prepare_feature(
    polygon: &Polygon<f64>,
    config: &PipelineConfig,
) -> Result<(Polygon<f64>, FeatureProperties), ExportRejection> {
    let simplified = simplify_polygon(polygon, config.export_simplify_tolerance);
    let metrics = ShapeMetrics::of(&simplified);
    if metrics.area < config.min_area {
        return Err(ExportRejection::TooSmall);
    }
    if metrics.area > config.max_area {
        return Err(ExportRejection::TooLarge);
    }
    Ok((simplified, FeatureProperties::exported(&metrics)))
}

/// Export `polygons` as a feature collection written to `writer`.
///
/// A polygon whose reprojection fails is logged and skipped.
///
/// # Errors
///
/// Returns [`ExportError::Io`] or [`ExportError::Json`] when writing
/// fails.
pub fn export_polygons<W, R>(
    polygons: &[Polygon<f64>],
    reprojector: &R,
    config: &PipelineConfig,
    meta: &CollectionMeta,
    writer: W,
) -> Result<(W, StageDiagnostics), ExportError>
where
    W: Write,
    R: Reprojector + ?Sized,
{
    let start = Instant::now();
    log::info!("export: {} polygons to {}", polygons.len(), reprojector.output_crs_urn());

    let mut out = FeatureWriter::new(writer, meta)?;
    let (mut too_small, mut too_large, mut failed) = (0, 0, 0);
    for polygon in polygons {
        let (simplified, properties) = match prepare_feature(polygon, config) {
            Ok(prepared) => prepared,
            Err(ExportRejection::TooSmall) => {
                too_small += 1;
                continue;
            }
            Err(ExportRejection::TooLarge) => {
                too_large += 1;
                continue;
            }
        };
        let projected = match polygon_to_output(reprojector, &simplified) {
            Ok(projected) => projected,
            Err(e) => {
                log::warn!("export: skipping polygon: {e}");
                failed += 1;
                continue;
            }
        };
        out.write_polygon(
            &round_polygon(&projected, config.coordinate_precision),
            &properties,
        )?;
    }

    let written = out.written();
    let writer = out.finish()?;
    let diagnostics = StageDiagnostics {
        duration: start.elapsed(),
        metrics: StageMetrics::Export {
            input: polygons.len(),
            written,
            too_small,
            too_large,
            failed,
        },
    };
    log::info!(
        "export: {written} features written ({too_small} too small, {too_large} too large, {failed} failed) in {:.3}s",
        diagnostics.duration.as_secs_f64()
    );
    Ok((writer, diagnostics))
}

/// Classify every feature of `collection` in place.
///
/// Geometry is reprojected back to the working CRS for measurement and
/// elevation probing. A feature that cannot be decoded or reprojected is
/// labelled a wall with delta 0 and counted as an error.
pub fn classify_collection<R, G>(
    collection: &mut Collection,
    reprojector: &R,
    mut sampler: Option<&mut ElevationSampler<G>>,
    config: &PipelineConfig,
) -> StageDiagnostics
where
    R: Reprojector + ?Sized,
    G: GridReader<f32>,
{
    let start = Instant::now();
    log::info!("classify: {} features", collection.features.len());

    let mut counts = ClassCounts::default();
    let mut probed = 0;
    for (index, feature) in collection.features.iter_mut().enumerate() {
        let working = feature
            .polygon()
            .and_then(|p| polygon_to_working(reprojector, &p));
        match working {
            Ok(polygon) => {
                let class = classify_polygon(&polygon, sampler.as_deref_mut(), config);
                counts.record(&class);
                probed += usize::from(class.probe_stations > 0);
                feature.properties.apply(&class);
            }
            Err(e) => {
                log::warn!("classify: feature {index}: {e}");
                counts.wall += 1;
                counts.error += 1;
                feature.properties.mark_failed();
            }
        }
    }

    let diagnostics = StageDiagnostics {
        duration: start.elapsed(),
        metrics: StageMetrics::Classify {
            features: collection.features.len(),
            counts,
            probed,
        },
    };
    log::info!(
        "classify: {} terrace, {} wall ({} sliver, {} error) in {:.3}s",
        counts.terrace,
        counts.wall,
        counts.sliver,
        counts.error,
        diagnostics.duration.as_secs_f64()
    );
    diagnostics
}

/// Write a whole in-memory collection, geometry unchanged.
///
/// # Errors
///
/// Returns [`ExportError::Io`] or [`ExportError::Json`] when writing
/// fails.
pub fn write_collection<W: Write>(collection: Collection, writer: W) -> Result<W, ExportError> {
    let mut out = FeatureWriter::new(writer, &collection.meta)?;
    for feature in collection.features {
        out.write_geometry(feature.geometry, &feature.properties)?;
    }
    out.finish()
}
