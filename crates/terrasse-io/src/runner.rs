//! Stage runner: wires files on disk to the pipeline stages.
//!
//! A run goes slope -> breaks -> vectorize + merge + export -> classify
//! over a fixed [`RunPaths`] layout. Every stage consults the
//! [`ArtifactCache`] first and reuses a fresh output. A stage whose
//! upstream artifact is missing is skipped with a logged reason; only a
//! missing elevation grid stops the run.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;

use terrasse_export::{
    CollectionMeta, Reprojector, classify_collection, export_polygons, read_collection,
    reprojector_for, write_collection,
};
use terrasse_pipeline::breaks::{mask_meta, run_breaks};
use terrasse_pipeline::merge::run_merge;
use terrasse_pipeline::slope::{run_slope, slope_meta};
use terrasse_pipeline::vectorize::run_vectorize;
use terrasse_pipeline::{
    ElevationSampler, GridReader, OverlayUnion, PipelineConfig, RunDiagnostics, StageOutcome,
};

use crate::RunError;
use crate::atomic::write_atomically;
use crate::cache::ArtifactCache;
use crate::geotiff::{GeoTiffReader, GeoTiffSource, read_geotiff_meta, write_geotiff};
use crate::stage::Stage;

/// Input elevation grid file name.
pub const ELEVATION_FILE: &str = "mnt.tif";
/// Slope grid file name.
pub const SLOPE_FILE: &str = "pente.tif";
/// Break mask file name.
pub const BREAKS_FILE: &str = "ruptures.tif";
/// Feature collection file name.
pub const FEATURES_FILE: &str = "terrasses.geojson";

/// Where a run reads and writes its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// Input elevation grid.
    pub elevation: PathBuf,
    /// Slope grid.
    pub slope: PathBuf,
    /// Break mask.
    pub breaks: PathBuf,
    /// Exported, then classified, feature collection.
    pub features: PathBuf,
}

impl RunPaths {
    /// The default layout with every file in `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::with_elevation(dir.join(ELEVATION_FILE), dir)
    }

    /// Read `elevation` and write the outputs to `output_dir`.
    #[must_use]
    pub fn with_elevation(elevation: PathBuf, output_dir: &Path) -> Self {
        Self {
            elevation,
            slope: output_dir.join(SLOPE_FILE),
            breaks: output_dir.join(BREAKS_FILE),
            features: output_dir.join(FEATURES_FILE),
        }
    }
}

/// Runs every stage against a [`RunPaths`] layout.
pub struct Runner {
    paths: RunPaths,
    config: PipelineConfig,
    cache: ArtifactCache,
    reprojector: Option<Box<dyn Reprojector>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("paths", &self.paths)
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field(
                "output_crs",
                &self.reprojector.as_ref().map(|r| r.output_crs_urn()),
            )
            .finish()
    }
}

impl Runner {
    /// A runner that reuses fresh artifacts and reprojects from the CRS
    /// the elevation grid declares to CRS84.
    #[must_use]
    pub fn new(paths: RunPaths, config: PipelineConfig) -> Self {
        Self {
            paths,
            config,
            cache: ArtifactCache::default(),
            reprojector: None,
        }
    }

    /// Recompute every stage regardless of existing artifacts.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.cache = ArtifactCache::new(force);
        self
    }

    /// Use `reprojector` instead of the one the elevation grid's CRS
    /// selects.
    #[must_use]
    pub fn with_reprojector(mut self, reprojector: Box<dyn Reprojector>) -> Self {
        self.reprojector = Some(reprojector);
        self
    }

    /// The artifact layout of this runner.
    #[must_use]
    pub const fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Run every stage and collect their diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::MissingElevation`] when the elevation grid does
    /// not exist, [`RunError::Export`] when its CRS cannot be reprojected,
    /// and any stage error that is not a per-item failure.
    pub fn run(&self) -> Result<RunDiagnostics, RunError> {
        let start = Instant::now();
        self.config.validate()?;
        if !self.paths.elevation.is_file() {
            return Err(RunError::MissingElevation(self.paths.elevation.clone()));
        }
        log::info!(
            "run: {} (config {:016x})",
            self.paths.elevation.display(),
            self.config.fingerprint()
        );
        let resolved;
        let reprojector: &dyn Reprojector = if let Some(r) = &self.reprojector {
            r.as_ref()
        } else {
            let crs = read_geotiff_meta(&self.paths.elevation)?.crs;
            resolved = reprojector_for(crs)?;
            log::info!("run: reprojecting {crs:?} to {}", resolved.output_crs_urn());
            resolved.as_ref()
        };

        let mut diagnostics = RunDiagnostics::default();
        diagnostics.push(Stage::Slope.name(), self.slope()?);
        diagnostics.push(Stage::Breaks.name(), self.breaks()?);
        for (stage, outcome) in self.vectorize_merge_export(reprojector)? {
            diagnostics.push(stage.name(), outcome);
        }
        diagnostics.push(Stage::Classify.name(), self.classify(reprojector)?);
        diagnostics.total_duration = start.elapsed();
        log::info!("run: done in {:.3}s", diagnostics.total_duration.as_secs_f64());
        Ok(diagnostics)
    }

    /// `Some(outcome)` when `stage` can be skipped: its output is fresh,
    /// or one of its inputs is missing.
    fn precheck(&self, stage: Stage, output: &Path, inputs: &[&Path]) -> Option<StageOutcome> {
        if let Some(missing) = inputs.iter().find(|p| !p.is_file()) {
            let reason = format!("missing input {}", missing.display());
            log::warn!("{stage}: skipped, {reason}");
            return Some(StageOutcome::Skipped { reason });
        }
        if self
            .cache
            .is_fresh(stage, output, inputs, self.config.fingerprint())
        {
            log::info!("{stage}: {} is up to date, reusing it", output.display());
            return Some(StageOutcome::Cached);
        }
        None
    }

    fn record(&self, stage: Stage, output: &Path, inputs: &[&Path]) -> Result<(), RunError> {
        self.cache
            .record(stage, output, inputs, self.config.fingerprint())
    }

    fn slope(&self) -> Result<StageOutcome, RunError> {
        let inputs = [self.paths.elevation.as_path()];
        if let Some(outcome) = self.precheck(Stage::Slope, &self.paths.slope, &inputs) {
            return Ok(outcome);
        }
        self.cache.invalidate(Stage::Slope, &self.paths.slope)?;

        let mut reader = GeoTiffReader::<f32>::open(&self.paths.elevation)?;
        let meta = slope_meta(reader.meta());
        let diagnostics = write_geotiff::<f32, _, _, _>(
            &self.paths.slope,
            &meta,
            self.config.block_size,
            |sink| run_slope(&mut reader, sink, &self.config),
        )?;
        self.record(Stage::Slope, &self.paths.slope, &inputs)?;
        Ok(StageOutcome::Ran(diagnostics))
    }

    fn breaks(&self) -> Result<StageOutcome, RunError> {
        let inputs = [self.paths.slope.as_path()];
        if let Some(outcome) = self.precheck(Stage::Breaks, &self.paths.breaks, &inputs) {
            return Ok(outcome);
        }
        self.cache.invalidate(Stage::Breaks, &self.paths.breaks)?;

        let mut reader = GeoTiffReader::<f32>::open(&self.paths.slope)?;
        let meta = mask_meta(reader.meta());
        let diagnostics = write_geotiff::<u8, _, _, _>(
            &self.paths.breaks,
            &meta,
            self.config.block_size,
            |sink| run_breaks(&mut reader, sink, &self.config),
        )?;
        self.record(Stage::Breaks, &self.paths.breaks, &inputs)?;
        Ok(StageOutcome::Ran(diagnostics))
    }

    /// Vectorize and merge keep their results in memory, so all three
    /// stages share the export artifact.
    fn vectorize_merge_export(
        &self,
        reprojector: &dyn Reprojector,
    ) -> Result<Vec<(Stage, StageOutcome)>, RunError> {
        let inputs = [self.paths.breaks.as_path()];
        let output = &self.paths.features;
        if let Some(outcome) = self.precheck(Stage::Export, output, &inputs) {
            return Ok(Stage::ALL
                .into_iter()
                .filter(|stage| stage.artifact_stage() == Stage::Export)
                .map(|stage| (stage, outcome.clone()))
                .collect());
        }
        self.cache.invalidate(Stage::Export, output)?;
        self.cache.invalidate(Stage::Classify, output)?;

        let source = GeoTiffSource::<u8>::from_path(&self.paths.breaks)?;
        let (report, vectorized) = run_vectorize(&source, &self.config)?;
        let (merged, merge) = run_merge(report.polygons, &OverlayUnion, self.config.union_chunk_size)?;

        let meta = CollectionMeta::new(
            "terrasses",
            Some(reprojector.output_crs_urn()),
            &self.paths.elevation.display().to_string(),
        );
        let export = write_atomically(output, |tmp| {
            let file = File::create(tmp).map_err(|source| RunError::Io {
                path: tmp.to_path_buf(),
                source,
            })?;
            let (_, diagnostics) = export_polygons(
                &merged.polygons,
                reprojector,
                &self.config,
                &meta,
                BufWriter::new(file),
            )?;
            Ok::<_, RunError>(diagnostics)
        })?;
        self.record(Stage::Export, output, &inputs)?;

        Ok(vec![
            (Stage::Vectorize, StageOutcome::Ran(vectorized)),
            (Stage::Merge, StageOutcome::Ran(merge)),
            (Stage::Export, StageOutcome::Ran(export)),
        ])
    }

    fn classify(&self, reprojector: &dyn Reprojector) -> Result<StageOutcome, RunError> {
        let features = &self.paths.features;
        let inputs = [self.paths.elevation.as_path(), features.as_path()];
        if let Some(outcome) = self.precheck(Stage::Classify, features, &inputs) {
            return Ok(outcome);
        }
        self.cache.invalidate(Stage::Classify, features)?;

        let file = File::open(features).map_err(|source| RunError::Io {
            path: features.clone(),
            source,
        })?;
        let mut collection = read_collection(BufReader::new(file))?;
        let reader = GeoTiffReader::<f32>::open(&self.paths.elevation)?;
        let mut sampler = ElevationSampler::new(reader, &self.config);
        let diagnostics = classify_collection(
            &mut collection,
            reprojector,
            Some(&mut sampler),
            &self.config,
        );

        write_atomically(features, |tmp| {
            let file = File::create(tmp).map_err(|source| RunError::Io {
                path: tmp.to_path_buf(),
                source,
            })?;
            write_collection(collection, BufWriter::new(file))?;
            Ok::<_, RunError>(())
        })?;
        self.record(Stage::Classify, features, &inputs)?;
        Ok(StageOutcome::Ran(diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_names() {
        let paths = RunPaths::in_dir(Path::new("zone"));
        assert_eq!(paths.elevation, Path::new("zone/mnt.tif"));
        assert_eq!(paths.slope, Path::new("zone/pente.tif"));
        assert_eq!(paths.breaks, Path::new("zone/ruptures.tif"));
        assert_eq!(paths.features, Path::new("zone/terrasses.geojson"));
    }

    #[test]
    fn outputs_follow_output_dir() {
        let paths = RunPaths::with_elevation(PathBuf::from("in/dem.tif"), Path::new("out"));
        assert_eq!(paths.elevation, Path::new("in/dem.tif"));
        assert_eq!(paths.features, Path::new("out/terrasses.geojson"));
    }

    #[test]
    fn missing_elevation_is_fatal() {
        let paths = RunPaths::in_dir(Path::new("definitely/not/here"));
        let result = Runner::new(paths, PipelineConfig::default()).run();
        assert!(matches!(result, Err(RunError::MissingElevation(_))));
    }
}
