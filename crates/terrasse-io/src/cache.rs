//! Artifact cache: decides whether a stage output can be reused.
//!
//! Each output carries a JSON manifest beside it (`<output>.<stage>.json`)
//! recording the stage, the size and modification time of every input,
//! and the configuration fingerprint. An output is fresh when it exists
//! and its manifest matches all three. A missing, unreadable or stale
//! manifest means recompute.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::RunError;
use crate::stage::Stage;

/// Size and modification time of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStamp {
    /// Input path as given to the runner.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified: u64,
}

impl InputStamp {
    /// Stamp `path` as it is on disk now.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Io`] when the file cannot be inspected.
    pub fn of(path: &Path) -> Result<Self, RunError> {
        let io = |source| RunError::Io {
            path: path.to_path_buf(),
            source,
        };
        let metadata = fs::metadata(path).map_err(io)?;
        let modified = metadata.modified().map_err(io)?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: nanos,
        })
    }
}

/// Manifest stored beside a stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Stage that produced the output.
    pub stage: String,
    /// Inputs at the time the output was produced.
    pub inputs: Vec<InputStamp>,
    /// [`PipelineConfig::fingerprint`](terrasse_pipeline::PipelineConfig::fingerprint)
    /// of the producing run.
    pub config_fingerprint: u64,
}

impl Manifest {
    fn current(stage: Stage, inputs: &[&Path], fingerprint: u64) -> Result<Self, RunError> {
        Ok(Self {
            stage: stage.artifact_stage().name().to_string(),
            inputs: inputs
                .iter()
                .map(|p| InputStamp::of(p))
                .collect::<Result<_, _>>()?,
            config_fingerprint: fingerprint,
        })
    }
}

/// Manifest-backed reuse of stage outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactCache {
    force: bool,
}

impl ArtifactCache {
    /// A cache that reuses fresh outputs, or recomputes everything when
    /// `force` is set.
    #[must_use]
    pub const fn new(force: bool) -> Self {
        Self { force }
    }

    /// Manifest path for `stage`'s output at `output`. Stages without an
    /// artifact of their own share the manifest of their artifact stage.
    #[must_use]
    pub fn manifest_path(stage: Stage, output: &Path) -> PathBuf {
        let mut name = output.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(format!(".{}.json", stage.artifact_stage().name()));
        output.with_file_name(name)
    }

    /// Whether `output` was produced by `stage` from `inputs` as they are
    /// now, under the same configuration.
    #[must_use]
    pub fn is_fresh(&self, stage: Stage, output: &Path, inputs: &[&Path], fingerprint: u64) -> bool {
        if self.force || !output.is_file() {
            return false;
        }
        let manifest_path = Self::manifest_path(stage, output);
        let stored: Manifest = match fs::read(&manifest_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
        {
            Ok(manifest) => manifest,
            Err(reason) => {
                log::debug!("{stage}: no usable manifest at {}: {reason}", manifest_path.display());
                return false;
            }
        };
        match Manifest::current(stage, inputs, fingerprint) {
            Ok(current) if current == stored => true,
            Ok(_) => {
                log::debug!("{stage}: inputs or configuration changed since {}", output.display());
                false
            }
            Err(e) => {
                log::debug!("{stage}: cannot stamp inputs: {e}");
                false
            }
        }
    }

    /// Drop the manifest of `output` before it is recomputed, so an
    /// interrupted run never pairs a new manifest with an old output.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Io`] when an existing manifest cannot be removed.
    pub fn invalidate(&self, stage: Stage, output: &Path) -> Result<(), RunError> {
        let path = Self::manifest_path(stage, output);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RunError::Io { path, source }),
        }
    }

    /// Record that `stage` just produced `output` from `inputs`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when an input cannot be stamped or the
    /// manifest cannot be written.
    pub fn record(
        &self,
        stage: Stage,
        output: &Path,
        inputs: &[&Path],
        fingerprint: u64,
    ) -> Result<(), RunError> {
        let manifest = Manifest::current(stage, inputs, fingerprint)?;
        let path = Self::manifest_path(stage, output);
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&path, json).map_err(|source| RunError::Io { path, source })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../target/cache-tests")
            .join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn manifest_sits_beside_output() {
        assert_eq!(
            ArtifactCache::manifest_path(Stage::Slope, Path::new("run/pente.tif")),
            Path::new("run/pente.tif.slope.json")
        );
    }

    #[test]
    fn in_memory_stages_read_the_export_manifest() {
        let dir = scratch("shared");
        let input = dir.join("ruptures.tif");
        let output = dir.join("terrasses.geojson");
        fs::write(&input, b"mask").unwrap();
        fs::write(&output, b"{}").unwrap();
        let cache = ArtifactCache::new(false);
        cache.record(Stage::Export, &output, &[&input], 3).unwrap();

        for stage in [Stage::Vectorize, Stage::Merge, Stage::Export] {
            assert_eq!(
                ArtifactCache::manifest_path(stage, &output),
                dir.join("terrasses.geojson.export.json")
            );
            assert!(cache.is_fresh(stage, &output, &[&input], 3), "{stage}");
        }
        assert!(!cache.is_fresh(Stage::Classify, &output, &[&input], 3));

        cache.invalidate(Stage::Merge, &output).unwrap();
        assert!(!cache.is_fresh(Stage::Export, &output, &[&input], 3));
    }

    #[test]
    fn recorded_output_is_fresh_until_inputs_change() {
        let dir = scratch("fresh");
        let input = dir.join("mnt.tif");
        let output = dir.join("pente.tif");
        fs::write(&input, b"elevation").unwrap();
        fs::write(&output, b"slope").unwrap();
        let cache = ArtifactCache::new(false);

        assert!(!cache.is_fresh(Stage::Slope, &output, &[&input], 7));
        cache.record(Stage::Slope, &output, &[&input], 7).unwrap();
        assert!(cache.is_fresh(Stage::Slope, &output, &[&input], 7));
        assert!(!cache.is_fresh(Stage::Slope, &output, &[&input], 8));
        assert!(!cache.is_fresh(Stage::Breaks, &output, &[&input], 7));

        fs::write(&input, b"elevation, edited").unwrap();
        assert!(!cache.is_fresh(Stage::Slope, &output, &[&input], 7));
    }

    #[test]
    fn force_and_missing_output_recompute() {
        let dir = scratch("force");
        let input = dir.join("mnt.tif");
        let output = dir.join("pente.tif");
        fs::write(&input, b"elevation").unwrap();
        fs::write(&output, b"slope").unwrap();
        ArtifactCache::new(false)
            .record(Stage::Slope, &output, &[&input], 1)
            .unwrap();

        assert!(!ArtifactCache::new(true).is_fresh(Stage::Slope, &output, &[&input], 1));
        fs::remove_file(&output).unwrap();
        assert!(!ArtifactCache::new(false).is_fresh(Stage::Slope, &output, &[&input], 1));
    }

    #[test]
    fn invalidate_removes_manifest() {
        let dir = scratch("invalidate");
        let input = dir.join("mnt.tif");
        let output = dir.join("pente.tif");
        fs::write(&input, b"elevation").unwrap();
        fs::write(&output, b"slope").unwrap();
        let cache = ArtifactCache::new(false);
        cache.record(Stage::Slope, &output, &[&input], 1).unwrap();

        cache.invalidate(Stage::Slope, &output).unwrap();
        assert!(!ArtifactCache::manifest_path(Stage::Slope, &output).exists());
        assert!(!cache.is_fresh(Stage::Slope, &output, &[&input], 1));
        cache.invalidate(Stage::Slope, &output).unwrap();
    }

    #[test]
    fn corrupt_manifest_is_stale() {
        let dir = scratch("corrupt");
        let input = dir.join("mnt.tif");
        let output = dir.join("pente.tif");
        fs::write(&input, b"elevation").unwrap();
        fs::write(&output, b"slope").unwrap();
        fs::write(ArtifactCache::manifest_path(Stage::Slope, &output), b"{not json").unwrap();
        assert!(!ArtifactCache::new(false).is_fresh(Stage::Slope, &output, &[&input], 1));
    }
}
