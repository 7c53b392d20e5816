//! terrasse-io: files on disk for the terrasse pipeline.
//!
//! - [`geotiff`]: windowed GeoTIFF reads and strip-streamed BigTIFF writes
//!   behind the grid traits of `terrasse-pipeline`.
//! - [`cache`]: manifest-backed reuse of stage outputs.
//! - [`runner`]: the stage runner that ties elevation, slope, break mask
//!   and feature collection files together.

mod atomic;
pub mod cache;
pub mod geotiff;
pub mod runner;
pub mod stage;

use std::path::PathBuf;

pub use atomic::{tmp_path, write_atomically};
pub use cache::ArtifactCache;
pub use geotiff::{
    GeoTiffReader, GeoTiffSource, StripSink, TiffSample, read_geotiff_meta, write_geotiff,
};
pub use runner::{RunPaths, Runner};
pub use stage::Stage;

use terrasse_export::ExportError;
use terrasse_pipeline::{GridError, PipelineError};

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The elevation grid does not exist.
    #[error("elevation grid not found: {}", .0.display())]
    MissingElevation(PathBuf),

    /// A file could not be opened, inspected or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A grid could not be read or written.
    #[error(transparent)]
    Grid(#[from] GridError),

    /// A pipeline stage failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The feature collection could not be written or read.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// An artifact manifest could not be serialized.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}
