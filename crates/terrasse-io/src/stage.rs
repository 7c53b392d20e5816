//! Stage identifiers and metadata.
//!
//! Each [`Stage`] names one step of a run. The names double as the keys of
//! the [`RunDiagnostics`](terrasse_pipeline::RunDiagnostics) records and of
//! the artifact manifests.

use std::fmt;

/// One step of a terrasse run, in execution order.
///
/// Vectorize and merge keep their polygons in memory, so they have no
/// artifact of their own and are cached together with export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Elevation grid to slope grid.
    Slope,
    /// Slope grid to break mask.
    Breaks,
    /// Break mask to per-block polygons.
    Vectorize,
    /// Global union of the block polygons.
    Merge,
    /// Simplify, filter, reproject and write the feature collection.
    Export,
    /// Classify the exported features in place.
    Classify,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 6] = [
        Self::Slope,
        Self::Breaks,
        Self::Vectorize,
        Self::Merge,
        Self::Export,
        Self::Classify,
    ];

    /// Name used in diagnostics and manifest files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Slope => "slope",
            Self::Breaks => "breaks",
            Self::Vectorize => "vectorize",
            Self::Merge => "merge",
            Self::Export => "export",
            Self::Classify => "classify",
        }
    }

    /// The stage whose artifact records this stage's output.
    #[must_use]
    pub const fn artifact_stage(self) -> Self {
        match self {
            Self::Vectorize | Self::Merge => Self::Export,
            other => other,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
