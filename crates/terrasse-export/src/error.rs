//! Errors from writing, reading and reprojecting feature collections.

/// Errors that can occur while exporting or rewriting a collection.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The underlying writer or reader failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A feature or header could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The input is not a GeoJSON feature collection.
    #[error("invalid feature collection: {0}")]
    Collection(String),

    /// One feature could not be decoded.
    #[error("feature {index}: {reason}")]
    Feature {
        /// Position in the collection.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A coordinate could not be transformed.
    #[error("reprojection of ({x}, {y}) failed: {reason}")]
    Reproject {
        /// Input x (easting or longitude).
        x: f64,
        /// Input y (northing or latitude).
        y: f64,
        /// Backend message.
        reason: String,
    },

    /// The projection backend could not be set up.
    #[error("projection setup failed: {0}")]
    Projection(String),
}

impl From<geojson::Error> for ExportError {
    fn from(e: geojson::Error) -> Self {
        Self::Collection(e.to_string())
    }
}
