//! terrasse-export: feature collection output (sans-IO).
//!
//! Writes merged polygons as a streaming GeoJSON feature collection in
//! the output CRS, reads it back, and rewrites it with classification
//! properties. Everything works on [`std::io::Write`] / [`std::io::Read`];
//! opening files and atomic renames live in `terrasse-io`.

pub mod collection;
mod error;
pub mod exporter;
pub mod reproject;

pub use collection::{
    Collection, CollectionFeature, CollectionMeta, FeatureProperties, FeatureWriter,
    read_collection,
};
pub use error::ExportError;
pub use exporter::{classify_collection, export_polygons, write_collection};
pub use reproject::{CRS84_URN, Identity, Proj4Reprojector, Reprojector, reprojector_for};

#[cfg(feature = "proj")]
pub use reproject::ProjReprojector;
