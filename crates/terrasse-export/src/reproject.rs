//! Reprojection between the working CRS and the output CRS.
//!
//! Area and length are always measured in the working CRS (projected,
//! metres). Exported geometry is geographic longitude/latitude. The
//! [`Reprojector`] trait covers both directions so the classifier can
//! bring exported geometry back for measurement.
//!
//! [`reprojector_for`] builds the transform from the CRS the elevation
//! grid declares. The default backend is [`Proj4Reprojector`] (pure Rust,
//! EPSG definitions bundled); the optional `proj` feature switches to
//! [`ProjReprojector`] backed by the PROJ library.

use geo::{Coord, MapCoords, Polygon};
use terrasse_pipeline::Crs;

use crate::ExportError;

/// URN of geographic longitude/latitude on WGS84.
pub const CRS84_URN: &str = "urn:ogc:def:crs:OGC:1.3:CRS84";

/// Two-way coordinate conversion between working and output CRS.
pub trait Reprojector {
    /// Working CRS to output CRS.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Reproject`] if the point cannot be
    /// transformed.
    fn to_output(&self, working: Coord<f64>) -> Result<Coord<f64>, ExportError>;

    /// Output CRS back to working CRS.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Reproject`] if the point cannot be
    /// transformed.
    fn to_working(&self, output: Coord<f64>) -> Result<Coord<f64>, ExportError>;

    /// URN written into the collection's `crs` member.
    fn output_crs_urn(&self) -> String;
}

/// Reprojection from `working` to CRS84.
///
/// # Errors
///
/// Returns [`ExportError::Projection`] when `working` is
/// [`Crs::Unknown`] or the backend has no definition for its code.
pub fn reprojector_for(working: Crs) -> Result<Box<dyn Reprojector>, ExportError> {
    let Crs::Epsg(code) = working else {
        return Err(ExportError::Projection(
            "the grid declares no CRS; cannot reproject to longitude/latitude".to_string(),
        ));
    };
    #[cfg(feature = "proj")]
    let reprojector = ProjReprojector::from_epsg(code)?;
    #[cfg(not(feature = "proj"))]
    let reprojector = Proj4Reprojector::from_epsg(code)?;
    log::debug!("reproject: EPSG:{code} -> {CRS84_URN}");
    Ok(Box::new(reprojector))
}

/// Transform every vertex of `polygon` to the output CRS.
///
/// # Errors
///
/// Fails on the first vertex that cannot be transformed.
pub fn polygon_to_output<R: Reprojector + ?Sized>(
    reprojector: &R,
    polygon: &Polygon<f64>,
) -> Result<Polygon<f64>, ExportError> {
    polygon.try_map_coords(|c| reprojector.to_output(c))
}

/// Transform every vertex of `polygon` back to the working CRS.
///
/// # Errors
///
/// Fails on the first vertex that cannot be transformed.
pub fn polygon_to_working<R: Reprojector + ?Sized>(
    reprojector: &R,
    polygon: &Polygon<f64>,
) -> Result<Polygon<f64>, ExportError> {
    polygon.try_map_coords(|c| reprojector.to_working(c))
}

/// Round `value` to `decimals` decimal places.
#[must_use]
pub fn round_to(value: f64, decimals: u32) -> f64 {
    #[allow(clippy::cast_possible_wrap)]
    let scale = 10_f64.powi(decimals as i32);
    (value * scale).round() / scale
}

/// Round every vertex of `polygon` to `decimals` decimal places.
#[must_use]
pub fn round_polygon(polygon: &Polygon<f64>, decimals: u32) -> Polygon<f64> {
    polygon.map_coords(|c| Coord {
        x: round_to(c.x, decimals),
        y: round_to(c.y, decimals),
    })
}

fn checked(input: Coord<f64>, output: Coord<f64>) -> Result<Coord<f64>, ExportError> {
    if output.x.is_finite() && output.y.is_finite() {
        Ok(output)
    } else {
        Err(ExportError::Reproject {
            x: input.x,
            y: input.y,
            reason: "result is not finite".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// proj4rs
// ---------------------------------------------------------------------------

/// WGS84 longitude/latitude, the output side of every transform.
const LONGLAT_WGS84: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Reprojection through `proj4rs`, from an EPSG code to CRS84.
pub struct Proj4Reprojector {
    code: u16,
    working: proj4rs::Proj,
    output: proj4rs::Proj,
}

impl std::fmt::Debug for Proj4Reprojector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proj4Reprojector")
            .field("code", &self.code)
            .field("working", &self.working.projname())
            .finish_non_exhaustive()
    }
}

impl Proj4Reprojector {
    /// Transform between EPSG `code` and CRS84.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Projection`] when the code is unknown to
    /// the bundled EPSG definitions.
    pub fn from_epsg(code: u32) -> Result<Self, ExportError> {
        let setup = |reason: String| ExportError::Projection(format!("EPSG:{code}: {reason}"));
        let short = u16::try_from(code).map_err(|_| setup("code out of range".to_string()))?;
        let working = proj4rs::Proj::from_epsg_code(short).map_err(|e| setup(e.to_string()))?;
        let output =
            proj4rs::Proj::from_proj_string(LONGLAT_WGS84).map_err(|e| setup(e.to_string()))?;
        Ok(Self {
            code: short,
            working,
            output,
        })
    }

    /// Geographic CRSs take and return degrees; `proj4rs` works in radians.
    fn convert(
        from: &proj4rs::Proj,
        to: &proj4rs::Proj,
        c: Coord<f64>,
    ) -> Result<Coord<f64>, ExportError> {
        let mut point = if from.is_latlong() {
            (c.x.to_radians(), c.y.to_radians(), 0.0)
        } else {
            (c.x, c.y, 0.0)
        };
        proj4rs::transform::transform(from, to, &mut point).map_err(|e| {
            ExportError::Reproject {
                x: c.x,
                y: c.y,
                reason: e.to_string(),
            }
        })?;
        let out = if to.is_latlong() {
            Coord {
                x: point.0.to_degrees(),
                y: point.1.to_degrees(),
            }
        } else {
            Coord {
                x: point.0,
                y: point.1,
            }
        };
        checked(c, out)
    }
}

impl Reprojector for Proj4Reprojector {
    fn to_output(&self, working: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        Self::convert(&self.working, &self.output, working)
    }

    fn to_working(&self, output: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        Self::convert(&self.output, &self.working, output)
    }

    fn output_crs_urn(&self) -> String {
        CRS84_URN.to_string()
    }
}

/// No-op reprojection for data already in its final CRS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// URN of the CRS the data is in.
    pub urn: String,
}

impl Reprojector for Identity {
    fn to_output(&self, working: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        Ok(working)
    }

    fn to_working(&self, output: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        Ok(output)
    }

    fn output_crs_urn(&self) -> String {
        self.urn.clone()
    }
}

// ---------------------------------------------------------------------------
// PROJ
// ---------------------------------------------------------------------------

/// Reprojection through PROJ.
#[cfg(feature = "proj")]
pub struct ProjReprojector {
    forward: proj::Proj,
    backward: proj::Proj,
    urn: String,
}

#[cfg(feature = "proj")]
impl std::fmt::Debug for ProjReprojector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjReprojector")
            .field("urn", &self.urn)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "proj")]
impl ProjReprojector {
    /// Build both directions between two CRS definitions PROJ accepts
    /// (e.g. `"EPSG:2154"`, `"OGC:CRS84"`).
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Projection`] if PROJ rejects either CRS.
    pub fn new(working: &str, output: &str, output_urn: &str) -> Result<Self, ExportError> {
        let build = |from: &str, to: &str| {
            proj::Proj::new_known_crs(from, to, None)
                .map_err(|e| ExportError::Projection(format!("{from} -> {to}: {e}")))
        };
        Ok(Self {
            forward: build(working, output)?,
            backward: build(output, working)?,
            urn: output_urn.to_string(),
        })
    }

    /// EPSG `code` to CRS84 (longitude first).
    ///
    /// # Errors
    ///
    /// See [`ProjReprojector::new`].
    pub fn from_epsg(code: u32) -> Result<Self, ExportError> {
        Self::new(&format!("EPSG:{code}"), "OGC:CRS84", CRS84_URN)
    }

    fn convert(p: &proj::Proj, c: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        let (x, y) = p.convert((c.x, c.y)).map_err(|e| ExportError::Reproject {
            x: c.x,
            y: c.y,
            reason: e.to_string(),
        })?;
        checked(c, Coord { x, y })
    }
}

#[cfg(feature = "proj")]
impl Reprojector for ProjReprojector {
    fn to_output(&self, working: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        Self::convert(&self.forward, working)
    }

    fn to_working(&self, output: Coord<f64>) -> Result<Coord<f64>, ExportError> {
        Self::convert(&self.backward, output)
    }

    fn output_crs_urn(&self) -> String {
        self.urn.clone()
    }
}
