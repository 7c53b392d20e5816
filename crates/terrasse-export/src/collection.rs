//! GeoJSON feature collections of terrace polygons.
//!
//! [`FeatureWriter`] streams a collection to any [`Write`]: the header
//! first, then one compact feature per line, then the footer. Nothing but
//! the current feature is held in memory, so output size is unbounded.
//!
//! Properties use short keys to keep multi-gigabyte outputs small:
//!
//! | key  | meaning                                 |
//! |------|-----------------------------------------|
//! | `t`  | type id, 1 terrace / 0 wall             |
//! | `c`  | class code, `"t"` or `"m"`              |
//! | `a`  | area in m², truncated                   |
//! | `p`  | perimeter in m, truncated               |
//! | `gc` | compactness, 2 decimals                 |
//! | `de` | elevation delta in m, 2 decimals        |
//!
//! `c` and `de` are only present once the classifier has run.

use std::io::{Read, Write};

use geo::Polygon;
use geojson::{Geometry, JsonObject, JsonValue};
use serde_json::json;
use terrasse_pipeline::{Classification, PolygonClass, ShapeMetrics};

use crate::ExportError;
use crate::reproject::round_to;

/// Decimals kept for `gc` and `de`.
const SCORE_DECIMALS: u32 = 2;

/// Collection-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    /// Layer name.
    pub name: String,
    /// URN of the geometry CRS.
    pub crs_urn: Option<String>,
    /// Where the data came from.
    pub source: String,
    /// Generation date, `YYYY-MM-DD`.
    pub generated: String,
}

impl CollectionMeta {
    /// Metadata stamped with today's date.
    #[must_use]
    pub fn new(name: &str, crs_urn: Option<String>, source: &str) -> Self {
        Self {
            name: name.to_string(),
            crs_urn,
            source: source.to_string(),
            generated: chrono::Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    fn from_foreign_members(members: Option<&JsonObject>) -> Self {
        let text = |value: Option<&JsonValue>| {
            value
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let member = |key: &str| members.and_then(|m| m.get(key));
        let metadata = member("metadata");
        Self {
            name: text(member("name")),
            crs_urn: member("crs")
                .and_then(|crs| crs.pointer("/properties/name"))
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            source: text(metadata.and_then(|m| m.get("source"))),
            generated: text(metadata.and_then(|m| m.get("generated"))),
        }
    }
}

/// Attributes of one feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureProperties {
    /// `t`.
    pub type_id: u8,
    /// `c`, absent before classification.
    pub class: Option<Classification>,
    /// `a`.
    pub area: i64,
    /// `p`.
    pub perimeter: i64,
    /// `gc`.
    pub compactness: f64,
    /// `de`, absent before classification.
    pub elevation_delta: Option<f64>,
}

impl FeatureProperties {
    /// Properties of a freshly exported, not yet classified polygon.
    #[must_use]
    pub fn exported(metrics: &ShapeMetrics) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let (area, perimeter) = (metrics.area as i64, metrics.perimeter as i64);
        Self {
            type_id: Classification::Terrace.type_id(),
            class: None,
            area,
            perimeter,
            compactness: round_to(metrics.compactness, SCORE_DECIMALS),
            elevation_delta: None,
        }
    }

    /// Overwrite the classification fields. Area and perimeter keep the
    /// exported values.
    pub fn apply(&mut self, class: &PolygonClass) {
        self.type_id = class.class.type_id();
        self.class = Some(class.class);
        self.compactness = round_to(class.metrics.compactness, SCORE_DECIMALS);
        self.elevation_delta = Some(round_to(class.elevation_delta, SCORE_DECIMALS));
    }

    /// Label as a wall with delta 0 without touching the scores, for
    /// features that could not be classified.
    pub const fn mark_failed(&mut self) {
        self.type_id = Classification::Wall.type_id();
        self.class = Some(Classification::Wall);
        self.elevation_delta = Some(0.0);
    }

    /// Encode with the short keys.
    #[must_use]
    pub fn to_json_object(&self) -> JsonObject {
        let mut map = JsonObject::new();
        map.insert("t".to_string(), json!(self.type_id));
        if let Some(class) = self.class {
            map.insert("c".to_string(), json!(class.code()));
        }
        map.insert("a".to_string(), json!(self.area));
        map.insert("p".to_string(), json!(self.perimeter));
        map.insert("gc".to_string(), json!(self.compactness));
        if let Some(delta) = self.elevation_delta {
            map.insert("de".to_string(), json!(delta));
        }
        map
    }

    /// Decode from the short keys.
    ///
    /// # Errors
    ///
    /// Returns a description of the first missing or mistyped key.
    pub fn from_json_object(map: &JsonObject) -> Result<Self, String> {
        let number = |key: &str| {
            map.get(key)
                .and_then(JsonValue::as_f64)
                .ok_or_else(|| format!("property {key:?} missing or not a number"))
        };
        let class = match map.get("c").map(|c| c.as_str()) {
            None => None,
            Some(Some("t")) => Some(Classification::Terrace),
            Some(Some("m")) => Some(Classification::Wall),
            Some(other) => return Err(format!("unknown class code {other:?}")),
        };
        let type_id = map
            .get("t")
            .and_then(JsonValue::as_u64)
            .and_then(|t| u8::try_from(t).ok())
            .ok_or_else(|| "property \"t\" missing or out of range".to_string())?;
        #[allow(clippy::cast_possible_truncation)]
        let (area, perimeter) = (number("a")? as i64, number("p")? as i64);
        Ok(Self {
            type_id,
            class,
            area,
            perimeter,
            compactness: number("gc")?,
            elevation_delta: map.get("de").and_then(JsonValue::as_f64),
        })
    }
}

/// One feature read back from a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionFeature {
    /// Geometry exactly as stored.
    pub geometry: Geometry,
    /// Decoded properties.
    pub properties: FeatureProperties,
}

impl CollectionFeature {
    /// The geometry as a polygon.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Collection`] if the geometry is not a
    /// polygon.
    pub fn polygon(&self) -> Result<Polygon<f64>, ExportError> {
        Ok(Polygon::try_from(self.geometry.value.clone())?)
    }
}

/// A whole collection in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    /// Collection-level metadata.
    pub meta: CollectionMeta,
    /// Features in file order.
    pub features: Vec<CollectionFeature>,
}

/// Streaming collection writer.
#[derive(Debug)]
pub struct FeatureWriter<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> FeatureWriter<W> {
    /// Write the collection header.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Io`] if the header cannot be written.
    pub fn new(mut writer: W, meta: &CollectionMeta) -> Result<Self, ExportError> {
        write!(
            writer,
            "{{\"type\":\"FeatureCollection\",\"name\":{},",
            JsonValue::from(meta.name.as_str())
        )?;
        if let Some(urn) = &meta.crs_urn {
            let crs = json!({ "type": "name", "properties": { "name": urn } });
            write!(writer, "\"crs\":{crs},")?;
        }
        let metadata = json!({ "source": meta.source, "generated": meta.generated });
        writeln!(writer, "\"metadata\":{metadata},\"features\":[")?;
        Ok(Self { writer, written: 0 })
    }

    /// Append one feature with a polygon geometry.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Io`] or [`ExportError::Json`] on write
    /// failure.
    pub fn write_polygon(
        &mut self,
        polygon: &Polygon<f64>,
        properties: &FeatureProperties,
    ) -> Result<(), ExportError> {
        self.write_geometry(Geometry::new(geojson::Value::from(polygon)), properties)
    }

    /// Append one feature with an already encoded geometry.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Io`] or [`ExportError::Json`] on write
    /// failure.
    pub fn write_geometry(
        &mut self,
        geometry: Geometry,
        properties: &FeatureProperties,
    ) -> Result<(), ExportError> {
        let feature = geojson::Feature {
            bbox: None,
            geometry: Some(geometry),
            id: None,
            properties: Some(properties.to_json_object()),
            foreign_members: None,
        };
        if self.written > 0 {
            self.writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.writer, &feature)?;
        self.written += 1;
        Ok(())
    }

    /// Features written so far.
    #[must_use]
    pub const fn written(&self) -> usize {
        self.written
    }

    /// Write the footer, flush, and hand back the writer.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Io`] if the footer cannot be written.
    pub fn finish(mut self) -> Result<W, ExportError> {
        self.writer.write_all(b"\n]}\n")?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Read a whole collection.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if the input is not a feature
/// collection and [`ExportError::Feature`] for a feature without geometry
/// or with unreadable properties.
pub fn read_collection<R: Read>(reader: R) -> Result<Collection, ExportError> {
    let collection: geojson::FeatureCollection = serde_json::from_reader(reader)?;
    let meta = CollectionMeta::from_foreign_members(collection.foreign_members.as_ref());
    let features = collection
        .features
        .into_iter()
        .enumerate()
        .map(|(index, feature)| {
            let geometry = feature.geometry.ok_or_else(|| ExportError::Feature {
                index,
                reason: "no geometry".to_string(),
            })?;
            let properties = feature
                .properties
                .as_ref()
                .ok_or_else(|| "no properties".to_string())
                .and_then(FeatureProperties::from_json_object)
                .map_err(|reason| ExportError::Feature { index, reason })?;
            Ok(CollectionFeature {
                geometry,
                properties,
            })
        })
        .collect::<Result<Vec<_>, ExportError>>()?;
    Ok(Collection { meta, features })
}
