//! Integration test: detect a synthetic terrace, export it as GeoJSON,
//! read it back and classify it against the same elevation grid.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;

use terrasse_export::{
    CRS84_URN, CollectionMeta, Proj4Reprojector, classify_collection, export_polygons,
    read_collection, write_collection,
};
use terrasse_pipeline::{
    Classification, Crs, ElevationSampler, GeoTransform, GridMeta, MemoryGrid, PipelineConfig,
};

/// 100 x 100 Lambert-93 grid of 1 m pixels, flat at 200 m, with a
/// 20 degree ramp two diagonals wide.
fn diagonal_ramp() -> MemoryGrid<f32> {
    let meta = GridMeta {
        width: 100,
        height: 100,
        transform: GeoTransform::north_up(850_000.0, 6_340_100.0, 1.0, 1.0),
        crs: Crs::LAMBERT_93,
        nodata: Some(-9999.0),
    };
    let step = 20.0_f64.to_radians().tan() / std::f64::consts::SQRT_2;
    MemoryGrid::from_fn(meta, |col, row| {
        let rise = (f64::from(col + row) - 111.0).clamp(0.0, 2.0) * step;
        #[allow(clippy::cast_possible_truncation)]
        let z = (200.0 + rise) as f32;
        z
    })
}

#[test]
fn ramp_detect_export_classify() {
    let config = PipelineConfig {
        block_size: 128,
        ..PipelineConfig::default()
    };
    let elevation = diagonal_ramp();
    let detection = terrasse_pipeline::detect(&elevation, &config).expect("detection should succeed");
    assert_eq!(detection.polygons.len(), 1);

    let lcc = Proj4Reprojector::from_epsg(2154).unwrap();
    let meta = CollectionMeta::new("terrasses", Some(CRS84_URN.to_string()), "synthetic ramp");
    let (bytes, _) = export_polygons(&detection.polygons, &lcc, &config, &meta, Vec::new()).unwrap();

    let mut collection = read_collection(bytes.as_slice()).unwrap();
    assert_eq!(collection.features.len(), 1);
    assert_eq!(collection.features[0].properties.class, None);

    let mut sampler = ElevationSampler::new(&elevation, &config);
    classify_collection(&mut collection, &lcc, Some(&mut sampler), &config);
    let props = collection.features[0].properties;
    eprintln!("classified: {props:?}");
    assert_eq!(props.class, Some(Classification::Terrace));
    assert_eq!(props.type_id, 1);
    assert!(props.compactness > 5.0);
    assert!(props.elevation_delta.unwrap() > 0.4);

    let rewritten = write_collection(collection, Vec::new()).unwrap();
    let text = String::from_utf8(rewritten).unwrap();
    assert!(text.contains("\"c\":\"t\""));

    // Keep the output around for inspection.
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf();
    let output_path = workspace_root.join("target/ramp-terrasses.geojson");
    if std::fs::create_dir_all(output_path.parent().unwrap()).is_ok() {
        std::fs::write(&output_path, &text).unwrap();
        eprintln!("GeoJSON written to {output_path:?} ({} bytes)", text.len());
    }
}
