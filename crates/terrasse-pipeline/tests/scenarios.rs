//! Integration tests: whole-stage scenarios on synthetic in-memory grids.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use geo::Area;
use terrasse_pipeline::diagnostics::StageMetrics;
use terrasse_pipeline::types::VectorizePolicy;
use terrasse_pipeline::{
    Classification, ClassifyOutcome, Crs, GeoTransform, GridMeta, MemoryGrid, PipelineConfig,
    StageOutcome, UnionStrategy,
};

fn lambert_meta(width: u32, height: u32, nodata: Option<f64>) -> GridMeta {
    GridMeta {
        width,
        height,
        transform: GeoTransform::north_up(850_000.0, 6_340_000.0, 1.0, 1.0),
        crs: Crs::LAMBERT_93,
        nodata,
    }
}

/// Height gained per diagonal step so the ramp itself is 20 degrees.
fn ramp_step() -> f64 {
    20.0_f64.to_radians().tan() / std::f64::consts::SQRT_2
}

/// 100 x 100 grid of 1 m pixels, flat at 200 m, with a 20 degree ramp
/// two diagonals wide starting at `col + row = 111`. Only the middle diagonal of the ramp
/// exceeds 15 degrees after the Sobel kernel smooths it.
fn diagonal_ramp() -> MemoryGrid<f32> {
    let step = ramp_step();
    MemoryGrid::from_fn(lambert_meta(100, 100, Some(-9999.0)), |col, row| {
        let s = f64::from(col + row);
        let rise = (s - 111.0).clamp(0.0, 2.0) * step;
        #[allow(clippy::cast_possible_truncation)]
        let z = (200.0 + rise) as f32;
        z
    })
}

fn stage_metrics<'a>(
    detection: &'a terrasse_pipeline::Detection,
    name: &str,
) -> &'a StageMetrics {
    match detection.diagnostics.stage(name) {
        Some(StageOutcome::Ran(diag)) => &diag.metrics,
        other => unreachable!("stage {name} did not run: {other:?}"),
    }
}

#[test]
fn diagonal_ramp_becomes_one_terrace() {
    let config = PipelineConfig {
        block_size: 128,
        ..PipelineConfig::default()
    };
    let detection = terrasse_pipeline::detect(&diagonal_ramp(), &config).unwrap();

    // One mask region: the middle diagonal, minus the grid border pixels.
    let mut breaks = 0;
    for row in 0..100 {
        for col in 0..100 {
            if detection.breaks.get(col, row) == Some(1) {
                assert_eq!(col + row, 112, "stray break at ({col}, {row})");
                breaks += 1;
            }
        }
    }
    assert_eq!(breaks, 85);

    assert_eq!(detection.polygons.len(), 1);
    assert_eq!(detection.classes.len(), 1);
    let class = &detection.classes[0];
    assert_eq!(class.outcome, ClassifyOutcome::Classified);
    assert!(class.metrics.compactness > 5.0, "gc {}", class.metrics.compactness);
    assert_eq!(class.class, Classification::Terrace);

    // The probe straddles the ramp: flat bottom against flat top.
    assert_eq!(class.probe_stations, 3);
    assert!((class.elevation_delta - 2.0 * ramp_step()).abs() < 1e-3);

    assert!(matches!(
        stage_metrics(&detection, "classify"),
        StageMetrics::Classify { features: 1, counts, probed: 1 } if counts.terrace == 1
    ));
}

#[test]
fn ramp_across_block_seams_still_merges() {
    let config = PipelineConfig {
        block_size: 32,
        ..PipelineConfig::default()
    };
    let detection = terrasse_pipeline::detect(&diagonal_ramp(), &config).unwrap();
    assert_eq!(detection.polygons.len(), 1);
    assert!(matches!(
        stage_metrics(&detection, "vectorize"),
        StageMetrics::Vectorize { blocks: 16, failed_blocks: 0, .. }
    ));
}

#[test]
fn flat_grid_yields_no_features() {
    let flat = MemoryGrid::filled(lambert_meta(64, 64, Some(-9999.0)), 312.5_f32);
    let detection = terrasse_pipeline::detect(&flat, &PipelineConfig::default()).unwrap();
    assert!(detection.polygons.is_empty());
    assert!(detection.classes.is_empty());
    assert!(matches!(
        stage_metrics(&detection, "merge"),
        StageMetrics::Merge { input: 0, output: 0, strategy } if strategy == &format!("{:?}", UnionStrategy::Empty)
    ));
    assert!(matches!(
        stage_metrics(&detection, "breaks"),
        StageMetrics::Breaks { break_pixels: 0, .. }
    ));
}

#[test]
fn nodata_holes_do_not_create_cliffs() {
    let meta = lambert_meta(48, 48, Some(-9999.0));
    let grid = MemoryGrid::from_fn(meta, |col, row| {
        if (20..28).contains(&col) && (20..28).contains(&row) {
            -9999.0
        } else {
            150.0
        }
    });
    let detection = terrasse_pipeline::detect(&grid, &PipelineConfig::default()).unwrap();
    assert!(detection.polygons.is_empty());
}

/// Two 3 x 5 fragments (15 m2 each) on either side of a block seam, two
/// pixels apart. The left block sees the right fragment through its
/// padding, so closing merges them there; the right block alone only
/// sees a fragment below the area floor.
fn seam_fragments() -> MemoryGrid<u8> {
    MemoryGrid::from_fn(lambert_meta(32, 16, Some(0.0)), |col, row| {
        let rows = (5..10).contains(&row);
        u8::from(rows && ((11..14).contains(&col) || (16..19).contains(&col)))
    })
}

#[test]
fn fragments_merge_across_seam_before_area_floor() {
    let config = PipelineConfig {
        block_size: 16,
        ..PipelineConfig::default()
    };
    let mask = seam_fragments();
    let (report, _) = terrasse_pipeline::vectorize::run_vectorize(&mask, &config).unwrap();
    assert_eq!(report.blocks, 2);
    assert_eq!(report.polygons.len(), 1);
    assert_eq!(report.rejected.too_small, 1);

    let (merged, _) = terrasse_pipeline::merge::run_merge(
        report.polygons,
        &terrasse_pipeline::OverlayUnion,
        config.union_chunk_size,
    )
    .unwrap();
    assert_eq!(merged.polygons.len(), 1);
    let area = merged.polygons[0].unsigned_area();
    assert!(area >= config.min_area, "merged area {area}");
    assert!(area > 30.0 && area < 40.0, "merged area {area}");
}

#[test]
fn fragments_policy_loses_seam_fragments() {
    let config = PipelineConfig {
        block_size: 16,
        vectorize_policy: VectorizePolicy::Fragments,
        ..PipelineConfig::default()
    };
    let (report, _) = terrasse_pipeline::vectorize::run_vectorize(&seam_fragments(), &config).unwrap();
    assert!(report.polygons.is_empty());
    assert!(report.rejected.too_small >= 2);
}
