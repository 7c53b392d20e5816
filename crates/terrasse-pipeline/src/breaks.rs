//! Break mask: threshold a slope grid into a binary discontinuity mask.
//!
//! Stateless and block-local. The mask is written as `u8` with `0`
//! declared as no-data so that compressed storage stays sparse.

use std::time::Instant;

use image::Luma;

use crate::diagnostics::{StageDiagnostics, StageMetrics};
use crate::grid::{Block, BlockPlan, BlockSink, GridReader};
use crate::types::{GridMeta, PipelineConfig, PipelineError};

/// Mask value of a breakline pixel.
pub const BREAK: u8 = 1;

/// Mask value of everything else. Also the mask grid's no-data sentinel.
pub const BACKGROUND: u8 = 0;

/// Metadata of the mask grid derived from a slope grid.
#[must_use]
pub fn mask_meta(slope: &GridMeta) -> GridMeta {
    slope.with_nodata(Some(f64::from(BACKGROUND)))
}

/// Mark pixels whose slope is strictly above `threshold`.
///
/// NaN slopes are never marked.
#[must_use]
pub fn threshold_block(slope: &Block<f32>, threshold: f64) -> Block<u8> {
    let (width, height) = slope.dimensions();
    Block::from_fn(width, height, |col, row| {
        let v = f64::from(slope.get_pixel(col, row)[0]);
        Luma([if v > threshold { BREAK } else { BACKGROUND }])
    })
}

/// Count breakline pixels in a mask block.
#[must_use]
pub fn count_breaks(mask: &Block<u8>) -> u64 {
    mask.pixels().map(|p| u64::from(p[0] == BREAK)).sum()
}

/// Run the break-mask stage over the whole slope grid behind `reader`.
///
/// # Errors
///
/// Returns [`PipelineError::Grid`] when a read or write fails.
pub fn run_breaks<R, S>(
    reader: &mut R,
    sink: &mut S,
    config: &PipelineConfig,
) -> Result<StageDiagnostics, PipelineError>
where
    R: GridReader<f32>,
    S: BlockSink<u8>,
{
    let start = Instant::now();
    let plan = BlockPlan::for_grid(reader.meta(), config.block_size);
    log::info!(
        "breaks: threshold {} ({:?}), {} blocks",
        config.slope_threshold,
        config.slope_units,
        plan.len()
    );

    let fill = reader.meta().nodata_or(0.0);
    let mut break_pixels = 0;
    let mut total_pixels = 0;
    for window in plan.windows() {
        let slope = reader.read_window(window, fill)?;
        let mask = threshold_block(&slope, config.slope_threshold);
        break_pixels += count_breaks(&mask);
        total_pixels += window.pixel_count();
        sink.write_block(window, &mask)?;
    }

    let diagnostics = StageDiagnostics {
        duration: start.elapsed(),
        metrics: StageMetrics::Breaks {
            threshold: config.slope_threshold,
            blocks: plan.len(),
            break_pixels,
            total_pixels,
        },
    };
    log::info!(
        "breaks: {break_pixels} of {total_pixels} pixels above threshold in {:.3}s",
        diagnostics.duration.as_secs_f64()
    );
    Ok(diagnostics)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::grid::MemoryGrid;
    use crate::types::{Crs, GeoTransform};

    fn meta(width: u32, height: u32) -> GridMeta {
        GridMeta {
            width,
            height,
            transform: GeoTransform::north_up(0.0, f64::from(height), 1.0, 1.0),
            crs: Crs::LAMBERT_93,
            nodata: None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn varied_slope() -> MemoryGrid<f32> {
        MemoryGrid::from_fn(meta(13, 11), |c, r| ((c * 7 + r * 13) % 40) as f32)
    }

    #[test]
    fn threshold_is_strict() {
        let slope = Block::from_fn(3, 1, |c, _| Luma([[14.9_f32, 15.0, 15.1][c as usize]]));
        let mask = threshold_block(&slope, 15.0);
        assert_eq!(mask.as_raw(), &vec![0, 0, 1]);
    }

    #[test]
    fn nan_is_background() {
        let slope = Block::from_pixel(2, 2, Luma([f32::NAN]));
        assert_eq!(count_breaks(&threshold_block(&slope, 0.0)), 0);
    }

    #[test]
    fn mask_meta_declares_zero_nodata() {
        let m = mask_meta(&meta(4, 4));
        assert_eq!(m.nodata, Some(0.0));
        assert_eq!(m.width, 4);
    }

    #[test]
    fn raising_threshold_only_removes_pixels() {
        let slope = varied_slope();
        let mut previous: Option<Block<u8>> = None;
        for threshold in [0.0, 5.0, 15.0, 15.5, 30.0, 39.0, 45.0] {
            let mask = threshold_block(slope.data(), threshold);
            if let Some(prev) = &previous {
                for (before, after) in prev.pixels().zip(mask.pixels()) {
                    assert!(after[0] <= before[0], "pixel added at threshold {threshold}");
                }
            }
            previous = Some(mask);
        }
    }

    #[test]
    fn run_breaks_matches_whole_grid_threshold() {
        let mut slope = varied_slope();
        let whole = threshold_block(slope.data(), 20.0);
        let mut out = MemoryGrid::filled(mask_meta(slope.meta()), 0u8);
        let config = PipelineConfig {
            slope_threshold: 20.0,
            block_size: 4,
            ..PipelineConfig::default()
        };
        let diag = run_breaks(&mut slope, &mut out, &config).unwrap();
        assert_eq!(out.data(), &whole);
        let StageMetrics::Breaks {
            break_pixels,
            total_pixels,
            ..
        } = diag.metrics
        else {
            unreachable!("breaks stage reports break metrics");
        };
        assert_eq!(break_pixels, count_breaks(&whole));
        assert_eq!(total_pixels, 13 * 11);
    }

    #[test]
    fn run_breaks_is_idempotent() {
        let config = PipelineConfig::default();
        let mut slope = varied_slope();
        let mut a = MemoryGrid::filled(mask_meta(slope.meta()), 0u8);
        let mut b = MemoryGrid::filled(mask_meta(slope.meta()), 0u8);
        run_breaks(&mut slope, &mut a, &config).unwrap();
        run_breaks(&mut slope, &mut b, &config).unwrap();
        assert_eq!(a, b);
    }
}
