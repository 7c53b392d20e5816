//! Slope computation over padded elevation blocks.
//!
//! Each block is read with a [`PipelineConfig::slope_padding`] margin so
//! the 3x3 Sobel kernel sees real neighbours at block seams, then cropped
//! back to the block extent before it is written. Only the grid's true
//! outer edge lacks context; there the boundless read fills with NaN and
//! the affected pixels get slope 0.

use std::time::Instant;

use image::Luma;
use imageproc::filter::filter_clamped;
use imageproc::kernel::Kernel;

use crate::diagnostics::{StageDiagnostics, StageMetrics};
use crate::grid::{Block, BlockPlan, BlockSink, GridReader, is_missing};
use crate::types::{GridMeta, PipelineConfig, PipelineError, SlopeUnits, Window};

/// Sobel kernel, east minus west.
const SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];

/// Sobel kernel, south minus north (rows grow southward).
const SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];

/// Sum of the Sobel weights on one side of the kernel.
const SOBEL_NORM: f64 = 8.0;

/// Metadata of the slope grid derived from an elevation grid.
///
/// Same georeferencing; no sentinel since missing elevation becomes 0.
#[must_use]
pub fn slope_meta(elevation: &GridMeta) -> GridMeta {
    elevation.with_nodata(None)
}

/// Slope of every pixel of `elevation`.
///
/// Pixels on the block border, and pixels whose 3x3 support touches NaN
/// or `nodata`, get slope 0. `pixel_x` and `pixel_y` are the ground size
/// of one pixel and only matter for [`SlopeUnits::Degrees`].
#[must_use]
pub fn slope_block(
    elevation: &Block<f32>,
    pixel_x: f64,
    pixel_y: f64,
    nodata: Option<f64>,
    units: SlopeUnits,
) -> Block<f32> {
    let (width, height) = elevation.dimensions();
    let mut out = Block::new(width, height);
    if width < 3 || height < 3 {
        return out;
    }

    // Heights relative to the first valid sample keep the f32 sums exact
    // enough; missing samples become NaN and spread to every support
    // they fall in.
    let datum = elevation
        .pixels()
        .map(|p| p[0])
        .find(|&v| !is_missing(v, nodata))
        .unwrap_or(0.0);
    let mut relative = elevation.clone();
    for p in relative.pixels_mut() {
        p[0] = if is_missing(p[0], nodata) {
            f32::NAN
        } else {
            p[0] - datum
        };
    }
    let gx: Block<f32> = filter_clamped(&relative, Kernel::new(&SOBEL_X, 3, 3));
    let gy: Block<f32> = filter_clamped(&relative, Kernel::new(&SOBEL_Y, 3, 3));

    for row in 1..height - 1 {
        for col in 1..width - 1 {
            let gx = f64::from(gx.get_pixel(col, row)[0]);
            let gy = f64::from(gy.get_pixel(col, row)[0]);
            if !(gx.is_finite() && gy.is_finite()) {
                continue;
            }
            let value = match units {
                SlopeUnits::Degrees => {
                    let dzdx = gx / (SOBEL_NORM * pixel_x);
                    let dzdy = gy / (SOBEL_NORM * pixel_y);
                    dzdx.hypot(dzdy).atan().to_degrees()
                }
                SlopeUnits::RawGradient => gx.hypot(gy),
            };
            #[allow(clippy::cast_possible_truncation)]
            out.put_pixel(col, row, Luma([value as f32]));
        }
    }
    out
}

/// Slope of one plan block: padded read, slope, crop.
///
/// When the cropped result does not have the block's shape a zero block
/// is returned instead and `substituted` is reported as `true`.
///
/// # Errors
///
/// Propagates read failures from `reader`.
pub fn compute_slope_block<R: GridReader<f32>>(
    reader: &mut R,
    window: Window,
    config: &PipelineConfig,
) -> Result<(Block<f32>, bool), PipelineError> {
    let pad = config.slope_padding;
    let padded = reader.read_window(window.padded(pad), f32::NAN)?;
    let meta = reader.meta();
    let slope = slope_block(
        &padded,
        meta.transform.pixel_size_x(),
        meta.transform.pixel_size_y(),
        meta.nodata,
        config.slope_units,
    );

    let cropped = image::imageops::crop_imm(&slope, pad, pad, window.width, window.height).to_image();
    if cropped.dimensions() == (window.width, window.height) {
        Ok((cropped, false))
    } else {
        log::warn!(
            "slope block {window:?} cropped to {:?}, substituting zeros",
            cropped.dimensions()
        );
        Ok((Block::new(window.width, window.height), true))
    }
}

/// Run the slope stage over the whole grid behind `reader`, writing each
/// block into `sink` in plan order.
///
/// # Errors
///
/// Returns [`PipelineError::Grid`] when a read or write fails.
pub fn run_slope<R, S>(
    reader: &mut R,
    sink: &mut S,
    config: &PipelineConfig,
) -> Result<StageDiagnostics, PipelineError>
where
    R: GridReader<f32>,
    S: BlockSink<f32>,
{
    let start = Instant::now();
    let plan = BlockPlan::for_grid(reader.meta(), config.block_size);
    log::info!(
        "slope: {}x{} grid, {} blocks, padding {}",
        reader.meta().width,
        reader.meta().height,
        plan.len(),
        config.slope_padding
    );

    let mut substituted_blocks = 0;
    let mut max_slope = 0.0_f32;
    for window in plan.windows() {
        let (block, substituted) = compute_slope_block(reader, window, config)?;
        substituted_blocks += usize::from(substituted);
        max_slope = block.pixels().map(|p| p[0]).fold(max_slope, f32::max);
        sink.write_block(window, &block)?;
    }

    let diagnostics = StageDiagnostics {
        duration: start.elapsed(),
        metrics: StageMetrics::Slope {
            blocks: plan.len(),
            substituted_blocks,
            padding: config.slope_padding,
            max_slope: f64::from(max_slope),
        },
    };
    log::info!("slope: done in {:.3}s", diagnostics.duration.as_secs_f64());
    Ok(diagnostics)
}
