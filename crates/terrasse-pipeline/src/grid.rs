//! Windowed access to georeferenced single-band grids.
//!
//! Stages never see files. They pull padded blocks through a
//! [`GridReader`], push finished blocks into a [`BlockSink`], and, when
//! work fans out to a worker pool, ask a [`GridSource`] for one
//! independent reader per worker. [`MemoryGrid`] implements all three and
//! backs the tests; the GeoTIFF backend lives in `terrasse-io`.

use image::{ImageBuffer, Luma};

use crate::types::{GridError, GridMeta, Window};

/// Sample types a grid may hold: `f32` for elevation and slope, `u8` for
/// masks.
pub trait Sample: image::Primitive + Send + Sync + 'static {
    /// Widen to `f64` for comparisons against no-data sentinels.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`, saturating for integer types.
    fn from_f64(value: f64) -> Self;
}

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as Self
    }
}

impl Sample for u8 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_f64(value: f64) -> Self {
        value.clamp(0.0, 255.0) as Self
    }
}

/// A rectangular block of samples, row-major.
pub type Block<T> = ImageBuffer<Luma<T>, Vec<T>>;

/// Boundless windowed reads from one grid.
pub trait GridReader<T: Sample> {
    /// Georeferencing and size of the grid.
    fn meta(&self) -> &GridMeta;

    /// Read `window`, which may extend past the grid. Samples outside the
    /// grid are set to `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] when the backend cannot produce the samples.
    fn read_window(&mut self, window: Window, fill: T) -> Result<Block<T>, GridError>;
}

/// Destination of blocks produced by a stage, fed in [`BlockPlan`] order.
pub trait BlockSink<T: Sample> {
    /// Store `block` at `window`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] when the block does not fit the window or the
    /// backend fails.
    fn write_block(&mut self, window: Window, block: &Block<T>) -> Result<(), GridError>;
}

/// Something that can hand out independent readers, one per worker.
pub trait GridSource<T: Sample>: Sync {
    /// Reader type produced by [`open`](Self::open).
    type Reader<'a>: GridReader<T>
    where
        Self: 'a;

    /// Georeferencing and size of the grid.
    fn meta(&self) -> &GridMeta;

    /// Open a fresh reader.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] when the backing storage cannot be opened.
    fn open(&self) -> Result<Self::Reader<'_>, GridError>;
}

/// Whether `value` is missing: NaN, or equal to the grid's `nodata`
/// sentinel.
#[must_use]
pub fn is_missing<T: Sample>(value: T, nodata: Option<f64>) -> bool {
    let value = value.to_f64();
    value.is_nan() || nodata.is_some_and(|nd| value == nd)
}

/// Copy `window` out of `data`, filling everything outside `data` with
/// `fill`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn read_boundless<T: Sample>(data: &Block<T>, window: Window, fill: T) -> Block<T> {
    let mut out = Block::from_pixel(window.width, window.height, Luma([fill]));
    let extent = Window::new(0, 0, data.width(), data.height());
    let Some(overlap) = window.intersection(&extent) else {
        return out;
    };
    // Overlap offsets are non-negative and bounded by u32 dimensions.
    for row in overlap.row_off..overlap.row_end() {
        for col in overlap.col_off..overlap.col_end() {
            let value = data.get_pixel(col as u32, row as u32)[0];
            out.put_pixel(
                (col - window.col_off) as u32,
                (row - window.row_off) as u32,
                Luma([value]),
            );
        }
    }
    out
}

// ---------------------------------------------------------------------------
// In-memory grid
// ---------------------------------------------------------------------------

/// A grid held entirely in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryGrid<T: Sample> {
    meta: GridMeta,
    data: Block<T>,
}

impl<T: Sample> MemoryGrid<T> {
    /// A grid of `meta.width` x `meta.height` samples set to `fill`.
    #[must_use]
    pub fn filled(meta: GridMeta, fill: T) -> Self {
        let data = Block::from_pixel(meta.width, meta.height, Luma([fill]));
        Self { meta, data }
    }

    /// Wrap existing samples. The grid size is taken from `data`.
    #[must_use]
    pub fn from_block(meta: GridMeta, data: Block<T>) -> Self {
        let meta = GridMeta {
            width: data.width(),
            height: data.height(),
            ..meta
        };
        Self { meta, data }
    }

    /// Build a grid by evaluating `f(col, row)` for every pixel.
    #[must_use]
    pub fn from_fn(meta: GridMeta, mut f: impl FnMut(u32, u32) -> T) -> Self {
        let data = Block::from_fn(meta.width, meta.height, |col, row| Luma([f(col, row)]));
        Self { meta, data }
    }

    /// Grid metadata.
    #[must_use]
    pub const fn meta(&self) -> &GridMeta {
        &self.meta
    }

    /// All samples.
    #[must_use]
    pub const fn data(&self) -> &Block<T> {
        &self.data
    }

    /// Sample at (col, row), if inside the grid.
    #[must_use]
    pub fn get(&self, col: u32, row: u32) -> Option<T> {
        (col < self.data.width() && row < self.data.height())
            .then(|| self.data.get_pixel(col, row)[0])
    }
}

impl<T: Sample> GridReader<T> for MemoryGrid<T> {
    fn meta(&self) -> &GridMeta {
        &self.meta
    }

    fn read_window(&mut self, window: Window, fill: T) -> Result<Block<T>, GridError> {
        Ok(read_boundless(&self.data, window, fill))
    }
}

impl<T: Sample> GridReader<T> for &MemoryGrid<T> {
    fn meta(&self) -> &GridMeta {
        &self.meta
    }

    fn read_window(&mut self, window: Window, fill: T) -> Result<Block<T>, GridError> {
        Ok(read_boundless(&self.data, window, fill))
    }
}

impl<T: Sample> GridSource<T> for MemoryGrid<T> {
    type Reader<'a> = &'a Self;

    fn meta(&self) -> &GridMeta {
        &self.meta
    }

    fn open(&self) -> Result<Self::Reader<'_>, GridError> {
        Ok(self)
    }
}

impl<T: Sample> BlockSink<T> for MemoryGrid<T> {
    fn write_block(&mut self, window: Window, block: &Block<T>) -> Result<(), GridError> {
        if block.width() != window.width || block.height() != window.height {
            return Err(GridError::BlockShape {
                width: window.width,
                height: window.height,
                actual_width: block.width(),
                actual_height: block.height(),
            });
        }
        if !window.is_within(self.meta.width, self.meta.height) {
            return Err(GridError::BadWindow(window));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (col_off, row_off) = (window.col_off as u32, window.row_off as u32);
        for (col, row, pixel) in block.enumerate_pixels() {
            self.data.put_pixel(col_off + col, row_off + row, *pixel);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block plan
// ---------------------------------------------------------------------------

/// Non-overlapping windows covering a grid exactly once, row-major.
///
/// Edge blocks are clipped to the grid, so every window lies inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    width: u32,
    height: u32,
    block_size: u32,
}

impl BlockPlan {
    /// Plan for a `width` x `height` grid cut into `block_size` squares.
    /// A zero block size is treated as one pixel.
    #[must_use]
    pub const fn new(width: u32, height: u32, block_size: u32) -> Self {
        Self {
            width,
            height,
            block_size: if block_size == 0 { 1 } else { block_size },
        }
    }

    /// Plan for the grid described by `meta`.
    #[must_use]
    pub const fn for_grid(meta: &GridMeta, block_size: u32) -> Self {
        Self::new(meta.width, meta.height, block_size)
    }

    /// Block side length.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of block columns.
    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.width.div_ceil(self.block_size)
    }

    /// Number of block rows.
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.height.div_ceil(self.block_size)
    }

    /// Total number of blocks.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.cols() as usize * self.rows() as usize
    }

    /// Whether the grid is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All windows, row-major.
    pub fn windows(&self) -> impl Iterator<Item = Window> + '_ {
        let size = self.block_size;
        (0..self.rows()).flat_map(move |block_row| {
            (0..self.cols()).map(move |block_col| {
                let col = block_col * size;
                let row = block_row * size;
                Window::new(
                    i64::from(col),
                    i64::from(row),
                    size.min(self.width - col),
                    size.min(self.height - row),
                )
            })
        })
    }

    /// Windows grouped into batches of at most `batch_size`.
    #[must_use]
    pub fn batches(&self, batch_size: usize) -> Vec<Vec<Window>> {
        let windows: Vec<Window> = self.windows().collect();
        windows
            .chunks(batch_size.max(1))
            .map(<[Window]>::to_vec)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
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

    #[test]
    fn plan_covers_grid_exactly_once() {
        let plan = BlockPlan::new(10, 7, 4);
        assert_eq!(plan.cols(), 3);
        assert_eq!(plan.rows(), 2);
        assert_eq!(plan.len(), 6);

        let mut hits = vec![0u8; 70];
        for w in plan.windows() {
            assert!(w.is_within(10, 7));
            for row in w.row_off..w.row_end() {
                for col in w.col_off..w.col_end() {
                    hits[usize::try_from(row * 10 + col).unwrap()] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn plan_is_row_major() {
        let plan = BlockPlan::new(8, 8, 4);
        let offsets: Vec<(i64, i64)> = plan.windows().map(|w| (w.col_off, w.row_off)).collect();
        assert_eq!(offsets, vec![(0, 0), (4, 0), (0, 4), (4, 4)]);
    }

    #[test]
    fn batches_split_plan() {
        let plan = BlockPlan::new(10, 10, 2);
        let batches = plan.batches(7);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 25);
        assert_eq!(batches[3].len(), 4);
    }

    #[test]
    fn empty_grid_has_no_blocks() {
        let plan = BlockPlan::new(0, 5, 4);
        assert!(plan.is_empty());
        assert_eq!(plan.windows().count(), 0);
    }

    #[test]
    fn boundless_read_fills_outside() {
        let mut grid = MemoryGrid::from_fn(meta(3, 3), |c, r| {
            u8::try_from(r * 3 + c + 1).unwrap()
        });
        let block = grid.read_window(Window::new(-1, -1, 3, 3), 0).unwrap();
        assert_eq!(block.get_pixel(0, 0)[0], 0);
        assert_eq!(block.get_pixel(2, 0)[0], 0);
        assert_eq!(block.get_pixel(1, 1)[0], 1);
        assert_eq!(block.get_pixel(2, 2)[0], 5);
    }

    #[test]
    fn fully_outside_read_is_all_fill() {
        let mut grid = MemoryGrid::filled(meta(3, 3), 1.0_f32);
        let block = grid.read_window(Window::new(10, 10, 2, 2), f32::NAN).unwrap();
        assert!(block.pixels().all(|p| p[0].is_nan()));
    }

    #[test]
    fn write_block_round_trips() {
        let mut grid = MemoryGrid::filled(meta(4, 4), 0u8);
        let block = Block::from_pixel(2, 2, Luma([7u8]));
        grid.write_block(Window::new(2, 2, 2, 2), &block).unwrap();
        assert_eq!(grid.get(3, 3), Some(7));
        assert_eq!(grid.get(1, 1), Some(0));
        assert_eq!(grid.get(4, 0), None);
    }

    #[test]
    fn write_block_rejects_wrong_shape() {
        let mut grid = MemoryGrid::filled(meta(4, 4), 0u8);
        let block = Block::from_pixel(3, 2, Luma([7u8]));
        assert!(matches!(
            grid.write_block(Window::new(0, 0, 2, 2), &block),
            Err(GridError::BlockShape { .. })
        ));
    }

    #[test]
    fn write_block_rejects_out_of_bounds() {
        let mut grid = MemoryGrid::filled(meta(4, 4), 0u8);
        let block = Block::from_pixel(2, 2, Luma([7u8]));
        assert!(matches!(
            grid.write_block(Window::new(3, 3, 2, 2), &block),
            Err(GridError::BadWindow(_))
        ));
    }

    #[test]
    fn source_opens_independent_readers() {
        let grid = MemoryGrid::filled(meta(2, 2), 3u8);
        let mut a = grid.open().unwrap();
        let mut b = grid.open().unwrap();
        assert_eq!(a.read_window(Window::new(0, 0, 1, 1), 0).unwrap()[(0, 0)][0], 3);
        assert_eq!(b.read_window(Window::new(1, 1, 1, 1), 0).unwrap()[(0, 0)][0], 3);
    }

    #[test]
    fn missing_samples() {
        assert!(is_missing(f32::NAN, None));
        assert!(is_missing(-9999.0_f32, Some(-9999.0)));
        assert!(!is_missing(-9999.0_f32, None));
        assert!(!is_missing(12.5_f32, Some(-9999.0)));
        assert!(is_missing(0_u8, Some(0.0)));
        assert!(!is_missing(1_u8, Some(0.0)));
    }

    #[test]
    fn nodata_fill_follows_sample_type() {
        assert_eq!(meta(2, 2).with_nodata(Some(0.0)).nodata_or(7_u8), 0);
        assert_eq!(meta(2, 2).with_nodata(Some(-9999.0)).nodata_or(0_u8), 0);
        assert_eq!(meta(2, 2).with_nodata(None).nodata_or(7_u8), 7);
        let fill: f32 = meta(2, 2).with_nodata(Some(-9999.0)).nodata_or(f32::NAN);
        assert!((fill + 9999.0).abs() < f32::EPSILON);
    }

    #[test]
    fn u8_from_f64_saturates() {
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-4.0), 0);
        assert_eq!(u8::from_f64(1.0), 1);
    }
}
