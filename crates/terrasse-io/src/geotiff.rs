//! GeoTIFF grid backend.
//!
//! Writes go through [`write_geotiff`]: a stage pushes blocks into a
//! [`StripSink`], which assembles one block row at a time into a strip and
//! hands it to an encoder thread over a bounded channel. The output is a
//! Deflate-compressed BigTIFF with one strip per block row, georeferenced
//! with `ModelPixelScale` + `ModelTiepoint` (or `ModelTransformation` for
//! rotated grids), a `GeoKeyDirectory` carrying the EPSG code, and the
//! `GDAL_NODATA` sentinel.
//!
//! Reads go through [`GeoTiffReader`], which decodes the strips or tiles a
//! window touches and keeps the last few in a small cache. Windows are
//! boundless, like every [`GridReader`].

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use image::Luma;
use terrasse_pipeline::grid::Sample;
use terrasse_pipeline::{
    Block, BlockSink, Crs, GeoTransform, GridError, GridMeta, GridReader, GridSource, Window,
};
use tiff::TiffError;
use tiff::decoder::{ChunkType, Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{ColorType, Gray8, Gray32Float};
use tiff::encoder::compression::{CompressionAlgorithm, Deflate, DeflateLevel};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKindBig, TiffValue};
use tiff::tags::{CompressionMethod, SampleFormat, Tag};

use crate::atomic::write_atomically;

/// Decoded chunks kept per reader. A block row of a striped file touches
/// one or two strips; a tiled file a handful of tiles.
const CHUNK_CACHE: usize = 4;

/// Strips queued between the producing stage and the encoder thread.
const STRIP_QUEUE: usize = 2;

// GeoTIFF and GDAL tag codes.
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey identifiers and values.
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const MODEL_PROJECTED: u16 = 1;
const MODEL_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

const PLANAR_SEPARATE: u16 = 2;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn tiff_error(e: TiffError) -> GridError {
    GridError::Backend(e.to_string())
}

fn io_error(path: &Path, e: &std::io::Error) -> GridError {
    GridError::Backend(format!("{}: {e}", path.display()))
}

// ---------------------------------------------------------------------------
// Sample types
// ---------------------------------------------------------------------------

/// Grid sample types with a GeoTIFF encoding.
pub trait TiffSample: Sample {
    /// Convert decoded samples to this type.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::UnsupportedSampleType`] when the stored type
    /// cannot be represented.
    fn decode(result: DecodingResult) -> Result<Vec<Self>, GridError>;

    /// Encode a whole image whose strips arrive on `strips`.
    ///
    /// Returns `Ok(false)` when the channel closed before every strip
    /// arrived; the file is then incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Backend`] when encoding or writing fails.
    fn write_image<W: Write + Seek>(
        writer: W,
        meta: &GridMeta,
        rows_per_strip: u32,
        strips: &Receiver<Vec<Self>>,
    ) -> Result<bool, GridError>;
}

const fn stored_type(result: &DecodingResult) -> &'static str {
    match result {
        DecodingResult::U8(_) => "u8",
        DecodingResult::U16(_) => "u16",
        DecodingResult::U32(_) => "u32",
        DecodingResult::U64(_) => "u64",
        DecodingResult::I8(_) => "i8",
        DecodingResult::I16(_) => "i16",
        DecodingResult::I32(_) => "i32",
        DecodingResult::I64(_) => "i64",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
        #[allow(unreachable_patterns)]
        _ => "unknown",
    }
}

impl TiffSample for f32 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn decode(result: DecodingResult) -> Result<Vec<Self>, GridError> {
        match result {
            DecodingResult::F32(v) => Ok(v),
            DecodingResult::F64(v) => Ok(v.into_iter().map(|x| x as Self).collect()),
            DecodingResult::U8(v) => Ok(v.into_iter().map(Self::from).collect()),
            DecodingResult::U16(v) => Ok(v.into_iter().map(Self::from).collect()),
            DecodingResult::I16(v) => Ok(v.into_iter().map(Self::from).collect()),
            DecodingResult::I32(v) => Ok(v.into_iter().map(|x| x as Self).collect()),
            DecodingResult::U32(v) => Ok(v.into_iter().map(|x| x as Self).collect()),
            other => Err(GridError::UnsupportedSampleType(format!(
                "{} elevation samples",
                stored_type(&other)
            ))),
        }
    }

    fn write_image<W: Write + Seek>(
        writer: W,
        meta: &GridMeta,
        rows_per_strip: u32,
        strips: &Receiver<Vec<Self>>,
    ) -> Result<bool, GridError> {
        write_strips::<Gray32Float, W>(writer, meta, rows_per_strip, strips)
    }
}

impl TiffSample for u8 {
    fn decode(result: DecodingResult) -> Result<Vec<Self>, GridError> {
        match result {
            DecodingResult::U8(v) => Ok(v),
            other => Err(GridError::UnsupportedSampleType(format!(
                "{} mask samples",
                stored_type(&other)
            ))),
        }
    }

    fn write_image<W: Write + Seek>(
        writer: W,
        meta: &GridMeta,
        rows_per_strip: u32,
        strips: &Receiver<Vec<Self>>,
    ) -> Result<bool, GridError> {
        write_strips::<Gray8, W>(writer, meta, rows_per_strip, strips)
    }
}

// ---------------------------------------------------------------------------
// Georeferencing tags
// ---------------------------------------------------------------------------

#[rustfmt::skip]
fn geo_keys(crs: Crs) -> Vec<u16> {
    let code = match crs {
        Crs::Epsg(code) => u16::try_from(code).ok(),
        Crs::Unknown => None,
    };
    match code {
        Some(code) if (4000..5000).contains(&code) => vec![
            1, 1, 0, 3,
            GT_MODEL_TYPE, 0, 1, MODEL_GEOGRAPHIC,
            GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
            GEOGRAPHIC_TYPE, 0, 1, code,
        ],
        Some(code) => vec![
            1, 1, 0, 3,
            GT_MODEL_TYPE, 0, 1, MODEL_PROJECTED,
            GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
            PROJECTED_CS_TYPE, 0, 1, code,
        ],
        None => vec![
            1, 1, 0, 1,
            GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
        ],
    }
}

/// EPSG code from a `GeoKeyDirectory`, projected before geographic.
fn parse_geo_keys(keys: &[u16]) -> Crs {
    let entries = || keys.get(4..).unwrap_or_default().chunks_exact(4);
    let lookup = |wanted: u16| {
        entries()
            .find(|e| e[0] == wanted && e[1] == 0)
            .map(|e| e[3])
            .filter(|&code| code != 0 && code != USER_DEFINED)
    };
    lookup(PROJECTED_CS_TYPE)
        .or_else(|| lookup(GEOGRAPHIC_TYPE))
        .map_or(Crs::Unknown, |code| Crs::Epsg(u32::from(code)))
}

fn format_nodata(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

fn write_georeference<W: Write + Seek>(
    dir: &mut DirectoryEncoder<'_, W, TiffKindBig>,
    meta: &GridMeta,
) -> Result<(), GridError> {
    let t = &meta.transform;
    if t.row_rotation == 0.0 && t.col_rotation == 0.0 {
        let scale = [t.pixel_width, -t.pixel_height, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
        dir.write_tag(tag(MODEL_PIXEL_SCALE), &scale[..])
            .map_err(tiff_error)?;
        dir.write_tag(tag(MODEL_TIEPOINT), &tiepoint[..])
            .map_err(tiff_error)?;
    } else {
        #[rustfmt::skip]
        let matrix = [
            t.pixel_width, t.row_rotation, 0.0, t.origin_x,
            t.col_rotation, t.pixel_height, 0.0, t.origin_y,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(tag(MODEL_TRANSFORMATION), &matrix[..])
            .map_err(tiff_error)?;
    }
    let keys = geo_keys(meta.crs);
    dir.write_tag(tag(GEO_KEY_DIRECTORY), keys.as_slice())
        .map_err(tiff_error)?;
    if let Some(nodata) = meta.nodata {
        dir.write_tag(tag(GDAL_NODATA), format_nodata(nodata).as_str())
            .map_err(tiff_error)?;
    }
    Ok(())
}

fn read_transform<R: std::io::Read + Seek>(
    decoder: &mut Decoder<R>,
) -> Result<GeoTransform, GridError> {
    if let Some(value) = decoder
        .find_tag(tag(MODEL_TRANSFORMATION))
        .map_err(tiff_error)?
    {
        let m = value.into_f64_vec().map_err(tiff_error)?;
        if m.len() < 8 {
            return Err(GridError::MissingGeoreference(format!(
                "ModelTransformation has {} values",
                m.len()
            )));
        }
        return Ok(GeoTransform {
            origin_x: m[3],
            pixel_width: m[0],
            row_rotation: m[1],
            origin_y: m[7],
            col_rotation: m[4],
            pixel_height: m[5],
        });
    }

    let scale = decoder
        .find_tag(tag(MODEL_PIXEL_SCALE))
        .map_err(tiff_error)?
        .map(tiff::decoder::ifd::Value::into_f64_vec)
        .transpose()
        .map_err(tiff_error)?;
    let tiepoint = decoder
        .find_tag(tag(MODEL_TIEPOINT))
        .map_err(tiff_error)?
        .map(tiff::decoder::ifd::Value::into_f64_vec)
        .transpose()
        .map_err(tiff_error)?;
    match (scale.as_deref(), tiepoint.as_deref()) {
        (Some([sx, sy, ..]), Some([i, j, _, x, y, ..])) => {
            let origin_x = i.mul_add(-sx, *x);
            let origin_y = j.mul_add(*sy, *y);
            Ok(GeoTransform::north_up(origin_x, origin_y, *sx, *sy))
        }
        _ => Err(GridError::MissingGeoreference(
            "no ModelTransformation or ModelPixelScale + ModelTiepoint".to_string(),
        )),
    }
}

fn read_meta<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<GridMeta, GridError> {
    let (width, height) = decoder.dimensions().map_err(tiff_error)?;
    let transform = read_transform(decoder)?;
    let crs = match decoder
        .find_tag(tag(GEO_KEY_DIRECTORY))
        .map_err(tiff_error)?
    {
        Some(value) => parse_geo_keys(&value.into_u16_vec().map_err(tiff_error)?),
        None => Crs::Unknown,
    };
    let nodata = match decoder.find_tag(tag(GDAL_NODATA)).map_err(tiff_error)? {
        Some(value) => {
            let text = value.into_string().map_err(tiff_error)?;
            text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .parse::<f64>()
                .ok()
        }
        None => None,
    };
    Ok(GridMeta {
        width,
        height,
        transform,
        crs,
        nodata,
    })
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Encode the strips arriving on `strips` into one BigTIFF image.
///
/// Strips are deflated here and stored as opaque bytes. The `tiff` image
/// encoder only compresses inside its whole-image `write_data`; its
/// `write_strip` stores raw samples under whatever compression tag was set.
fn write_strips<C, W>(
    writer: W,
    meta: &GridMeta,
    rows_per_strip: u32,
    strips: &Receiver<Vec<C::Inner>>,
) -> Result<bool, GridError>
where
    C: ColorType,
    W: Write + Seek,
    [C::Inner]: TiffValue,
{
    let mut encoder = TiffEncoder::new_big(writer).map_err(tiff_error)?;
    let mut dir = encoder.new_directory().map_err(tiff_error)?;
    let mut deflate = Deflate::with_level(DeflateLevel::Balanced);

    let mut offsets = Vec::new();
    let mut byte_counts = Vec::new();
    let mut compressed = Vec::new();
    for strip in strips {
        compressed.clear();
        let raw = <[C::Inner] as TiffValue>::data(strip.as_slice());
        let count = deflate
            .write_to(&mut compressed, &raw)
            .map_err(|e| GridError::Backend(format!("deflate: {e}")))?;
        offsets.push(dir.write_data(compressed.as_slice()).map_err(tiff_error)?);
        byte_counts.push(count);
    }
    let expected = meta.height.div_ceil(rows_per_strip) as usize;
    if offsets.len() < expected {
        return Ok(false);
    }

    let sample_format: Vec<u16> = C::SAMPLE_FORMAT.iter().map(SampleFormat::to_u16).collect();
    let samples_per_pixel = u16::try_from(C::BITS_PER_SAMPLE.len())
        .map_err(|_| GridError::UnsupportedSampleType("too many samples per pixel".to_string()))?;
    dir.write_tag(Tag::ImageWidth, meta.width).map_err(tiff_error)?;
    dir.write_tag(Tag::ImageLength, meta.height).map_err(tiff_error)?;
    dir.write_tag(Tag::Compression, CompressionMethod::Deflate.to_u16())
        .map_err(tiff_error)?;
    dir.write_tag(Tag::BitsPerSample, C::BITS_PER_SAMPLE)
        .map_err(tiff_error)?;
    dir.write_tag(Tag::SampleFormat, sample_format.as_slice())
        .map_err(tiff_error)?;
    dir.write_tag(Tag::PhotometricInterpretation, C::TIFF_VALUE.to_u16())
        .map_err(tiff_error)?;
    dir.write_tag(Tag::SamplesPerPixel, samples_per_pixel)
        .map_err(tiff_error)?;
    dir.write_tag(Tag::RowsPerStrip, rows_per_strip)
        .map_err(tiff_error)?;
    dir.write_tag(Tag::StripOffsets, offsets.as_slice())
        .map_err(tiff_error)?;
    dir.write_tag(Tag::StripByteCounts, byte_counts.as_slice())
        .map_err(tiff_error)?;
    write_georeference(&mut dir, meta)?;
    dir.finish().map_err(tiff_error)?;
    Ok(true)
}

/// [`BlockSink`] that assembles blocks into strips of one block row.
///
/// Blocks must arrive in [`BlockPlan`](terrasse_pipeline::BlockPlan)
/// order with the plan's block size equal to the strip height.
#[derive(Debug)]
pub struct StripSink<T: Sample> {
    width: u32,
    height: u32,
    rows_per_strip: u32,
    strip_row: u32,
    filled_cols: u32,
    buffer: Vec<T>,
    strips: SyncSender<Vec<T>>,
}

impl<T: Sample> StripSink<T> {
    fn new(meta: &GridMeta, rows_per_strip: u32, strips: SyncSender<Vec<T>>) -> Self {
        let mut sink = Self {
            width: meta.width,
            height: meta.height,
            rows_per_strip,
            strip_row: 0,
            filled_cols: 0,
            buffer: Vec::new(),
            strips,
        };
        sink.buffer = sink.empty_strip();
        sink
    }

    const fn strip_height(&self) -> u32 {
        let left = self.height - self.strip_row;
        if left < self.rows_per_strip {
            left
        } else {
            self.rows_per_strip
        }
    }

    fn empty_strip(&self) -> Vec<T> {
        vec![T::zero(); self.width as usize * self.strip_height() as usize]
    }

    fn finish(&self) -> Result<(), GridError> {
        if self.strip_row < self.height {
            return Err(GridError::Backend(format!(
                "only {} of {} rows were written",
                self.strip_row, self.height
            )));
        }
        Ok(())
    }
}

impl<T: Sample> BlockSink<T> for StripSink<T> {
    fn write_block(&mut self, window: Window, block: &Block<T>) -> Result<(), GridError> {
        if block.width() != window.width || block.height() != window.height {
            return Err(GridError::BlockShape {
                width: window.width,
                height: window.height,
                actual_width: block.width(),
                actual_height: block.height(),
            });
        }
        let in_order = window.row_off == i64::from(self.strip_row)
            && window.col_off == i64::from(self.filled_cols)
            && window.height == self.strip_height()
            && window.col_end() <= i64::from(self.width)
            && self.strip_row < self.height;
        if !in_order {
            return Err(GridError::BadWindow(window));
        }

        let stride = self.width as usize;
        let col_off = self.filled_cols as usize;
        for (row, line) in block.as_raw().chunks_exact(window.width as usize).enumerate() {
            let start = row * stride + col_off;
            self.buffer[start..start + line.len()].copy_from_slice(line);
        }
        self.filled_cols += window.width;

        if self.filled_cols == self.width {
            let strip_height = self.strip_height();
            let strip = std::mem::take(&mut self.buffer);
            self.strips
                .send(strip)
                .map_err(|_| GridError::Backend("GeoTIFF encoder stopped".to_string()))?;
            self.strip_row += strip_height;
            self.filled_cols = 0;
            self.buffer = self.empty_strip();
        }
        Ok(())
    }
}

/// Write a GeoTIFF at `path` from the blocks `produce` pushes into a
/// [`StripSink`].
///
/// Encoding runs on its own thread while `produce` computes the next
/// blocks. The file is written to a temporary sibling and renamed into
/// place only when both sides succeed.
///
/// # Errors
///
/// Returns the error of `produce`, or a [`GridError`] converted into `E`
/// when encoding, writing or renaming fails.
pub fn write_geotiff<T, R, E, F>(
    path: &Path,
    meta: &GridMeta,
    rows_per_strip: u32,
    produce: F,
) -> Result<R, E>
where
    T: TiffSample,
    E: From<GridError>,
    F: FnOnce(&mut StripSink<T>) -> Result<R, E>,
{
    let rows_per_strip = rows_per_strip.max(1);
    log::debug!(
        "geotiff: writing {}x{} grid to {} in strips of {rows_per_strip} rows",
        meta.width,
        meta.height,
        path.display()
    );
    write_atomically(path, |tmp| {
        let file = File::create(tmp).map_err(|e| io_error(tmp, &e))?;
        let (sender, receiver) = mpsc::sync_channel::<Vec<T>>(STRIP_QUEUE);
        thread::scope(|scope| {
            let encoder = scope.spawn(move || {
                let mut writer = BufWriter::new(file);
                let complete = T::write_image(&mut writer, meta, rows_per_strip, &receiver)?;
                writer.flush().map_err(|e| io_error(tmp, &e))?;
                Ok::<_, GridError>(complete)
            });

            let mut sink = StripSink::new(meta, rows_per_strip, sender);
            let produced = produce(&mut sink)
                .and_then(|value| sink.finish().map(|()| value).map_err(E::from));
            drop(sink);

            let encoded = encoder
                .join()
                .map_err(|_| GridError::Backend("GeoTIFF encoder thread panicked".to_string()))
                .and_then(|r| r);
            match (produced, encoded) {
                (_, Err(e)) => Err(E::from(e)),
                (Err(e), Ok(_)) => Err(e),
                (Ok(value), Ok(true)) => Ok(value),
                (Ok(_), Ok(false)) => Err(E::from(GridError::Backend(
                    "GeoTIFF encoder received too few strips".to_string(),
                ))),
            }
        })
    })
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>, GridError> {
    let file = File::open(path).map_err(|e| io_error(path, &e))?;
    let decoder = Decoder::new(BufReader::new(file)).map_err(tiff_error)?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

/// Read the georeferencing of a GeoTIFF without decoding any samples.
///
/// # Errors
///
/// Returns [`GridError`] when the file cannot be opened or carries no
/// usable georeferencing.
pub fn read_geotiff_meta(path: &Path) -> Result<GridMeta, GridError> {
    read_meta(&mut open_decoder(path)?)
}

#[derive(Debug, Clone, Copy)]
struct ChunkLayout {
    width: u32,
    height: u32,
    across: u32,
    samples_per_pixel: usize,
}

/// Windowed reader over one GeoTIFF file.
pub struct GeoTiffReader<T: TiffSample> {
    decoder: Decoder<BufReader<File>>,
    meta: GridMeta,
    layout: ChunkLayout,
    cache: VecDeque<(u32, Block<T>)>,
}

impl<T: TiffSample> std::fmt::Debug for GeoTiffReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTiffReader")
            .field("meta", &self.meta)
            .field("layout", &self.layout)
            .field("cached_chunks", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<T: TiffSample> GeoTiffReader<T> {
    /// Open `path` and read its georeferencing.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] when the file cannot be opened, is not
    /// georeferenced, or stores bands separately.
    pub fn open(path: &Path) -> Result<Self, GridError> {
        let mut decoder = open_decoder(path)?;
        let meta = read_meta(&mut decoder)?;

        let samples_per_pixel = decoder
            .find_tag(Tag::SamplesPerPixel)
            .map_err(tiff_error)?
            .map(tiff::decoder::ifd::Value::into_u16)
            .transpose()
            .map_err(tiff_error)?
            .unwrap_or(1);
        let planar = decoder
            .find_tag(Tag::PlanarConfiguration)
            .map_err(tiff_error)?
            .map(tiff::decoder::ifd::Value::into_u16)
            .transpose()
            .map_err(tiff_error)?;
        if samples_per_pixel > 1 && planar == Some(PLANAR_SEPARATE) {
            return Err(GridError::UnsupportedSampleType(
                "bands stored as separate planes".to_string(),
            ));
        }

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let across = match decoder.get_chunk_type() {
            ChunkType::Strip => 1,
            ChunkType::Tile => meta.width.div_ceil(chunk_width.max(1)),
        };
        let layout = ChunkLayout {
            width: chunk_width.max(1),
            height: chunk_height.max(1),
            across,
            samples_per_pixel: usize::from(samples_per_pixel.max(1)),
        };
        log::debug!(
            "geotiff: {} is {}x{} with {}x{} chunks, {:?}",
            path.display(),
            meta.width,
            meta.height,
            layout.width,
            layout.height,
            meta.crs
        );
        Ok(Self {
            decoder,
            meta,
            layout,
            cache: VecDeque::with_capacity(CHUNK_CACHE),
        })
    }

    fn chunk(&mut self, index: u32) -> Result<&Block<T>, GridError> {
        if let Some(pos) = self.cache.iter().position(|(i, _)| *i == index) {
            return Ok(&self.cache[pos].1);
        }

        let (width, height) = self.decoder.chunk_data_dimensions(index);
        let decoded = self.decoder.read_chunk(index).map_err(tiff_error)?;
        let mut samples = T::decode(decoded)?;
        if self.layout.samples_per_pixel > 1 {
            samples = samples
                .into_iter()
                .step_by(self.layout.samples_per_pixel)
                .collect();
        }
        let block = Block::from_raw(width, height, samples).ok_or_else(|| {
            GridError::Backend(format!("chunk {index} does not hold {width}x{height} samples"))
        })?;

        if self.cache.len() >= CHUNK_CACHE {
            self.cache.pop_front();
        }
        self.cache.push_back((index, block));
        self.cache
            .back()
            .map(|(_, block)| block)
            .ok_or_else(|| GridError::Backend("chunk cache is empty".to_string()))
    }
}

impl<T: TiffSample> GridReader<T> for GeoTiffReader<T> {
    fn meta(&self) -> &GridMeta {
        &self.meta
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn read_window(&mut self, window: Window, fill: T) -> Result<Block<T>, GridError> {
        let mut out = Block::from_pixel(window.width, window.height, Luma([fill]));
        let Some(overlap) = window.intersection(&self.meta.full_window()) else {
            return Ok(out);
        };
        // The overlap lies inside the grid, so its bounds fit in u32.
        let (col0, row0) = (overlap.col_off as u32, overlap.row_off as u32);
        let (col1, row1) = (overlap.col_end() as u32, overlap.row_end() as u32);
        let layout = self.layout;

        for chunk_row in row0 / layout.height..=(row1 - 1) / layout.height {
            let first_col = if layout.across == 1 { 0 } else { col0 / layout.width };
            let last_col = if layout.across == 1 { 0 } else { (col1 - 1) / layout.width };
            for chunk_col in first_col..=last_col {
                let index = chunk_row * layout.across + chunk_col;
                let chunk_x = chunk_col * layout.width;
                let chunk_y = chunk_row * layout.height;
                let chunk = self.chunk(index)?;
                let rows = row0.max(chunk_y)..row1.min(chunk_y + chunk.height());
                let cols = col0.max(chunk_x)..col1.min(chunk_x + chunk.width());
                for row in rows {
                    for col in cols.clone() {
                        let value = chunk.get_pixel(col - chunk_x, row - chunk_y)[0];
                        out.put_pixel(
                            (i64::from(col) - window.col_off) as u32,
                            (i64::from(row) - window.row_off) as u32,
                            Luma([value]),
                        );
                    }
                }
            }
        }
        Ok(out)
    }
}

/// A GeoTIFF on disk that hands out one [`GeoTiffReader`] per worker.
#[derive(Debug, Clone)]
pub struct GeoTiffSource<T: TiffSample> {
    path: PathBuf,
    meta: GridMeta,
    sample: PhantomData<fn() -> T>,
}

impl<T: TiffSample> GeoTiffSource<T> {
    /// Read the georeferencing of `path`.
    ///
    /// # Errors
    ///
    /// See [`read_geotiff_meta`].
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, GridError> {
        let path = path.into();
        let meta = read_geotiff_meta(&path)?;
        Ok(Self {
            path,
            meta,
            sample: PhantomData,
        })
    }

    /// The file behind this source.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: TiffSample> GridSource<T> for GeoTiffSource<T> {
    type Reader<'a>
        = GeoTiffReader<T>
    where
        Self: 'a;

    fn meta(&self) -> &GridMeta {
        &self.meta
    }

    fn open(&self) -> Result<Self::Reader<'_>, GridError> {
        GeoTiffReader::open(&self.path)
    }
}
