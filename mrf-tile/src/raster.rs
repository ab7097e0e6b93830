//! Raster access traits shared by pyramids and plain sources.
//!
//! A [`RasterSource`] can be read through windows; a [`Raster`] can also be
//! written and may support refreshing its overview levels through
//! [`OverviewPatch`].

use crate::band::BlockError;
use crate::buffer::{read_sample, write_sample};
use crate::image::{DataType, PageSize, Size};
use crate::index::StoreError;
use snafu::{Snafu, ensure};
use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::str::FromStr;

/// Errors from raster window access.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RasterError {
    #[snafu(display("window {window} is outside of the {}x{} raster", size.x, size.y))]
    WindowOutOfRange { window: Window, size: Size },

    #[snafu(display("band {band} is out of range, raster has {bands} bands"))]
    BandOutOfRange { band: usize, bands: usize },

    #[snafu(display("buffer of {len} bytes is too small, {need} bytes needed"))]
    BufferTooSmall { len: usize, need: usize },

    #[snafu(display("level {level} does not exist"))]
    NoSuchLevel { level: usize },

    #[snafu(display("overview scale {scale} is not supported"))]
    UnsupportedScale { scale: f64 },

    #[snafu(display("raster is opened read-only"))]
    ReadOnly,

    #[snafu(display("written windows cannot be resampled"))]
    ScaledWrite,

    #[snafu(display("cannot access block"))]
    Block {
        #[snafu(source(from(BlockError, Box::new)))]
        source: Box<BlockError>,
    },

    #[snafu(display("cannot flush tile storage"))]
    Flush { source: StoreError },
}

/// A rectangle of pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Window {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

impl Window {
    #[must_use]
    pub const fn new(x: usize, y: usize, w: usize, h: usize) -> Self {
        Self { x, y, w, h }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    #[must_use]
    pub const fn end_x(&self) -> usize {
        self.x + self.w
    }

    #[must_use]
    pub const fn end_y(&self) -> usize {
        self.y + self.h
    }

    /// Whether the window lies entirely inside a raster of `size`.
    #[must_use]
    pub const fn fits(&self, size: Size) -> bool {
        self.end_x() <= size.x && self.end_y() <= size.y
    }

    /// The part of the window inside a raster of `size`.
    #[must_use]
    pub fn clip(&self, size: Size) -> Self {
        let x = self.x.min(size.x);
        let y = self.y.min(size.y);

        Self {
            x,
            y,
            w: self.end_x().min(size.x) - x,
            h: self.end_y().min(size.y) - y,
        }
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.w, self.h, self.x, self.y)
    }
}

/// Byte distances between consecutive samples of a window buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spacing {
    pub pixel: usize,
    pub line: usize,
    pub band: usize,
}

impl Spacing {
    /// One band after the other, each one row after the other.
    #[must_use]
    pub const fn band_sequential(width: usize, buf: Size) -> Self {
        Self {
            pixel: width,
            line: width * buf.x,
            band: width * buf.x * buf.y,
        }
    }

    /// Samples of `channels` bands intermixed pixel by pixel, in rows of
    /// `line_pixels`.
    #[must_use]
    pub const fn interleaved(width: usize, line_pixels: usize, channels: usize) -> Self {
        Self {
            pixel: width * channels,
            line: width * channels * line_pixels,
            band: width,
        }
    }
}

/// A windowed read or write.
///
/// The window is resampled to `buf` pixels when the sizes differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowRequest {
    pub window: Window,
    pub buf: Size,
    pub bands: Range<usize>,
    pub spacing: Spacing,
}

impl WindowRequest {
    /// A band sequential request at full resolution.
    #[must_use]
    pub fn new(window: Window, bands: Range<usize>, width: usize) -> Self {
        let buf = Size::new(window.w, window.h);

        Self {
            window,
            buf,
            bands,
            spacing: Spacing::band_sequential(width, buf),
        }
    }

    #[must_use]
    pub fn with_buf(mut self, buf: Size, spacing: Spacing) -> Self {
        self.buf = buf;
        self.spacing = spacing;
        self
    }

    /// Number of bytes the buffer must at least hold.
    #[must_use]
    pub fn span(&self, width: usize) -> usize {
        if self.buf.x == 0 || self.buf.y == 0 || self.bands.is_empty() {
            return 0;
        }

        (self.bands.len() - 1) * self.spacing.band
            + (self.buf.y - 1) * self.spacing.line
            + (self.buf.x - 1) * self.spacing.pixel
            + width
    }

    /// Byte offset of one buffer sample.
    #[must_use]
    pub fn offset(&self, band: usize, x: usize, y: usize) -> usize {
        (band - self.bands.start) * self.spacing.band + y * self.spacing.line + x * self.spacing.pixel
    }

    /// Checks the request against a raster of `size` with `bands` bands and a
    /// buffer of `len` bytes.
    pub fn check(
        &self,
        size: Size,
        bands: usize,
        len: usize,
        width: usize,
    ) -> Result<(), RasterError> {
        ensure!(
            self.window.fits(size),
            WindowOutOfRangeSnafu {
                window: self.window,
                size
            }
        );

        if let Some(band) = self.bands.clone().find(|&b| b >= bands) {
            return BandOutOfRangeSnafu { band, bands }.fail();
        }

        let need = self.span(width);
        ensure!(len >= need, BufferTooSmallSnafu { len, need });

        Ok(())
    }

    /// Source column of every buffer column, nearest neighbour.
    #[must_use]
    pub fn columns(&self) -> Vec<usize> {
        nearest(self.window.x, self.window.w, self.buf.x)
    }

    /// Source row of every buffer row, nearest neighbour.
    #[must_use]
    pub fn rows(&self) -> Vec<usize> {
        nearest(self.window.y, self.window.h, self.buf.y)
    }
}

fn nearest(start: usize, src: usize, dst: usize) -> Vec<usize> {
    (0..dst)
        .map(|i| start + ((2 * i + 1) * src / (2 * dst)).min(src.saturating_sub(1)))
        .collect()
}

/// Affine transform from pixel to georeferenced coordinates.
///
/// `x = t[0] + px * t[1] + py * t[2]`, `y = t[3] + px * t[4] + py * t[5]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// A north-up transform, `res_y` is usually negative.
    #[must_use]
    pub const fn new(origin_x: f64, res_x: f64, origin_y: f64, res_y: f64) -> Self {
        Self([origin_x, res_x, 0.0, origin_y, 0.0, res_y])
    }

    #[must_use]
    pub const fn origin_x(&self) -> f64 {
        self.0[0]
    }

    #[must_use]
    pub const fn origin_y(&self) -> f64 {
        self.0[3]
    }

    #[must_use]
    pub const fn res_x(&self) -> f64 {
        self.0[1]
    }

    #[must_use]
    pub const fn res_y(&self) -> f64 {
        self.0[5]
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 1.0, 0.0, 1.0)
    }
}

/// Resampling used when refreshing overview levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Resampling {
    #[default]
    Nearest,
    Average,
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown resampling method '{name}'"))]
pub struct ParseResamplingError {
    pub name: String,
}

impl FromStr for Resampling {
    type Err = ParseResamplingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "near" | "nearest" => Ok(Self::Nearest),
            "avg" | "average" => Ok(Self::Average),
            _ => ParseResamplingSnafu { name: s }.fail(),
        }
    }
}

impl Display for Resampling {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Nearest => "near",
            Self::Average => "avg",
        })
    }
}

/// A readable raster.
pub trait RasterSource {
    fn size(&self) -> Size;

    fn bands(&self) -> usize;

    fn data_type(&self) -> DataType;

    fn geo_transform(&self) -> Option<GeoTransform>;

    fn nodata(&self) -> Option<f64> {
        None
    }

    /// Reads the window into `buf`, samples in host byte order.
    fn read_window(&mut self, req: &WindowRequest, buf: &mut [u8]) -> Result<(), RasterError>;
}

/// A writable raster with overview levels.
pub trait Raster: RasterSource {
    /// Block size used for windowed writes.
    fn page_size(&self) -> PageSize;

    /// Number of levels coarser than the full resolution one.
    fn overview_count(&self) -> usize;

    /// Writes `buf` into the window. `buf.len()` must match the window size.
    fn write_window(&mut self, req: &WindowRequest, buf: &[u8]) -> Result<(), RasterError>;

    /// Writes every modified block.
    fn flush(&mut self) -> Result<(), RasterError>;

    /// Returns the overview refresh capability, if the raster has one.
    fn overview_patcher(&mut self) -> Option<&mut dyn OverviewPatch> {
        None
    }
}

/// Regenerates parts of overview levels from the level below.
pub trait OverviewPatch {
    /// Refreshes the level `src_level + 1` blocks covered by the `blocks`
    /// rectangle of `src_level`, given in block units.
    fn patch_overview(
        &mut self,
        src_level: usize,
        blocks: Window,
        resampling: Resampling,
    ) -> Result<(), RasterError>;
}

/// A band sequential raster held in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct MemRaster {
    size: Size,
    bands: usize,
    data_type: DataType,
    geo: Option<GeoTransform>,
    nodata: Option<f64>,
    data: Vec<u8>,
}

impl MemRaster {
    /// A zero filled raster.
    #[must_use]
    pub fn new(size: Size, bands: usize, data_type: DataType) -> Self {
        Self {
            size,
            bands,
            data_type,
            geo: None,
            nodata: None,
            data: vec![0; size.x * size.y * bands * data_type.size()],
        }
    }

    #[must_use]
    pub fn with_geo_transform(mut self, geo: GeoTransform) -> Self {
        self.geo = Some(geo);
        self
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    fn offset(&self, band: usize, x: usize, y: usize) -> usize {
        ((band * self.size.y + y) * self.size.x + x) * self.data_type.size()
    }

    #[must_use]
    pub fn sample(&self, band: usize, x: usize, y: usize) -> f64 {
        let at = self.offset(band, x, y);
        read_sample(self.data_type, &self.data[at..])
    }

    pub fn set_sample(&mut self, band: usize, x: usize, y: usize, value: f64) {
        let at = self.offset(band, x, y);
        write_sample(self.data_type, value, &mut self.data[at..]);
    }

    /// Sets every sample from `f(band, x, y)`.
    pub fn fill_with(&mut self, mut f: impl FnMut(usize, usize, usize) -> f64) {
        for band in 0..self.bands {
            for y in 0..self.size.y {
                for x in 0..self.size.x {
                    self.set_sample(band, x, y, f(band, x, y));
                }
            }
        }
    }
}

impl RasterSource for MemRaster {
    fn size(&self) -> Size {
        self.size
    }

    fn bands(&self) -> usize {
        self.bands
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn read_window(&mut self, req: &WindowRequest, buf: &mut [u8]) -> Result<(), RasterError> {
        let width = self.data_type.size();
        req.check(self.size, self.bands, buf.len(), width)?;

        let columns = req.columns();
        let rows = req.rows();

        for band in req.bands.clone() {
            for (by, &sy) in rows.iter().enumerate() {
                for (bx, &sx) in columns.iter().enumerate() {
                    let src = self.offset(band, sx, sy);
                    let dst = req.offset(band, bx, by);
                    buf[dst..dst + width].copy_from_slice(&self.data[src..src + width]);
                }
            }
        }

        Ok(())
    }
}
