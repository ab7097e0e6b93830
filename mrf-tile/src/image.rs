//! Image descriptor: pixel type, page geometry and pyramid level layout.

use crate::codec::Compression;
use crate::deflate::DeflateFlags;
use crate::index::TileCoord;
use snafu::{Snafu, ensure};
use std::fmt::{Display, Formatter};

/// Maximum number of channels that can share one interleaved page.
///
/// Band presence during an interleaved write is tracked in a `u64` mask.
pub const MAX_PAGE_CHANNELS: usize = 64;

/// Errors when validating an [`ImageDesc`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DescError {
    #[snafu(display("raster size {x}x{y} is empty"))]
    EmptyRaster { x: usize, y: usize },

    #[snafu(display("page size {x}x{y}x{c} is empty"))]
    EmptyPage { x: usize, y: usize, c: usize },

    #[snafu(display("raster has no bands"))]
    NoBands,

    #[snafu(display("{bands} bands cannot be split into pages of {c} channels"))]
    ChannelMismatch { bands: usize, c: usize },

    #[snafu(display("{c} channels per page exceeds the supported maximum"))]
    TooManyChannels { c: usize },

    #[snafu(display("pyramid needs at least one level"))]
    NoLevels,

    #[snafu(display("invalid overview scale {scale}"))]
    InvalidScale { scale: f64 },
}

/// Pixel data type of every band in a pyramid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Byte = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    Float32 = 6,
    Float64 = 7,
}

impl DataType {
    /// Size of one sample in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    #[must_use]
    pub const fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Byte,
            2 => Self::UInt16,
            3 => Self::Int16,
            4 => Self::UInt32,
            5 => Self::Int32,
            6 => Self::Float32,
            7 => Self::Float64,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn raw(self) -> u8 {
        self as u8
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Byte => "Byte",
            Self::UInt16 => "UInt16",
            Self::Int16 => "Int16",
            Self::UInt32 => "UInt32",
            Self::Int32 => "Int32",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
        })
    }
}

/// Byte order of multi-byte samples as stored in the data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running host.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    #[must_use]
    pub const fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Little),
            1 => Some(Self::Big),
            _ => None,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::Little => 0,
            Self::Big => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub x: usize,
    pub y: usize,
}

impl Size {
    #[must_use]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// Page (tile) dimensions. `c` is the number of bands interleaved in one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageSize {
    pub x: usize,
    pub y: usize,
    pub c: usize,
}

impl PageSize {
    #[must_use]
    pub const fn new(x: usize, y: usize, c: usize) -> Self {
        Self { x, y, c }
    }
}

/// Describes one pyramid: raster geometry, paging and encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageDesc {
    pub size: Size,
    pub page: PageSize,
    pub bands: usize,
    pub data_type: DataType,
    /// Order of multi-byte samples inside decoded pages on disk.
    pub order: ByteOrder,
    pub nodata: Option<f64>,
    pub compression: Compression,
    /// 0 to 100. The secondary deflate level is `quality / 10`.
    pub quality: u8,
    /// Secondary compression applied on top of the primary codec output.
    pub deflate: Option<DeflateFlags>,
    /// Number of levels, including the full resolution one.
    pub levels: usize,
    /// Resolution ratio between two consecutive levels.
    pub scale: f64,
}

impl ImageDesc {
    /// Creates a single level descriptor with band separate pages, no
    /// compression and native byte order.
    pub fn new(size: Size, page: PageSize, bands: usize, data_type: DataType) -> Self {
        Self {
            size,
            page,
            bands,
            data_type,
            order: ByteOrder::native(),
            nodata: None,
            compression: Compression::None,
            quality: 85,
            deflate: None,
            levels: 1,
            scale: 2.0,
        }
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    #[must_use]
    pub fn with_deflate(mut self, flags: DeflateFlags) -> Self {
        self.deflate = Some(flags);
        self
    }

    #[must_use]
    pub fn with_levels(mut self, levels: usize) -> Self {
        self.levels = levels;
        self
    }

    /// Adds overview levels until the coarsest one fits in a single page.
    #[must_use]
    pub fn with_full_pyramid(mut self) -> Self {
        let mut levels = 1;
        let mut size = self.size;

        while size.x > self.page.x || size.y > self.page.y {
            size = Size::new(size.x.div_ceil(2), size.y.div_ceil(2));
            levels += 1;
        }

        self.levels = levels;
        self.scale = 2.0;
        self
    }

    pub fn validate(&self) -> Result<(), DescError> {
        let Size { x, y } = self.size;
        let PageSize { x: px, y: py, c } = self.page;

        ensure!(x > 0 && y > 0, EmptyRasterSnafu { x, y });
        ensure!(px > 0 && py > 0 && c > 0, EmptyPageSnafu { x: px, y: py, c });
        ensure!(self.bands > 0, NoBandsSnafu);
        ensure!(c <= MAX_PAGE_CHANNELS, TooManyChannelsSnafu { c });
        ensure!(
            self.bands % c == 0,
            ChannelMismatchSnafu {
                bands: self.bands,
                c
            }
        );
        ensure!(self.levels > 0, NoLevelsSnafu);
        ensure!(
            self.levels == 1 || self.scale > 1.0,
            InvalidScaleSnafu { scale: self.scale }
        );

        Ok(())
    }

    #[must_use]
    pub fn is_interleaved(&self) -> bool {
        self.page.c > 1
    }

    /// Number of page groups a band set is split into.
    #[must_use]
    pub fn band_groups(&self) -> usize {
        self.bands / self.page.c
    }

    /// Uncompressed size of one page, all its channels included.
    #[must_use]
    pub fn page_size_bytes(&self) -> usize {
        self.block_size_bytes() * self.page.c
    }

    /// Uncompressed size of one band's slice of a page.
    #[must_use]
    pub fn block_size_bytes(&self) -> usize {
        self.page.x * self.page.y * self.data_type.size()
    }

    /// Capacity of the buffer receiving the primary codec output.
    ///
    /// Large enough for incompressible pages plus the secondary compression slack.
    #[must_use]
    pub fn page_buffer_size(&self) -> usize {
        let page = self.page_size_bytes();
        page + page / 2 + 1440
    }

    /// Whether decoded pages have to be byte swapped on this host.
    #[must_use]
    pub fn needs_swap(&self) -> bool {
        self.data_type.size() > 1
            && self.compression.is_endianness_dependent()
            && self.order != ByteOrder::native()
    }

    /// Geometry of every level, full resolution first.
    #[must_use]
    pub fn level_geometry(&self) -> Vec<Level> {
        let groups = self.band_groups();
        let mut levels = Vec::with_capacity(self.levels);
        let mut base = 0u64;

        for index in 0..self.levels {
            let size = if index == 0 {
                self.size
            } else {
                let factor = self.scale.powi(index as i32);
                Size::new(
                    ((self.size.x as f64 / factor).ceil() as usize).max(1),
                    ((self.size.y as f64 / factor).ceil() as usize).max(1),
                )
            };

            let pcount = Size::new(size.x.div_ceil(self.page.x), size.y.div_ceil(self.page.y));
            let level = Level {
                index,
                size,
                pcount,
                groups,
                base,
            };

            base += level.tile_count();
            levels.push(level);
        }

        levels
    }
}

/// Geometry of one pyramid level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Level {
    pub index: usize,
    /// Pixel extent of the level.
    pub size: Size,
    /// Pages per row and per column.
    pub pcount: Size,
    groups: usize,
    base: u64,
}

impl Level {
    /// Number of index records used by this level.
    #[must_use]
    pub fn tile_count(&self) -> u64 {
        (self.pcount.x * self.pcount.y * self.groups) as u64
    }

    #[must_use]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.pcount.x && y < self.pcount.y
    }

    /// Linear record number of a tile in the index table.
    ///
    /// Levels follow each other; inside a level the band group varies fastest,
    /// then the column, then the row.
    #[must_use]
    pub fn position(&self, coord: &TileCoord) -> u64 {
        debug_assert_eq!(coord.level, self.index);

        let in_level = coord.band_group + self.groups * (coord.x + self.pcount.x * coord.y);
        self.base + in_level as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> ImageDesc {
        ImageDesc::new(Size::new(1000, 600), PageSize::new(256, 256, 1), 3, DataType::UInt16)
    }

    #[test]
    fn test_page_sizes() {
        let d = desc();
        assert_eq!(d.block_size_bytes(), 256 * 256 * 2);
        assert_eq!(d.page_size_bytes(), 256 * 256 * 2);

        let d = ImageDesc {
            page: PageSize::new(256, 256, 3),
            ..desc()
        };
        assert_eq!(d.page_size_bytes(), 256 * 256 * 2 * 3);
        assert_eq!(d.band_groups(), 1);
    }

    #[test]
    fn test_full_pyramid_levels() {
        let d = desc().with_full_pyramid();
        let levels = d.level_geometry();

        assert_eq!(d.levels, 3);
        assert_eq!(levels[0].pcount, Size::new(4, 3));
        assert_eq!(levels[1].size, Size::new(500, 300));
        assert_eq!(levels[1].pcount, Size::new(2, 2));
        assert_eq!(levels[2].size, Size::new(250, 150));
        assert_eq!(levels[2].pcount, Size::new(1, 1));
    }

    #[test]
    fn test_positions_are_unique_and_dense() {
        let d = desc().with_full_pyramid();
        let mut seen = Vec::new();

        for level in d.level_geometry() {
            for y in 0..level.pcount.y {
                for x in 0..level.pcount.x {
                    for g in 0..d.band_groups() {
                        seen.push(level.position(&TileCoord::new(x, y, g, level.index)));
                    }
                }
            }
        }

        let total = seen.len() as u64;
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len() as u64, total);
        assert_eq!(*seen.last().unwrap(), total - 1);
    }

    #[test]
    fn test_validate_rejects_channel_mismatch() {
        let d = ImageDesc {
            page: PageSize::new(256, 256, 2),
            ..desc()
        };
        assert!(matches!(d.validate(), Err(DescError::ChannelMismatch { .. })));
        assert!(desc().validate().is_ok());
    }

    #[test]
    fn test_needs_swap() {
        let foreign = match ByteOrder::native() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };

        assert!(desc().with_order(foreign).needs_swap());
        assert!(!desc().needs_swap());

        let bytes = ImageDesc {
            data_type: DataType::Byte,
            ..desc()
        };
        assert!(!bytes.with_order(foreign).needs_swap());
    }
}
