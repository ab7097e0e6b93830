//! Block I/O engine.
//!
//! Reads and writes one band of one page at a time. Pages hold either a
//! single band or `page.c` interleaved bands; for interleaved pages the other
//! bands of the page are exchanged with the host block cache.
//!
//! A page missing from the index can be fetched from a source raster, or
//! copied as is from a clone pyramid with the same structure.

use crate::buffer::{
    UnsupportedWidth, copy_stride_in, copy_stride_out, fill, is_empty_page, swap_bytes,
};
use crate::cache::{BlockCache, BlockKey};
use crate::codec::{CodecError, PageCodec};
use crate::deflate::{DeflateError, INFLATE_SLACK, deflate_block, inflate_block};
use crate::image::{DescError, ImageDesc, Level, MAX_PAGE_CHANNELS, Size};
use crate::index::{Mode, StoreError, TileIdx, TileStore};
use crate::pyramid::Pyramid;
use crate::raster::{RasterError, RasterSource, Spacing, Window, WindowRequest};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::ops::Range;
use tracing::{debug, trace, warn};

/// Errors from block reads and writes.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BlockError {
    #[snafu(display("level {level} does not exist"))]
    NoSuchLevel { level: usize },

    #[snafu(display("block {x},{y} is outside of level {level}"))]
    OutOfRange { level: usize, x: usize, y: usize },

    #[snafu(display("band {band} does not exist"))]
    NoSuchBand { band: usize },

    #[snafu(display("block buffer holds {len} bytes, {expected} expected"))]
    BufferSize { len: usize, expected: usize },

    #[snafu(display("source has no level {level}"))]
    SourceUnavailable { level: usize },

    #[snafu(display("cannot read from source raster"))]
    ReadSource { source: RasterError },

    #[snafu(display("cannot read from clone"))]
    ReadClone {
        #[snafu(source(from(BlockError, Box::new)))]
        source: Box<BlockError>,
    },

    #[snafu(display("cannot read index record #{pos}"))]
    ReadIndex { pos: u64, source: StoreError },

    #[snafu(display("cannot read tile data at offset {offset:#x}"))]
    ReadData { offset: u64, source: StoreError },

    #[snafu(display("cannot write tile #{pos}"))]
    WriteTile { pos: u64, source: StoreError },

    #[snafu(display("page codec failed"))]
    Codec { source: CodecError },

    #[snafu(display("cannot deflate page"))]
    Deflate { source: DeflateError },

    #[snafu(display("unsupported pixel format"))]
    UnsupportedPixelFormat { source: UnsupportedWidth },
}

/// How a pyramid was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    ReadOnly,
    /// Blocks are written by the user. Missing tiles are never fetched.
    Update,
}

/// Where missing tiles come from.
pub enum Source {
    /// Any raster covering the full resolution level.
    Raster(Box<dyn RasterSource>),
    /// A pyramid with the same structure, its tiles are copied verbatim.
    Clone(Box<Pyramid>),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raster(r) => f
                .debug_struct("Raster")
                .field("size", &r.size())
                .field("bands", &r.bands())
                .finish_non_exhaustive(),
            Self::Clone(p) => f.debug_tuple("Clone").field(p).finish(),
        }
    }
}

/// Moves pages between the tile store and decoded band blocks.
pub struct BlockEngine {
    desc: ImageDesc,
    levels: Vec<Level>,
    store: Box<dyn TileStore>,
    codec: Box<dyn PageCodec>,
    access: Access,
    source: Option<Source>,
}

impl std::fmt::Debug for BlockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEngine")
            .field("desc", &self.desc)
            .field("access", &self.access)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl BlockEngine {
    pub fn new(
        desc: ImageDesc,
        store: Box<dyn TileStore>,
        access: Access,
        source: Option<Source>,
    ) -> Result<Self, DescError> {
        desc.validate()?;

        let levels = desc.level_geometry();
        let codec = desc.compression.codec(desc.quality);

        Ok(Self {
            desc,
            levels,
            store,
            codec,
            access,
            source,
        })
    }

    #[must_use]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    #[must_use]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn TileStore {
        self.store.as_mut()
    }

    /// Validates `key` and returns the index position of its page.
    fn locate(&self, key: &BlockKey) -> Result<u64, BlockError> {
        let level = self
            .levels
            .get(key.level)
            .context(NoSuchLevelSnafu { level: key.level })?;

        ensure!(key.band < self.desc.bands, NoSuchBandSnafu { band: key.band });
        ensure!(
            level.contains(key.x, key.y),
            OutOfRangeSnafu {
                level: key.level,
                x: key.x,
                y: key.y
            }
        );

        Ok(level.position(&key.coord(self.desc.page.c)))
    }

    fn check_block(&self, len: usize) -> Result<(), BlockError> {
        let expected = self.desc.block_size_bytes();
        ensure!(len == expected, BufferSizeSnafu { len, expected });
        Ok(())
    }

    /// Index record of the page holding `key`.
    pub fn tile_idx(&mut self, key: &BlockKey) -> Result<TileIdx, BlockError> {
        let pos = self.locate(key)?;
        self.store.read_tile_idx(pos).context(ReadIndexSnafu { pos })
    }

    /// Stored bytes of a page, as they are in the data file.
    pub fn raw_tile(&mut self, idx: TileIdx) -> Result<Vec<u8>, BlockError> {
        let mut raw = vec![0u8; idx.size as usize];

        self.store
            .read_tile(idx, &mut raw)
            .context(ReadDataSnafu { offset: idx.offset })?;

        Ok(raw)
    }

    /// Reads one band block into `buf`.
    ///
    /// For interleaved pages, the other bands of the page are offered to
    /// `cache`.
    pub fn read_block(
        &mut self,
        cache: &mut BlockCache,
        key: BlockKey,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        let pos = self.locate(&key)?;
        self.check_block(buf.len())?;

        let idx = self
            .store
            .read_tile_idx(pos)
            .context(ReadIndexSnafu { pos })?;

        trace!(?key, offset = idx.offset, size = idx.size, "read block");

        if idx.size > 0 {
            return self.load(cache, key, idx, buf);
        }

        if idx.offset != 0
            || self.access == Access::Update
            || self.source.is_none()
            || self.store.index_mode() == Mode::Read
        {
            fill(buf, self.desc.data_type, self.desc.nodata);
            return Ok(());
        }

        let mut source = self.source.take();
        let result = match source.as_mut() {
            Some(Source::Raster(src)) => self.fetch(cache, src.as_mut(), key, pos, buf),
            Some(Source::Clone(clone)) => self.fetch_clone(cache, clone, key, pos, buf),
            None => Ok(()),
        };
        self.source = source;

        result
    }

    /// Loads a stored page and extracts the block of `key`.
    fn load(
        &mut self,
        cache: &mut BlockCache,
        key: BlockKey,
        idx: TileIdx,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        let mut raw = self.raw_tile(idx)?;

        if let Some(flags) = self.desc.deflate {
            let capacity = self.desc.page_size_bytes() + INFLATE_SLACK;

            match inflate_block(&raw, capacity, flags) {
                Ok(v) => raw = v,
                Err(e) => warn!(offset = idx.offset, error = %e, "cannot inflate page, using it as is"),
            }
        }

        if self.desc.page.c == 1 {
            return self.decode(&raw, buf);
        }

        let mut page = vec![0u8; self.desc.page_size_bytes()];
        self.decode(&raw, &mut page)?;
        self.deinterleave(cache, key, &page, buf)
    }

    fn decode(&mut self, raw: &[u8], page: &mut [u8]) -> Result<(), BlockError> {
        self.codec.decompress(page, raw).context(CodecSnafu)?;

        if self.desc.needs_swap() {
            swap_bytes(page, self.desc.data_type.size()).context(UnsupportedPixelFormatSnafu)?;
        }

        Ok(())
    }

    /// Compresses a decoded page. Returns the output buffer and the range
    /// holding the bytes to store.
    fn encode(&mut self, page: &[u8]) -> Result<(Vec<u8>, Range<usize>), BlockError> {
        let swapped;
        let src = if self.desc.needs_swap() {
            let mut v = page.to_vec();
            swap_bytes(&mut v, self.desc.data_type.size()).context(UnsupportedPixelFormatSnafu)?;
            swapped = v;
            swapped.as_slice()
        } else {
            page
        };

        let mut out = vec![0u8; self.desc.page_buffer_size()];
        let len = self.codec.compress(&mut out, src).context(CodecSnafu)?;

        let range = match self.desc.deflate {
            Some(flags) => deflate_block(&mut out, len, flags).context(DeflateSnafu)?,
            None => 0..len,
        };

        Ok((out, range))
    }

    /// Splits a decoded interleaved page. The block of `key` goes to `buf`,
    /// the other bands to the cache unless it holds unsaved changes for them.
    fn deinterleave(
        &self,
        cache: &mut BlockCache,
        key: BlockKey,
        page: &[u8],
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        let c = self.desc.page.c;
        let width = self.desc.data_type.size();
        let first = key.band / c * c;

        for slot in 0..c {
            let band = first + slot;
            let src = &page[slot * width..];

            if band == key.band {
                copy_stride_in(buf, src, width, c).context(UnsupportedPixelFormatSnafu)?;
                continue;
            }

            let other = key.with_band(band);

            if cache.is_dirty(&other) {
                continue;
            }

            let mut block = vec![0u8; self.desc.block_size_bytes()];
            copy_stride_in(&mut block, src, width, c).context(UnsupportedPixelFormatSnafu)?;
            cache.offer(other, block);
        }

        Ok(())
    }

    /// Reads a missing page from the source raster and stores it.
    fn fetch(
        &mut self,
        cache: &mut BlockCache,
        src: &mut dyn RasterSource,
        key: BlockKey,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        debug!(?key, "fetching block from source");

        if self.desc.page.c == 1 {
            self.read_source(src, &key, buf)?;
            return self.store_fetched(pos, buf);
        }

        let mut page = vec![0u8; self.desc.page_size_bytes()];
        self.read_source(src, &key, &mut page)?;
        self.store_fetched(pos, &page)?;
        self.deinterleave(cache, key, &page, buf)
    }

    /// Reads the source area covered by the page of `key` into `page`.
    fn read_source(
        &self,
        src: &mut dyn RasterSource,
        key: &BlockKey,
        page: &mut [u8],
    ) -> Result<(), BlockError> {
        let desc = &self.desc;
        let ps = desc.page;

        // Level 0 is read without any scaling.
        let scale = if key.level == 0 {
            1.0
        } else {
            desc.scale.powi(key.level as i32)
        };

        let scaled = |v: usize| (v as f64 * scale + 0.5) as usize;
        let wanted = Window::new(
            scaled(key.x * ps.x),
            scaled(key.y * ps.y),
            scaled(ps.x),
            scaled(ps.y),
        );

        let window = wanted.clip(src.size());

        if window != wanted {
            fill(page, desc.data_type, desc.nodata);
        }

        if window.is_empty() {
            return Ok(());
        }

        let buf_size = Size::new(
            ((window.w as f64 / scale).ceil() as usize).clamp(1, ps.x),
            ((window.h as f64 / scale).ceil() as usize).clamp(1, ps.y),
        );

        let first = key.band / ps.c * ps.c;
        let width = desc.data_type.size();
        let req = WindowRequest {
            window,
            buf: buf_size,
            bands: first..first + ps.c,
            spacing: Spacing::interleaved(width, ps.x, ps.c),
        };

        src.read_window(&req, page).context(ReadSourceSnafu)
    }

    /// Stores a fetched page, or marks it empty.
    fn store_fetched(&mut self, pos: u64, page: &[u8]) -> Result<(), BlockError> {
        if is_empty_page(page, self.desc.data_type, self.desc.nodata) {
            self.store
                .write_tile(None, pos)
                .context(WriteTileSnafu { pos })?;
            return Ok(());
        }

        if self.store.data_mode() == Mode::Read {
            trace!(pos, "data file is read-only, fetched page not stored");
            return Ok(());
        }

        let (out, range) = self.encode(page)?;

        self.store
            .write_tile(Some(&out[range]), pos)
            .context(WriteTileSnafu { pos })?;

        Ok(())
    }

    /// Copies a missing page from the clone.
    fn fetch_clone(
        &mut self,
        cache: &mut BlockCache,
        clone: &mut Pyramid,
        key: BlockKey,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        if self.store.data_mode() == Mode::Read {
            return clone.read_block(key, buf).context(ReadCloneSnafu);
        }

        ensure!(
            key.level < clone.engine().levels().len(),
            SourceUnavailableSnafu { level: key.level }
        );

        let idx = clone.engine_mut().tile_idx(&key).context(ReadCloneSnafu)?;

        if idx.size == 0 {
            self.store
                .write_tile(None, pos)
                .context(WriteTileSnafu { pos })?;

            fill(buf, self.desc.data_type, self.desc.nodata);
            return Ok(());
        }

        debug!(?key, size = idx.size, "copying tile from clone");

        let raw = clone.engine_mut().raw_tile(idx).context(ReadCloneSnafu)?;

        self.store
            .write_tile(Some(&raw), pos)
            .context(WriteTileSnafu { pos })?;

        self.read_block(cache, key, buf)
    }

    /// Writes one band block.
    ///
    /// Interleaved pages are assembled from `buf` and the blocks of the other
    /// bands found in `cache`, which are then marked clean.
    pub fn write_block(
        &mut self,
        cache: &mut BlockCache,
        key: BlockKey,
        buf: &[u8],
    ) -> Result<(), BlockError> {
        let pos = self.locate(&key)?;
        self.check_block(buf.len())?;

        let dt = self.desc.data_type;
        let nodata = self.desc.nodata;
        let c = self.desc.page.c;

        trace!(?key, "write block");

        if c == 1 {
            if is_empty_page(buf, dt, nodata) {
                self.store
                    .write_tile(None, pos)
                    .context(WriteTileSnafu { pos })?;
                return Ok(());
            }

            let (out, range) = self.encode(buf)?;

            self.store
                .write_tile(Some(&out[range]), pos)
                .context(WriteTileSnafu { pos })?;

            return Ok(());
        }

        let width = dt.size();
        let first = key.band / c * c;
        let full = if c == MAX_PAGE_CHANNELS {
            u64::MAX
        } else {
            (1u64 << c) - 1
        };

        // Bands missing from the cache stay nodata.
        let mut page = vec![0u8; self.desc.page_size_bytes()];
        fill(&mut page, dt, nodata);

        let mut empties = 0u64;
        let mut supplied = 0u64;
        let mut gathered = Vec::with_capacity(c);

        for slot in 0..c {
            let band = first + slot;
            let bit = 1u64 << slot;

            let block = if band == key.band {
                buf
            } else {
                let other = key.with_band(band);

                match cache.get(&other) {
                    Some(v) => {
                        gathered.push(other);
                        v
                    }
                    None => continue,
                }
            };

            supplied |= bit;

            if is_empty_page(block, dt, nodata) {
                empties |= bit;
            }

            copy_stride_out(&mut page[slot * width..], block, width, c)
                .context(UnsupportedPixelFormatSnafu)?;
        }

        if empties == full {
            self.store
                .write_tile(None, pos)
                .context(WriteTileSnafu { pos })?;
        } else {
            if supplied != full {
                warn!(
                    ?key,
                    mask = supplied,
                    expected = full,
                    "writing interleaved page with missing bands"
                );
            }

            let (out, range) = self.encode(&page)?;

            self.store
                .write_tile(Some(&out[range]), pos)
                .context(WriteTileSnafu { pos })?;
        }

        for other in &gathered {
            cache.mark_clean(other);
        }

        Ok(())
    }
}
