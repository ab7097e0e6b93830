//! A pyramid dataset: block engine, block cache and windowed access.

use crate::band::{Access, BlockEngine, BlockError};
use crate::buffer::{read_sample, write_sample};
use crate::cache::{BlockCache, BlockKey, DEFAULT_CAPACITY};
use crate::image::{DataType, DescError, ImageDesc, Level, PageSize, Size};
use crate::index::{MemoryStore, TileIdx};
use crate::raster::{
    BlockSnafu, FlushSnafu, GeoTransform, NoSuchLevelSnafu, OverviewPatch, Raster, RasterError,
    RasterSource, ReadOnlySnafu, Resampling, ScaledWriteSnafu, UnsupportedScaleSnafu, Window,
    WindowRequest,
};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, trace};

/// A tiled raster pyramid.
///
/// Writes go to the block cache and reach the tile store on [`flush()`].
///
/// [`flush()`]: Pyramid::flush
#[derive(Debug)]
pub struct Pyramid {
    engine: BlockEngine,
    cache: BlockCache,
    geo: Option<GeoTransform>,
}

impl Pyramid {
    #[must_use]
    pub fn new(engine: BlockEngine, geo: Option<GeoTransform>) -> Self {
        let channels = engine.desc().page.c;

        Self {
            engine,
            cache: BlockCache::with_capacity(DEFAULT_CAPACITY, channels),
            geo,
        }
    }

    /// Number of blocks kept in memory. Unsaved blocks are written to the
    /// tile store when the cache is full of them.
    #[must_use]
    pub fn with_cache_capacity(mut self, blocks: usize) -> Self {
        self.cache.set_capacity(blocks);
        self
    }

    /// A pyramid open for update, kept in memory.
    pub fn in_memory(desc: ImageDesc, geo: Option<GeoTransform>) -> Result<Self, DescError> {
        let engine = BlockEngine::new(desc, Box::new(MemoryStore::new()), Access::Update, None)?;
        Ok(Self::new(engine, geo))
    }

    #[must_use]
    pub fn engine(&self) -> &BlockEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut BlockEngine {
        &mut self.engine
    }

    #[must_use]
    pub fn desc(&self) -> &ImageDesc {
        self.engine.desc()
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    fn level(&self, level: usize) -> Result<Level, RasterError> {
        self.engine
            .levels()
            .get(level)
            .copied()
            .context(NoSuchLevelSnafu { level })
    }

    /// Pixel extent of a level.
    pub fn level_size(&self, level: usize) -> Result<Size, RasterError> {
        Ok(self.level(level)?.size)
    }

    /// Index record of the page holding `key`.
    pub fn tile_idx(&mut self, key: &BlockKey) -> Result<TileIdx, BlockError> {
        self.engine.tile_idx(key)
    }

    /// Reads one block, from the cache when it holds it.
    pub fn read_block(&mut self, key: BlockKey, buf: &mut [u8]) -> Result<(), BlockError> {
        if let Some(block) = self.cache.get(&key)
            && block.len() == buf.len()
        {
            buf.copy_from_slice(block);
            return Ok(());
        }

        self.engine.read_block(&mut self.cache, key, buf)
    }

    /// Writes one block straight to the tile store.
    pub fn write_block(&mut self, key: BlockKey, buf: &[u8]) -> Result<(), BlockError> {
        self.engine.write_block(&mut self.cache, key, buf)?;

        if self.cache.contains(&key) {
            self.cache.insert(key, buf.to_vec(), false);
        }

        Ok(())
    }

    fn block(&mut self, key: BlockKey) -> Result<&[u8], RasterError> {
        self.make_room(&key)?;

        let len = self.engine.desc().block_size_bytes();
        let engine = &mut self.engine;

        self.cache
            .load(key, |cache| {
                let mut data = vec![0u8; len];
                engine.read_block(cache, key, &mut data)?;
                Ok(data)
            })
            .context(BlockSnafu)
    }

    fn block_mut(&mut self, key: BlockKey) -> Result<&mut [u8], RasterError> {
        self.make_room(&key)?;

        let len = self.engine.desc().block_size_bytes();
        let engine = &mut self.engine;

        self.cache
            .load_mut(key, |cache| {
                let mut data = vec![0u8; len];
                engine.read_block(cache, key, &mut data)?;
                Ok(data)
            })
            .context(BlockSnafu)
    }

    fn make_room(&mut self, key: &BlockKey) -> Result<(), RasterError> {
        if self.cache.contains(key) || !self.cache.is_full() {
            return Ok(());
        }

        let capacity = self.cache.capacity();
        let keep = (capacity * 3 / 4).min(capacity - 1);
        self.cache.evict(keep);

        if self.cache.is_full() {
            let written = self.write_dirty()?;
            trace!(blocks = written, "cache full, wrote unsaved blocks");
            self.cache.evict(keep);
        }

        Ok(())
    }

    /// Reads a window of any level.
    pub fn read_level_window(
        &mut self,
        level: usize,
        req: &WindowRequest,
        buf: &mut [u8],
    ) -> Result<(), RasterError> {
        let size = self.level_size(level)?;
        let desc = self.desc();
        let width = desc.data_type.size();
        let ps = desc.page;

        req.check(size, desc.bands, buf.len(), width)?;

        let columns = req.columns();
        let rows = req.rows();

        for band in req.bands.clone() {
            for (by, &sy) in rows.iter().enumerate() {
                let (ty, in_y) = (sy / ps.y, sy % ps.y);
                let mut bx = 0;

                while bx < columns.len() {
                    let tx = columns[bx] / ps.x;
                    let block = self.block(BlockKey::new(level, band, tx, ty))?;

                    while let Some(&sx) = columns.get(bx).filter(|&&sx| sx / ps.x == tx) {
                        let src = (in_y * ps.x + sx % ps.x) * width;
                        let dst = req.offset(band, bx, by);

                        buf[dst..dst + width].copy_from_slice(&block[src..src + width]);
                        bx += 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Writes a window of any level into the block cache.
    pub fn write_level_window(
        &mut self,
        level: usize,
        req: &WindowRequest,
        buf: &[u8],
    ) -> Result<(), RasterError> {
        ensure!(self.engine.access() == Access::Update, ReadOnlySnafu);

        let size = self.level_size(level)?;
        let desc = self.desc();
        let width = desc.data_type.size();
        let ps = desc.page;
        let window = req.window;

        req.check(size, desc.bands, buf.len(), width)?;
        ensure!(req.buf == Size::new(window.w, window.h), ScaledWriteSnafu);

        for band in req.bands.clone() {
            for row in 0..window.h {
                let y = window.y + row;
                let (ty, in_y) = (y / ps.y, y % ps.y);
                let mut x = window.x;

                while x < window.end_x() {
                    let tx = x / ps.x;
                    let end = ((tx + 1) * ps.x).min(window.end_x());
                    let block = self.block_mut(BlockKey::new(level, band, tx, ty))?;

                    for px in x..end {
                        let src = req.offset(band, px - window.x, row);
                        let dst = (in_y * ps.x + px % ps.x) * width;

                        block[dst..dst + width].copy_from_slice(&buf[src..src + width]);
                    }

                    x = end;
                }
            }
        }

        Ok(())
    }

    /// Writes every modified block to the tile store.
    pub fn flush(&mut self) -> Result<(), RasterError> {
        let written = self.write_dirty()?;

        self.engine.store_mut().flush().context(FlushSnafu)?;
        self.cache.evict_clean();

        if written > 0 {
            debug!(blocks = written, "flushed pyramid");
        }

        Ok(())
    }

    /// Writes the dirty blocks, which stay cached as clean blocks.
    fn write_dirty(&mut self) -> Result<usize, RasterError> {
        let dirty = self.cache.dirty_keys();

        for key in &dirty {
            // Writing an interleaved page also saves the other bands.
            if !self.cache.is_dirty(key) {
                continue;
            }

            let Some(data) = self.cache.get(key).map(<[u8]>::to_vec) else {
                continue;
            };

            self.engine
                .write_block(&mut self.cache, *key, &data)
                .context(BlockSnafu)?;
            self.cache.mark_clean(key);
        }

        Ok(dirty.len())
    }

    /// Refreshes the level `src_level + 1` blocks covering `blocks` of
    /// `src_level` with a 2:1 reduction.
    pub fn patch_overview(
        &mut self,
        src_level: usize,
        blocks: Window,
        resampling: Resampling,
    ) -> Result<(), RasterError> {
        let desc = self.desc().clone();

        ensure!(
            desc.scale == 2.0,
            UnsupportedScaleSnafu { scale: desc.scale }
        );

        let src = self.level(src_level)?;
        let dst = self.level(src_level + 1)?;

        if blocks.is_empty() {
            return Ok(());
        }

        let ps = desc.page;
        let width = desc.data_type.size();
        let tiles = Window::new(
            blocks.x / 2,
            blocks.y / 2,
            blocks.end_x().div_ceil(2) - blocks.x / 2,
            blocks.end_y().div_ceil(2) - blocks.y / 2,
        )
        .clip(dst.pcount);

        debug!(
            level = dst.index,
            tiles = %tiles,
            %resampling,
            "patching overview"
        );

        for band in 0..desc.bands {
            for ty in tiles.y..tiles.end_y() {
                for tx in tiles.x..tiles.end_x() {
                    let out = Window::new(tx * ps.x, ty * ps.y, ps.x, ps.y).clip(dst.size);
                    let input = Window::new(out.x * 2, out.y * 2, out.w * 2, out.h * 2).clip(src.size);

                    let req = WindowRequest::new(input, band..band + 1, width);
                    let mut samples = vec![0u8; input.w * input.h * width];
                    self.read_level_window(src_level, &req, &mut samples)?;

                    let reduced = reduce(&desc, &samples, input, out, resampling);

                    let req = WindowRequest::new(out, band..band + 1, width);
                    self.write_level_window(dst.index, &req, &reduced)?;
                }
            }
        }

        Ok(())
    }
}

/// 2:1 reduction of `input`, sampled from `samples`, into the `out` window.
fn reduce(
    desc: &ImageDesc,
    samples: &[u8],
    input: Window,
    out: Window,
    resampling: Resampling,
) -> Vec<u8> {
    let dt = desc.data_type;
    let width = dt.size();
    let mut reduced = vec![0u8; out.w * out.h * width];

    let sample = |x: usize, y: usize| -> Option<f64> {
        if x >= input.end_x() || y >= input.end_y() {
            return None;
        }

        let at = ((y - input.y) * input.w + x - input.x) * width;
        let v = read_sample(dt, &samples[at..]);

        match desc.nodata {
            Some(ndv) if v == ndv || (v.is_nan() && ndv.is_nan()) => None,
            _ => Some(v),
        }
    };

    for j in 0..out.h {
        for i in 0..out.w {
            let (sx, sy) = (2 * (out.x + i), 2 * (out.y + j));

            let value = match resampling {
                Resampling::Nearest => sample(sx, sy),
                Resampling::Average => {
                    let valid: Vec<f64> = [(0, 0), (1, 0), (0, 1), (1, 1)]
                        .iter()
                        .filter_map(|&(dx, dy)| sample(sx + dx, sy + dy))
                        .collect();

                    (!valid.is_empty()).then(|| {
                        let mean = valid.iter().sum::<f64>() / valid.len() as f64;
                        if is_float(dt) { mean } else { mean.round() }
                    })
                }
            };

            let at = (j * out.w + i) * width;
            write_sample(dt, value.or(desc.nodata).unwrap_or(0.0), &mut reduced[at..]);
        }
    }

    reduced
}

fn is_float(dt: DataType) -> bool {
    matches!(dt, DataType::Float32 | DataType::Float64)
}

impl RasterSource for Pyramid {
    fn size(&self) -> Size {
        self.desc().size
    }

    fn bands(&self) -> usize {
        self.desc().bands
    }

    fn data_type(&self) -> DataType {
        self.desc().data_type
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo
    }

    fn nodata(&self) -> Option<f64> {
        self.desc().nodata
    }

    fn read_window(&mut self, req: &WindowRequest, buf: &mut [u8]) -> Result<(), RasterError> {
        self.read_level_window(0, req, buf)
    }
}

impl Raster for Pyramid {
    fn page_size(&self) -> PageSize {
        self.desc().page
    }

    fn overview_count(&self) -> usize {
        self.desc().levels - 1
    }

    fn write_window(&mut self, req: &WindowRequest, buf: &[u8]) -> Result<(), RasterError> {
        self.write_level_window(0, req, buf)
    }

    fn flush(&mut self) -> Result<(), RasterError> {
        Pyramid::flush(self)
    }

    fn overview_patcher(&mut self) -> Option<&mut dyn OverviewPatch> {
        Some(self)
    }
}

impl OverviewPatch for Pyramid {
    fn patch_overview(
        &mut self,
        src_level: usize,
        blocks: Window,
        resampling: Resampling,
    ) -> Result<(), RasterError> {
        Pyramid::patch_overview(self, src_level, blocks, resampling)
    }
}
