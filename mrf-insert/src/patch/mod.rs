mod error;

pub use self::error::PatchError;

use self::error::{
    BandMismatchSnafu, DataTypeMismatchSnafu, FlushSnafu, GeometryMismatchSnafu,
    InvalidStartLevelSnafu, NoGeoTransformSnafu, NoOverviewPatchSnafu, PatchOverviewSnafu,
    ReadSourceSnafu, ReadTargetSnafu, WriteTargetSnafu,
};
use crate::geometry::{ImgInfo, block_window, halve, intersect};
use crate::progress::{PatchProgress, PatchStage};
use mrf_tile::image::Size;
use mrf_tile::raster::{Raster, RasterSource, Resampling, Window, WindowRequest};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::debug;

/// What a patch touches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// First level written. The base level is copied only when this is 0.
    pub start_level: usize,
    /// Last overview level refreshed, all of them when unset.
    pub stop_level: Option<usize>,
    /// Overview levels are refreshed only when set.
    pub resampling: Option<Resampling>,
}

impl InsertOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_start_level(mut self, level: usize) -> Self {
        self.start_level = level;
        self
    }

    #[must_use]
    pub fn with_stop_level(mut self, level: usize) -> Self {
        self.stop_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = Some(resampling);
        self
    }
}

/// Copies `source` into the base level of `target` and refreshes the
/// overview blocks it covers.
///
/// Nothing is written to `target` when the patch does not fit it. Returns the
/// base level blocks covered by the patch.
pub fn patch<P: PatchProgress + ?Sized>(
    source: &mut dyn RasterSource,
    target: &mut dyn Raster,
    options: &InsertOptions,
    progress: &P,
) -> Result<Window, PatchError> {
    progress.stage(PatchStage::Validate);

    ensure!(
        source.data_type() == target.data_type(),
        DataTypeMismatchSnafu {
            patch: source.data_type(),
            target: target.data_type()
        }
    );
    ensure!(
        source.bands() == target.bands(),
        BandMismatchSnafu {
            patch: source.bands(),
            target: target.bands()
        }
    );

    let patch_geo = source
        .geo_transform()
        .context(NoGeoTransformSnafu { side: "patch" })?;
    let target_geo = target
        .geo_transform()
        .context(NoGeoTransformSnafu { side: "target" })?;

    let patch_info = ImgInfo::new(source.size(), patch_geo);
    let target_info = ImgInfo::new(target.size(), target_geo);

    target_info
        .check_patch(&patch_info)
        .map_err(|reason| GeometryMismatchSnafu { reason }.build())?;

    let overviews = target.overview_count();
    let stop = options.stop_level.unwrap_or(overviews).min(overviews);

    ensure!(
        options.start_level <= overviews,
        InvalidStartLevelSnafu {
            start: options.start_level,
            overviews
        }
    );

    if options.resampling.is_some() {
        ensure!(target.overview_patcher().is_some(), NoOverviewPatchSnafu);
    }

    let pixels = target_info.pixel_window(&patch_info);
    let blocks = block_window(pixels, target.page_size());

    debug!(%pixels, %blocks, "placed patch");

    if options.start_level == 0 {
        progress.stage(PatchStage::CopyBase);
        copy_base(source, target, &patch_info, &target_info, pixels, blocks, progress)?;
        target.flush().context(FlushSnafu)?;
    }

    if let Some(resampling) = options.resampling {
        progress.stage(PatchStage::PropagateOverviews);
        propagate(target, blocks, options.start_level, stop, resampling, progress)?;
    }

    progress.stage(PatchStage::Done);

    Ok(blocks)
}

/// Copies the patch into every base block it overlaps.
fn copy_base<P: PatchProgress + ?Sized>(
    source: &mut dyn RasterSource,
    target: &mut dyn Raster,
    patch: &ImgInfo,
    info: &ImgInfo,
    pixels: Window,
    blocks: Window,
    progress: &P,
) -> Result<(), PatchError> {
    let page = target.page_size();
    let bands = target.bands();
    let width = target.data_type().size();
    let factor = info.factor(patch);
    let src = source.size();

    progress.blocks_start(blocks.w * blocks.h);

    for y in blocks.y..blocks.end_y() {
        for x in blocks.x..blocks.end_x() {
            let block = Window::new(x * page.x, y * page.y, page.x, page.y).clip(info.size);
            let covered = intersect(block, pixels);

            if covered.is_empty() {
                progress.block_completed();
                continue;
            }

            let req = WindowRequest::new(block, 0..bands, width);
            let mut buf = vec![0u8; block.w * block.h * bands * width];

            // Pixels outside of the patch keep the target content.
            if covered != block {
                target
                    .read_window(&req, &mut buf)
                    .context(ReadTargetSnafu { x, y })?;
            }

            let scaled = |v: usize, f: f64| (v as f64 * f + 0.5).floor() as usize;
            let sx = scaled(covered.x - pixels.x, factor.x).min(src.x.saturating_sub(1));
            let sy = scaled(covered.y - pixels.y, factor.y).min(src.y.saturating_sub(1));
            let window = Window::new(
                sx,
                sy,
                scaled(covered.w, factor.x).clamp(1, src.x - sx),
                scaled(covered.h, factor.y).clamp(1, src.y - sy),
            );

            let at = req.offset(0, covered.x - block.x, covered.y - block.y);
            let patch_req = WindowRequest::new(window, 0..bands, width)
                .with_buf(Size::new(covered.w, covered.h), req.spacing);

            source
                .read_window(&patch_req, &mut buf[at..])
                .context(ReadSourceSnafu { x, y })?;

            target
                .write_window(&req, &buf)
                .context(WriteTargetSnafu { x, y })?;

            progress.block_completed();
        }
    }

    Ok(())
}

/// Refreshes overview levels `start.max(1)..=stop`, halving the block
/// rectangle at each level.
fn propagate<P: PatchProgress + ?Sized>(
    target: &mut dyn Raster,
    mut blocks: Window,
    start: usize,
    stop: usize,
    resampling: Resampling,
    progress: &P,
) -> Result<(), PatchError> {
    let first = start.max(1);

    for level in 1..=stop {
        if level >= first {
            debug!(level, %blocks, %resampling, "refreshing overview");

            target
                .overview_patcher()
                .context(NoOverviewPatchSnafu)?
                .patch_overview(level - 1, blocks, resampling)
                .context(PatchOverviewSnafu { level })?;

            target.flush().context(FlushSnafu)?;
            progress.level_completed(level);
        }

        blocks = halve(blocks);
    }

    Ok(())
}
