//! Placement of a patch inside a target pyramid.

use mrf_tile::image::{PageSize, Size};
use mrf_tile::raster::{GeoTransform, Window};
use std::fmt::{self, Display, Formatter};

/// Absolute tolerance, in georeferenced units, when checking that a patch
/// lies inside the target.
pub const BOUNDS_TOLERANCE: f64 = 0.01;

/// An axis-aligned extent in georeferenced coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bounds {
    pub lx: f64,
    pub ly: f64,
    pub ux: f64,
    pub uy: f64,
}

impl Bounds {
    /// Whether `other` lies inside, within [`BOUNDS_TOLERANCE`] on every side.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.lx >= self.lx - BOUNDS_TOLERANCE
            && other.ly >= self.ly - BOUNDS_TOLERANCE
            && other.ux <= self.ux + BOUNDS_TOLERANCE
            && other.uy <= self.uy + BOUNDS_TOLERANCE
    }
}

impl Display for Bounds {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) - ({}, {})", self.lx, self.ly, self.ux, self.uy)
    }
}

/// A pair of values, one per axis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct XY {
    pub x: f64,
    pub y: f64,
}

impl Display for XY {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.x, self.y)
    }
}

/// Why a patch does not fit its target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Mismatch {
    Outside { patch: Bounds, target: Bounds },
    Resolution { patch: XY, target: XY },
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outside { patch, target } => {
                write!(f, "patch {patch} is outside of the target {target}")
            }
            Self::Resolution { patch, target } => {
                write!(f, "patch resolution {patch} differs from target resolution {target}")
            }
        }
    }
}

/// Extent and resolution of a georeferenced raster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImgInfo {
    pub size: Size,
    pub geo: GeoTransform,
    pub bounds: Bounds,
    pub res: XY,
}

impl ImgInfo {
    #[must_use]
    pub fn new(size: Size, geo: GeoTransform) -> Self {
        let (ox, oy) = (geo.origin_x(), geo.origin_y());
        let x1 = ox + size.x as f64 * geo.res_x();
        let y1 = oy + size.y as f64 * geo.res_y();

        Self {
            size,
            geo,
            bounds: Bounds {
                lx: ox.min(x1),
                ly: oy.min(y1),
                ux: ox.max(x1),
                uy: oy.max(y1),
            },
            res: XY {
                x: geo.res_x(),
                y: geo.res_y(),
            },
        }
    }

    /// Checks that `patch` can be copied into this raster.
    ///
    /// Resolutions may differ by 0.1% of this raster's resolution.
    pub fn check_patch(&self, patch: &Self) -> Result<(), Mismatch> {
        if !self.bounds.contains(&patch.bounds) {
            return Err(Mismatch::Outside {
                patch: patch.bounds,
                target: self.bounds,
            });
        }

        let close = |p: f64, t: f64| (p - t).abs() * 1000.0 <= t.abs();

        if !close(patch.res.x, self.res.x) || !close(patch.res.y, self.res.y) {
            return Err(Mismatch::Resolution {
                patch: patch.res,
                target: self.res,
            });
        }

        Ok(())
    }

    /// Pixels of this raster covered by `patch`, rounded to the nearest pixel
    /// edge.
    #[must_use]
    pub fn pixel_window(&self, patch: &Self) -> Window {
        let to_pixel = |v: f64, origin: f64, res: f64| ((v - origin) / res + 0.5).floor();
        let (ox, oy) = (self.geo.origin_x(), self.geo.origin_y());

        let px0 = to_pixel(patch.geo.origin_x(), ox, self.res.x);
        let px1 = to_pixel(
            patch.geo.origin_x() + patch.size.x as f64 * patch.res.x,
            ox,
            self.res.x,
        );
        let py0 = to_pixel(patch.geo.origin_y(), oy, self.res.y);
        let py1 = to_pixel(
            patch.geo.origin_y() + patch.size.y as f64 * patch.res.y,
            oy,
            self.res.y,
        );

        let clamp = |v: f64, max: usize| (v.max(0.0) as usize).min(max);
        let x0 = clamp(px0.min(px1), self.size.x);
        let x1 = clamp(px0.max(px1), self.size.x);
        let y0 = clamp(py0.min(py1), self.size.y);
        let y1 = clamp(py0.max(py1), self.size.y);

        Window::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Source pixels per target pixel, for each axis.
    #[must_use]
    pub fn factor(&self, patch: &Self) -> XY {
        XY {
            x: (self.res.x / patch.res.x).abs(),
            y: (self.res.y / patch.res.y).abs(),
        }
    }
}

/// Blocks overlapping a pixel window.
#[must_use]
pub fn block_window(pixels: Window, page: PageSize) -> Window {
    if pixels.is_empty() {
        return Window::new(pixels.x / page.x, pixels.y / page.y, 0, 0);
    }

    let x0 = pixels.x / page.x;
    let y0 = pixels.y / page.y;
    let x1 = pixels.end_x().div_ceil(page.x);
    let y1 = pixels.end_y().div_ceil(page.y);

    Window::new(x0, y0, x1 - x0, y1 - y0)
}

/// Pixels in both windows.
#[must_use]
pub fn intersect(a: Window, b: Window) -> Window {
    let x = a.x.max(b.x);
    let y = a.y.max(b.y);
    let end_x = a.end_x().min(b.end_x()).max(x);
    let end_y = a.end_y().min(b.end_y()).max(y);

    Window::new(x, y, end_x - x, end_y - y)
}

/// Blocks of the next coarser level covering `blocks`, for a 2:1 reduction.
#[must_use]
pub fn halve(blocks: Window) -> Window {
    let x = blocks.x / 2;
    let y = blocks.y / 2;

    Window::new(
        x,
        y,
        (blocks.end_x() + 1) / 2 - x,
        (blocks.end_y() + 1) / 2 - y,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn target() -> ImgInfo {
        ImgInfo::new(Size::new(1000, 1000), GeoTransform::new(0.0, 1.0, 1000.0, -1.0))
    }

    #[test]
    fn test_sample_maps_to_one_block() {
        let target = target();
        let patch = ImgInfo::new(Size::new(256, 256), GeoTransform::new(512.0, 1.0, 488.0, -1.0));

        assert_eq!(target.check_patch(&patch), Ok(()));

        let pixels = target.pixel_window(&patch);
        assert_eq!(pixels, Window::new(512, 512, 256, 256));
        assert_eq!(
            block_window(pixels, PageSize::new(256, 256, 1)),
            Window::new(2, 2, 1, 1)
        );
    }

    #[test]
    fn test_partial_blocks_are_covered() {
        let pixels = Window::new(200, 10, 100, 5);

        assert_eq!(
            block_window(pixels, PageSize::new(256, 256, 1)),
            Window::new(0, 0, 2, 1)
        );
    }

    #[test]
    fn test_intersect() {
        let a = Window::new(0, 0, 16, 16);

        assert_eq!(intersect(a, Window::new(8, 4, 20, 2)), Window::new(8, 4, 8, 2));
        assert!(intersect(a, Window::new(16, 0, 4, 4)).is_empty());
    }

    #[test]
    fn test_halve() {
        assert_eq!(halve(Window::new(3, 5, 7, 9)), Window::new(1, 2, 4, 5));
        assert_eq!(halve(Window::new(2, 2, 1, 1)), Window::new(1, 1, 1, 1));
        assert_eq!(halve(Window::new(0, 0, 4, 3)), Window::new(0, 0, 2, 2));
    }

    #[rstest]
    #[case(-1.0, 0.0)]
    #[case(1.0, 0.0)]
    #[case(0.0, -1.0)]
    #[case(0.0, 1.0)]
    fn test_outside_by_one_pixel(#[case] dx: f64, #[case] dy: f64) {
        let target = target();
        let patch = ImgInfo::new(
            Size::new(1000, 1000),
            GeoTransform::new(dx, 1.0, 1000.0 + dy, -1.0),
        );

        assert!(matches!(
            target.check_patch(&patch),
            Err(Mismatch::Outside { .. })
        ));
    }

    #[test]
    fn test_tolerances() {
        let target = target();

        let nudged = ImgInfo::new(Size::new(10, 10), GeoTransform::new(-0.005, 1.0, 1000.005, -1.0));
        assert_eq!(target.check_patch(&nudged), Ok(()));
        assert_eq!(target.pixel_window(&nudged), Window::new(0, 0, 10, 10));

        let close = ImgInfo::new(Size::new(10, 10), GeoTransform::new(0.0, 1.0005, 1000.0, -1.0));
        assert_eq!(target.check_patch(&close), Ok(()));

        let coarse = ImgInfo::new(Size::new(10, 10), GeoTransform::new(0.0, 1.002, 1000.0, -1.0));
        assert!(matches!(
            target.check_patch(&coarse),
            Err(Mismatch::Resolution { .. })
        ));
    }
}
