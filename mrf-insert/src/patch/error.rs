use crate::geometry::Mismatch;
use mrf_tile::image::DataType;
use mrf_tile::raster::RasterError;
use snafu::Snafu;

/// Errors that can occur while patching a target.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PatchError {
    #[snafu(display("patch data type {patch} differs from target data type {target}"))]
    DataTypeMismatch { patch: DataType, target: DataType },

    #[snafu(display("patch has {patch} bands, target has {target}"))]
    BandMismatch { patch: usize, target: usize },

    #[snafu(display("{side} has no geotransform"))]
    NoGeoTransform { side: &'static str },

    #[snafu(display("{reason}"))]
    GeometryMismatch { reason: Mismatch },

    #[snafu(display("start level {start} is past the last overview level {overviews}"))]
    InvalidStartLevel { start: usize, overviews: usize },

    #[snafu(display("target cannot refresh its overviews"))]
    NoOverviewPatch,

    // Base copy errors
    #[snafu(display("cannot read target block {x},{y}"))]
    ReadTarget {
        x: usize,
        y: usize,
        source: RasterError,
    },

    #[snafu(display("cannot read patch for block {x},{y}"))]
    ReadSource {
        x: usize,
        y: usize,
        source: RasterError,
    },

    #[snafu(display("cannot write target block {x},{y}"))]
    WriteTarget {
        x: usize,
        y: usize,
        source: RasterError,
    },

    #[snafu(display("cannot flush target"))]
    Flush { source: RasterError },

    // Overview errors
    #[snafu(display("cannot refresh overview level {level}"))]
    PatchOverview { level: usize, source: RasterError },
}
