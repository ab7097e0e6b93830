//! A library for reading and writing tiled raster pyramids.
//!
//! A pyramid is made of three files:
//!
//! - a header (`<name>.mrf`) describing the raster, see [`header`];
//! - an index (`<name>.idx`) with one record per tile, see [`index`];
//! - a data file (`<name>.dat`) holding the compressed tiles.
//!
//! Tiles missing from the index can be fetched on demand from a source
//! pyramid, either resampled through windowed reads or copied verbatim from a
//! clone with the same structure.
//!
//! # Example
//!
//! ```no_run
//! use mrf_tile::raster::{RasterSource, Window, WindowRequest};
//! use mrf_tile::OpenOptions;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pyramid = mrf_tile::open("world.mrf", &OpenOptions::new())?;
//!
//! let req = WindowRequest::new(Window::new(0, 0, 256, 256), 0..1, 1);
//! let mut buf = vec![0u8; 256 * 256];
//! pyramid.read_window(&req, &mut buf)?;
//! # Ok(())
//! # }
//! ```

use self::band::{Access, BlockEngine, Source};
use self::header::Header;
use self::image::DescError;
use self::index::{FileStore, Mode, StoreError};
use self::pyramid::Pyramid;
use snafu::{ResultExt, Snafu, ensure};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod band;
pub mod buffer;
pub mod cache;
pub mod codec;
pub mod deflate;
pub mod header;
pub mod image;
pub mod index;
pub mod pyramid;
pub mod raster;

/// How tiles fetched from a source are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Fetched tiles are stored in the pyramid.
    #[default]
    WriteBack,
    /// Only empty tiles are recorded, the data file is never written.
    ReadThrough,
    /// Both files are read-only. Missing tiles are not fetched and read as
    /// nodata.
    Off,
}

impl CacheMode {
    fn modes(self) -> (Mode, Mode) {
        match self {
            Self::WriteBack => (Mode::Write, Mode::Write),
            Self::ReadThrough => (Mode::Write, Mode::Read),
            Self::Off => (Mode::Read, Mode::Read),
        }
    }
}

/// Options for [`open()`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: Access,
    /// Ignored with [`Access::Update`], which always writes both files.
    pub cache: CacheMode,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }
}

/// Errors for [`open()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot read header {}", path.display()))]
    ReadHeaderIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot parse header {}", path.display()))]
    ReadHeader {
        path: PathBuf,
        source: header::ReadError,
    },

    #[snafu(display("cannot open {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot open tile storage"))]
    OpenStore { source: StoreError },

    #[snafu(display("cannot open source {}", path.display()))]
    OpenSource {
        path: PathBuf,
        #[snafu(source(from(OpenError, Box::new)))]
        source: Box<OpenError>,
    },

    #[snafu(display("source {} does not match the pyramid structure", path.display()))]
    SourceMismatch { path: PathBuf },

    #[snafu(display("invalid image description"))]
    InvalidDesc { source: DescError },
}

/// Errors for [`create()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CreateError {
    #[snafu(display("invalid image description"))]
    InvalidDescription { source: DescError },

    #[snafu(display("cannot serialize header"))]
    SerializeHeader { source: header::WriteError },

    #[snafu(display("cannot write {}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot initialize tile storage"))]
    CreateStore { source: StoreError },
}

/// Path of the index file of the pyramid whose header is `path`.
#[must_use]
pub fn index_path(path: &Path) -> PathBuf {
    path.with_extension("idx")
}

/// Path of the data file of the pyramid whose header is `path`.
#[must_use]
pub fn data_path(path: &Path) -> PathBuf {
    path.with_extension("dat")
}

/// Creates a pyramid, replacing any existing one, and opens it for update.
pub fn create(path: impl AsRef<Path>, header: &Header) -> Result<Pyramid, CreateError> {
    let path = path.as_ref();

    header.desc.validate().context(InvalidDescriptionSnafu)?;

    let bytes = header.to_bytes().context(SerializeHeaderSnafu)?;

    std::fs::write(path, bytes).context(WriteFileSnafu { path })?;

    let create = |path: PathBuf| {
        File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .context(WriteFileSnafu { path })
    };

    let index = create(index_path(path))?;
    let data = create(data_path(path))?;
    let store = FileStore::create(index, data).context(CreateStoreSnafu)?;

    debug!(path = %path.display(), levels = header.desc.levels, "created pyramid");

    // Sources are only used when the pyramid is reopened read-only.
    let engine = BlockEngine::new(header.desc.clone(), Box::new(store), Access::Update, None)
        .context(InvalidDescriptionSnafu)?;

    Ok(Pyramid::new(engine, header.geo))
}

/// Opens an existing pyramid.
///
/// With [`Access::ReadOnly`], the source recorded in the header is opened too
/// and missing tiles are fetched from it according to `options.cache`.
pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Pyramid, OpenError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).context(ReadHeaderIoSnafu { path })?;
    let header = Header::from_bytes(&bytes).context(ReadHeaderSnafu { path })?;

    let (index_mode, data_mode) = match options.access {
        Access::Update => (Mode::Write, Mode::Write),
        Access::ReadOnly => options.cache.modes(),
    };

    let open_file = |path: PathBuf, mode: Mode| {
        File::options()
            .read(true)
            .write(mode == Mode::Write)
            .open(&path)
            .context(OpenFileSnafu { path })
    };

    let index = open_file(index_path(path), index_mode)?;
    let data = open_file(data_path(path), data_mode)?;
    let store = FileStore::open(index, data, index_mode, data_mode).context(OpenStoreSnafu)?;

    let source = match (&header.source, options.access) {
        (Some(src), Access::ReadOnly) => Some(open_source(path, &header, &src.path, src.clone)?),
        _ => None,
    };

    debug!(
        path = %path.display(),
        access = ?options.access,
        cache = ?options.cache,
        source = source.is_some(),
        "opened pyramid"
    );

    let engine = BlockEngine::new(header.desc, Box::new(store), options.access, source)
        .context(InvalidDescSnafu)?;

    Ok(Pyramid::new(engine, header.geo))
}

fn open_source(
    path: &Path,
    header: &Header,
    source: &Path,
    clone: bool,
) -> Result<Source, OpenError> {
    // Relative sources are relative to the header.
    let source = match path.parent() {
        Some(dir) if source.is_relative() => dir.join(source),
        _ => source.to_path_buf(),
    };

    let options = if clone {
        OpenOptions::new().with_cache(CacheMode::Off)
    } else {
        OpenOptions::new()
    };

    let pyramid = open(&source, &options).context(OpenSourceSnafu { path: &source })?;
    let desc = &header.desc;
    let theirs = pyramid.desc();

    ensure!(
        theirs.data_type == desc.data_type && theirs.bands == desc.bands,
        SourceMismatchSnafu { path: &source }
    );

    if !clone {
        return Ok(Source::Raster(Box::new(pyramid)));
    }

    // Copied tiles must decode the same way in both pyramids.
    ensure!(
        theirs.size == desc.size
            && theirs.page == desc.page
            && theirs.order == desc.order
            && theirs.compression == desc.compression
            && theirs.deflate.map(|d| d.format) == desc.deflate.map(|d| d.format)
            && theirs.scale == desc.scale,
        SourceMismatchSnafu { path: &source }
    );

    Ok(Source::Clone(Box::new(pyramid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockKey;
    use crate::header::SourceRef;
    use crate::image::{DataType, ImageDesc, PageSize, Size};
    use crate::index::TileState;
    use crate::raster::{Raster, RasterSource, Window, WindowRequest};
    use tempfile::TempDir;

    fn desc() -> ImageDesc {
        ImageDesc::new(Size::new(40, 24), PageSize::new(16, 16, 1), 1, DataType::Byte)
            .with_nodata(0.0)
            .with_full_pyramid()
    }

    fn base(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("base.mrf");
        let mut p = create(&path, &Header::new(desc())).unwrap();
        let data: Vec<u8> = (0..40 * 24).map(|i| (i % 200 + 1) as u8).collect();

        p.write_window(&WindowRequest::new(Window::new(0, 0, 40, 24), 0..1, 1), &data)
            .unwrap();
        p.flush().unwrap();
        path
    }

    fn pixel(p: &mut Pyramid, x: usize, y: usize) -> u8 {
        let mut buf = [0u8; 1];
        p.read_window(&WindowRequest::new(Window::new(x, y, 1, 1), 0..1, 1), &mut buf)
            .unwrap();
        buf[0]
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = base(&dir);

        assert!(index_path(&path).exists());
        assert!(data_path(&path).exists());

        let mut p = open(&path, &OpenOptions::new()).unwrap();
        assert_eq!(p.desc(), &desc());
        assert_eq!(pixel(&mut p, 5, 2), (2 * 40 + 5 + 1) as u8);

        let req = WindowRequest::new(Window::new(0, 0, 1, 1), 0..1, 1);
        assert!(p.write_window(&req, &[1]).is_err());
    }

    #[test]
    fn test_clone_source() {
        let dir = TempDir::new().unwrap();
        base(&dir);

        let path = dir.path().join("copy.mrf");
        let header = Header {
            source: Some(SourceRef {
                path: PathBuf::from("base.mrf"),
                clone: true,
            }),
            ..Header::new(desc())
        };
        drop(create(&path, &header).unwrap());

        let mut p = open(&path, &OpenOptions::new()).unwrap();
        let key = BlockKey::new(0, 0, 2, 1);

        assert_eq!(p.tile_idx(&key).unwrap().state(), TileState::Hole);
        assert_eq!(pixel(&mut p, 39, 23), ((23 * 40 + 39) % 200 + 1) as u8);
        assert_eq!(p.tile_idx(&key).unwrap().state(), TileState::Present);

        // The copied tile survives without the source.
        drop(p);
        std::fs::remove_file(dir.path().join("base.mrf")).unwrap();

        assert!(matches!(
            open(&path, &OpenOptions::new()),
            Err(OpenError::OpenSource { .. })
        ));

        let mut p = open(&path, &OpenOptions::new().with_access(Access::Update)).unwrap();
        assert_eq!(pixel(&mut p, 39, 23), ((23 * 40 + 39) % 200 + 1) as u8);
    }

    #[test]
    fn test_read_through_source() {
        let dir = TempDir::new().unwrap();
        base(&dir);

        let path = dir.path().join("cache.mrf");
        let header = Header {
            source: Some(SourceRef {
                path: dir.path().join("base.mrf"),
                clone: false,
            }),
            ..Header::new(desc())
        };
        drop(create(&path, &header).unwrap());

        let options = OpenOptions::new().with_cache(CacheMode::ReadThrough);
        let mut p = open(&path, &options).unwrap();

        assert_eq!(pixel(&mut p, 20, 3), (3 * 40 + 20 + 1) as u8);
        assert_eq!(
            p.tile_idx(&BlockKey::new(0, 0, 1, 0)).unwrap().state(),
            TileState::Hole
        );
        assert_eq!(std::fs::metadata(data_path(&path)).unwrap().len(), 4);
    }

    #[test]
    fn test_source_mismatch() {
        let dir = TempDir::new().unwrap();
        base(&dir);

        let path = dir.path().join("wide.mrf");
        let wide = ImageDesc::new(Size::new(40, 24), PageSize::new(8, 8, 1), 1, DataType::Byte);
        let header = Header {
            source: Some(SourceRef {
                path: PathBuf::from("base.mrf"),
                clone: true,
            }),
            ..Header::new(wide)
        };
        drop(create(&path, &header).unwrap());

        assert!(matches!(
            open(&path, &OpenOptions::new()),
            Err(OpenError::SourceMismatch { .. })
        ));
    }
}
