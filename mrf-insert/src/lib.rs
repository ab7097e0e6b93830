//! Library for inserting georeferenced rasters into tiled pyramids.
//!
//! # Overview
//!
//! [`patch()`] copies any [`RasterSource`](mrf_tile::raster::RasterSource)
//! into the base level of a [`Raster`](mrf_tile::raster::Raster) and refreshes
//! the overview blocks the patch covers. [`Inserter`] does the same for
//! pyramids on disk, one or more source files at a time.
//!
//! # Example
//!
//! ```no_run
//! use mrf_insert::{InsertOptions, Inserter, SilentProgress};
//! use mrf_tile::raster::Resampling;
//!
//! let options = InsertOptions::new().with_resampling(Resampling::Average);
//! let inserter = Inserter::new(options, SilentProgress);
//! let report = inserter.insert_files(&["patch.mrf"], "world.mrf");
//!
//! assert!(report.failed.is_empty());
//! ```
//!
//! # Custom progress reporting
//!
//! You can implement the [`PatchProgress`] trait to receive progress updates
//! during the base copy and the overview refresh.

pub mod geometry;
pub mod patch;
pub mod progress;

pub use self::patch::{InsertOptions, PatchError, patch};
pub use self::progress::{PatchProgress, PatchStage, SilentProgress};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use mrf_tile::{CacheMode, OpenOptions};
use mrf_tile::band::Access;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing::info;

/// Errors that can occur when inserting a pyramid file.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum InsertError {
    #[snafu(display("cannot open source {}", path.display()))]
    OpenSource {
        path: PathBuf,
        source: mrf_tile::OpenError,
    },

    #[snafu(display("cannot open target {}", path.display()))]
    OpenTarget {
        path: PathBuf,
        source: mrf_tile::OpenError,
    },

    #[snafu(display("cannot patch {} into {}", path.display(), target.display()))]
    Patch {
        path: PathBuf,
        target: PathBuf,
        source: PatchError,
    },
}

/// Outcome of [`Inserter::insert_files()`].
#[derive(Debug, Default)]
pub struct BatchReport {
    pub inserted: usize,
    pub failed: Vec<(PathBuf, InsertError)>,
}

/// Inserts pyramid files into a target pyramid.
pub struct Inserter<P: PatchProgress> {
    options: InsertOptions,
    progress: P,
}

impl<P: PatchProgress> Inserter<P> {
    pub fn new(options: InsertOptions, progress: P) -> Self {
        Self { options, progress }
    }

    /// Inserts one source.
    pub fn insert_file(
        &self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<(), InsertError> {
        let source = source.as_ref();
        let target = target.as_ref();

        // Sources are never written, not even to cache tiles of their own source.
        let mut src = mrf_tile::open(source, &OpenOptions::new().with_cache(CacheMode::Off))
            .context(OpenSourceSnafu { path: source })?;
        let mut dst = mrf_tile::open(target, &OpenOptions::new().with_access(Access::Update))
            .context(OpenTargetSnafu { path: target })?;

        let blocks = patch(&mut src, &mut dst, &self.options, &self.progress)
            .context(PatchSnafu { path: source, target })?;

        info!(
            source = %source.display(),
            target = %target.display(),
            %blocks,
            "inserted"
        );

        Ok(())
    }

    /// Inserts every source in turn, a failure does not stop the batch.
    pub fn insert_files<S: AsRef<Path>>(
        &self,
        sources: &[S],
        target: impl AsRef<Path>,
    ) -> BatchReport {
        let target = target.as_ref();
        let mut report = BatchReport::default();

        for (i, source) in sources.iter().enumerate() {
            let source = source.as_ref();

            self.progress.source_start(source, i, sources.len());

            match self.insert_file(source, target) {
                Ok(()) => {
                    self.progress.source_completed(source);
                    report.inserted += 1;
                }
                Err(e) => {
                    self.progress.source_failed(source, &e);
                    report.failed.push((source.to_path_buf(), e));
                }
            }
        }

        report
    }
}
