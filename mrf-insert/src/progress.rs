use std::fmt::{self, Display, Formatter};
use std::path::Path;

/// Stages of one patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchStage {
    Validate,
    CopyBase,
    PropagateOverviews,
    Done,
}

impl Display for PatchStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validate => "validate",
            Self::CopyBase => "copy base",
            Self::PropagateOverviews => "propagate overviews",
            Self::Done => "done",
        })
    }
}

/// Trait for receiving insert progress updates.
pub trait PatchProgress {
    /// Called when starting to insert a source file.
    fn source_start(&self, _path: &Path, _current: usize, _total: usize) {}

    /// Called when a patch enters a new stage.
    fn stage(&self, _stage: PatchStage) {}

    /// Called before copying base blocks.
    fn blocks_start(&self, _total: usize) {}

    /// Called when a base block has been copied into the target.
    fn block_completed(&self) {}

    /// Called when an overview level has been refreshed.
    fn level_completed(&self, _level: usize) {}

    /// Called when a source file has been inserted.
    fn source_completed(&self, _path: &Path) {}

    /// Called when a source file could not be inserted.
    fn source_failed(&self, _path: &Path, _error: &dyn std::error::Error) {}
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl PatchProgress for SilentProgress {}

/// Console progress reporter using an indicatif progress bar for the base
/// copy.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl PatchProgress for ConsoleProgress {
    fn source_start(&self, path: &Path, current: usize, total: usize) {
        println!("[{}/{}] {}", current + 1, total, path.display());
    }

    fn stage(&self, stage: PatchStage) {
        self.bar.set_message(stage.to_string());
    }

    fn blocks_start(&self, total: usize) {
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total as u64);
        self.bar.set_position(0);

        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} blocks {msg} [{elapsed_precise}]")
        {
            self.bar.set_style(style.progress_chars("━╸─"));
        }

        self.bar.reset();
    }

    fn block_completed(&self) {
        self.bar.inc(1);
    }

    fn level_completed(&self, level: usize) {
        self.bar.set_message(format!("overview {level}"));
    }

    fn source_completed(&self, path: &Path) {
        self.bar.finish_and_clear();
        println!("Inserted {}.", path.display());
    }

    fn source_failed(&self, path: &Path, _error: &dyn std::error::Error) {
        self.bar.finish_and_clear();
        eprintln!("Failed to insert {}.", path.display());
    }
}
