use clap::{ArgAction, Parser};
use mrf_tile::raster::Resampling;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "mrf-insert")]
#[command(about = "Insert rasters into a tiled pyramid", long_about = None)]
pub struct Cli {
    /// Refresh the overviews covered by each source (avg or near)
    #[arg(short, long, value_name = "METHOD")]
    pub resampling: Option<Resampling>,

    /// First level to write, the base level is skipped when not 0
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub start_level: usize,

    /// Last overview level to refresh
    #[arg(long, value_name = "N")]
    pub stop_level: Option<usize>,

    /// Suppress progress output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log more details, repeat for even more
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Pyramids to insert
    #[arg(value_name = "SOURCE", required = true, num_args = 1..)]
    pub sources: Vec<PathBuf>,

    /// Pyramid receiving the sources
    #[arg(value_name = "TARGET")]
    pub target: PathBuf,
}
