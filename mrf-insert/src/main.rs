mod cli;

use clap::Parser;
use cli::Cli;
use mrf_insert::{BatchReport, ConsoleProgress, InsertOptions, Inserter, SilentProgress};
use snafu::{Snafu, ensure};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Top-level application errors for mrf-insert.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("{failed} of {total} sources could not be inserted"))]
    Insert { failed: usize, total: usize },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.quiet, cli.verbose);

    let mut options = InsertOptions::new().with_start_level(cli.start_level);

    if let Some(level) = cli.stop_level {
        options = options.with_stop_level(level);
    }

    if let Some(resampling) = cli.resampling {
        options = options.with_resampling(resampling);
    }

    let report = if cli.quiet {
        Inserter::new(options, SilentProgress).insert_files(&cli.sources, &cli.target)
    } else {
        Inserter::new(options, ConsoleProgress::new()).insert_files(&cli.sources, &cli.target)
    };

    let BatchReport { inserted, failed } = report;

    for (path, e) in &failed {
        error!(source = %path.display(), "{}", snafu::Report::from_error(e));
    }

    ensure!(
        failed.is_empty(),
        InsertSnafu {
            failed: failed.len(),
            total: inserted + failed.len()
        }
    );

    Ok(())
}

/// `RUST_LOG` overrides the level picked from `-q` and `-v`.
fn init_logging(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
