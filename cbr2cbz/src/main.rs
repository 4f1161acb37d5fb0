#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cbz::{
    filter::{Patterns, Selection},
    image::{ImageBackend, Magick, Native},
    reader::Unrar,
    run_batch,
    shrink::ShrinkOptions,
    BatchOptions, Converter, Workspace,
};
use clap::{ArgAction, Parser};
use tracing::{debug, info, warn, Level};

/// Converts CBR (and optionally CBZ) archives into stored CBZ archives
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source file or directory
    source: Utf8PathBuf,
    /// Destination directory
    dest: Utf8PathBuf,
    /// Also convert CBZ files
    #[clap(short, long, action)]
    zipforce: bool,
    /// Lossy: re-encode large pages as JPEG
    #[clap(long, action)]
    shrink: bool,
    /// With --shrink, process pages larger than this many KB
    #[clap(long, default_value_t = 300)]
    shrink_kb: u64,
    /// With --shrink, JPEG quality
    #[clap(long, default_value_t = 40, value_parser = clap::value_parser!(u8).range(0..=100))]
    shrink_qual: u8,
    /// With --shrink, maximum page height in pixels
    #[clap(long, default_value_t = 1500)]
    shrink_height: u32,
    /// With --shrink, tools used to measure and re-encode pages
    #[clap(long, default_value_t = ImageBackend::Magick)]
    shrink_backend: ImageBackend,
    /// Put every output in the destination, without subdirectories
    #[clap(short, long, action)]
    flat: bool,
    /// Only process source files matching this regular expression
    #[clap(short, long = "match")]
    matches: Vec<String>,
    /// Only process source files matching a regular expression from this file
    #[clap(long)]
    matchfile: Option<Utf8PathBuf>,
    /// Exclude source files matching this regular expression
    #[clap(short, long)]
    exclude: Vec<String>,
    /// Exclude source files matching a regular expression from this file
    #[clap(long)]
    excludefile: Option<Utf8PathBuf>,
    /// Only keep pages matching this regular expression
    #[clap(long)]
    matchpage: Vec<String>,
    /// Only keep pages matching a regular expression from this file
    #[clap(long)]
    matchpagefile: Option<Utf8PathBuf>,
    /// Drop pages matching this regular expression
    #[clap(long)]
    excludepage: Vec<String>,
    /// Drop pages matching a regular expression from this file
    #[clap(long)]
    excludepagefile: Option<Utf8PathBuf>,
    /// Case sensitive regular expressions
    #[clap(long, alias = "case-sensitive", action)]
    cs: bool,
    /// More output, repeat for even more (-vvv)
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Only show what would be done
    #[clap(short, long, action)]
    whatif: bool,
    /// Kill external tools running longer than this many seconds
    #[clap(long)]
    timeout: Option<u64>,
    /// Program used to unpack RAR archives
    #[clap(long, default_value = "unrar")]
    unrar: String,
    /// ImageMagick identify program
    #[clap(long, default_value = "identify")]
    identify: String,
    /// ImageMagick convert program
    #[clap(long, default_value = "convert")]
    convert: String,
}

impl Args {
    fn selection(
        &self,
        include_file: Option<&Utf8Path>,
        include: &[String],
        exclude_file: Option<&Utf8Path>,
        exclude: &[String],
    ) -> Result<Selection> {
        Ok(Selection::new(
            load_patterns(include_file, include, self.cs)?,
            load_patterns(exclude_file, exclude, self.cs)?,
        ))
    }

    fn shrink_options(&self) -> Option<ShrinkOptions> {
        self.shrink.then(|| {
            ShrinkOptions::default()
                .set_threshold_kb(self.shrink_kb)
                .set_quality(self.shrink_qual)
                .set_max_height(self.shrink_height)
        })
    }

    fn converter(&self) -> Converter {
        let timeout = self.timeout.map(Duration::from_secs);
        let converter = Converter::new(
            Unrar::default()
                .set_program(&self.unrar)
                .set_timeout(timeout),
        );

        match self.shrink_backend {
            ImageBackend::Magick => {
                let magick = Magick::default()
                    .set_identify(&self.identify)
                    .set_convert(&self.convert)
                    .set_timeout(timeout);
                converter.set_probe(magick.clone()).set_transform(magick)
            }
            ImageBackend::Native => converter.set_probe(Native).set_transform(Native),
        }
    }
}

/// Patterns from `file` first, then the ones given on the command line
fn load_patterns(
    file: Option<&Utf8Path>,
    patterns: &[String],
    case_sensitive: bool,
) -> Result<Patterns> {
    let mut loaded = match file {
        Some(file) => Patterns::from_file(file, case_sensitive)
            .with_context(|| format!("couldn't load patterns from {file}"))?,
        None => Patterns::default(),
    };
    loaded.extend(Patterns::new(patterns, case_sensitive)?);

    Ok(loaded)
}

fn level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(level(args.verbose))
        .init();
    debug!("options: {args:?}");

    if args.whatif {
        warn!("running in test (WHATIF) mode");
    }

    let files = args.selection(
        args.matchfile.as_deref(),
        &args.matches,
        args.excludefile.as_deref(),
        &args.exclude,
    )?;
    let pages = args.selection(
        args.matchpagefile.as_deref(),
        &args.matchpage,
        args.excludepagefile.as_deref(),
        &args.excludepage,
    )?;

    let options = BatchOptions::new(args.source.as_std_path(), args.dest.as_std_path())
        .set_zip_force(args.zipforce)
        .set_flat(args.flat)
        .set_files(files)
        .set_pages(pages)
        .set_shrink(args.shrink_options())
        .set_dry_run(args.whatif);
    let converter = args.converter();

    let workspace = Workspace::for_process();
    debug!("workspace: {}", workspace.root().display());

    let result = run_batch(&options, &converter, &workspace);
    if let Err(err) = workspace.dispose() {
        warn!("couldn't remove workspace: {err}");
    }
    let report = result?;

    info!("converted: {}", report.tally.converted);
    info!("failed: {}", report.tally.failed);
    info!("skipped: {}", report.tally.skipped);
    info!("excluded: {}", report.tally.excluded);
    for failure in &report.failures {
        info!("failed conversion: {}", failure.display());
    }

    Ok(())
}
