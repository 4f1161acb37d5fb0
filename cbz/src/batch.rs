use std::{
    fmt::Display,
    path::{self, Component, Path, PathBuf},
};

use tracing::{debug, error, info, trace, warn};
use walkdir::{DirEntry, WalkDir};

use crate::{
    convert::{ConversionRequest, Converter},
    filter::{PageDecision, Selection},
    shrink::ShrinkOptions,
    workspace::Workspace,
    writer::ascii_lossy,
    Error, Result,
};

/// A whole source tree to convert into a destination tree
#[derive(Debug, Clone)]
pub struct BatchOptions {
    source: PathBuf,
    destination: PathBuf,
    zip_force: bool,
    flat: bool,
    files: Selection,
    pages: Selection,
    shrink: Option<ShrinkOptions>,
    dry_run: bool,
}

impl BatchOptions {
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            zip_force: false,
            flat: false,
            files: Selection::all(),
            pages: Selection::all(),
            shrink: None,
            dry_run: false,
        }
    }

    /// Also convert `.cbz` files
    #[must_use]
    pub fn set_zip_force(mut self, zip_force: bool) -> Self {
        self.zip_force = zip_force;
        self
    }

    /// Put every output straight into the destination
    #[must_use]
    pub fn set_flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    /// Selects source files by their full path
    #[must_use]
    pub fn set_files(mut self, files: Selection) -> Self {
        self.files = files;
        self
    }

    #[must_use]
    pub fn set_pages(mut self, pages: Selection) -> Self {
        self.pages = pages;
        self
    }

    #[must_use]
    pub fn set_shrink(mut self, shrink: Option<ShrinkOptions>) -> Self {
        self.shrink = shrink;
        self
    }

    #[must_use]
    pub fn set_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn is_candidate(&self, path: &Path) -> bool {
        path.extension().map_or(false, |extension| {
            extension.eq_ignore_ascii_case("cbr")
                || (self.zip_force && extension.eq_ignore_ascii_case("cbz"))
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub converted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub excluded: usize,
}

impl Display for Tally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "converted: {}, failed: {}, skipped: {}, excluded: {}",
            self.converted, self.failed, self.skipped, self.excluded
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub tally: Tally,
    pub failures: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

/// Output path of `input`, found under `walk_root`: the mirrored (or flat)
/// directory with ASCII-only names, `.cbr` becoming `.cbz`
fn output_path(options: &BatchOptions, walk_root: &Path, input: &Path) -> PathBuf {
    let mut output = options.destination.clone();

    if !options.flat {
        let relative_dir = input
            .parent()
            .and_then(|parent| parent.strip_prefix(walk_root).ok())
            .unwrap_or_else(|| Path::new(""));
        for component in relative_dir.components() {
            if let Component::Normal(name) = component {
                output.push(ascii_lossy(&name.to_string_lossy()));
            }
        }
    }

    let mut name = input
        .file_name()
        .map(|name| ascii_lossy(&name.to_string_lossy()))
        .unwrap_or_default();
    if name.len() >= 4 && name[name.len() - 4..].eq_ignore_ascii_case(".cbr") {
        name.truncate(name.len() - 4);
        name.push_str(".cbz");
    }
    output.push(name);

    output
}

fn is_inside(entry: &DirEntry, destination: &Path) -> bool {
    entry.file_type().is_dir() && entry.path().starts_with(destination)
}

#[allow(clippy::cast_precision_loss)]
fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1_000_000.0
}

#[allow(clippy::cast_precision_loss)]
fn ratio(new: u64, old: u64) -> f64 {
    if old == 0 {
        return 0.0;
    }
    new as f64 / old as f64
}

/// Converts every candidate archive found under the source into the
/// destination tree, one at a time, using `workspace` for each of them.
///
/// A single file as source converts just that file into the destination.
///
/// ## Errors
///
/// Fails right away on an invalid source. A failing conversion is counted and
/// the batch goes on, unless the error is fatal.
pub fn run_batch(
    options: &BatchOptions,
    converter: &Converter,
    workspace: &Workspace,
) -> Result<BatchReport> {
    let source = path::absolute(&options.source)?;
    let destination = path::absolute(&options.destination)?;

    if source == destination {
        return Err(Error::InvalidSource {
            path: source,
            reason: "source and destination are the same",
        });
    }
    if !source.exists() {
        return Err(Error::InvalidSource {
            path: source,
            reason: "doesn't exist",
        });
    }

    let (walk_root, single_file) = if source.is_file() {
        debug!("single file mode: {}", source.display());
        let parent = source.parent().map(Path::to_path_buf).unwrap_or_default();
        (parent, Some(source.clone()))
    } else if source.is_dir() {
        (source.clone(), None)
    } else {
        return Err(Error::InvalidSource {
            path: source,
            reason: "not a file or directory",
        });
    };

    let options = BatchOptions {
        destination,
        ..options.clone()
    };
    let mut report = BatchReport::default();

    // A directory's own files come before its subdirectories
    let mut walker = WalkDir::new(&walk_root).sort_by(|a, b| {
        a.file_type()
            .is_dir()
            .cmp(&b.file_type().is_dir())
            .then_with(|| a.file_name().cmp(b.file_name()))
    });
    if single_file.is_some() {
        walker = walker.max_depth(1);
    }

    let entries = walker.into_iter().filter_entry(|entry| {
        let inside = is_inside(entry, &options.destination);
        if inside {
            debug!("skipping {}, inside destination", entry.path().display());
        }
        !inside
    });

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("couldn't walk: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let input = entry.path();
        if single_file.as_deref().map_or(false, |file| file != input) {
            continue;
        }

        convert_one(&options, &walk_root, input, converter, workspace, &mut report)?;
    }

    info!("results: {}", report.tally);
    if !report.failures.is_empty() {
        debug!("failed conversions:");
        for failure in &report.failures {
            debug!("{}", failure.display());
        }
    }

    Ok(report)
}

fn convert_one(
    options: &BatchOptions,
    walk_root: &Path,
    input: &Path,
    converter: &Converter,
    workspace: &Workspace,
    report: &mut BatchReport,
) -> Result<()> {
    trace!("file {}", input.display());

    if options.files.decide(&input.to_string_lossy()) == PageDecision::Excluded {
        info!("ResultExcluded: {}", input.display());
        report.tally.excluded += 1;
        return Ok(());
    }

    if !options.is_candidate(input) {
        trace!("not an archive to convert: {}", input.display());
        return Ok(());
    }

    let output = output_path(options, walk_root, input);
    if output.exists() {
        info!("ResultSkipped: {}", input.display());
        report.tally.skipped += 1;
        return Ok(());
    }

    let request = ConversionRequest::new(input, &output)
        .set_pages(options.pages.clone())
        .set_shrink(options.shrink)
        .set_dry_run(options.dry_run);

    info!("converting {}", input.display());
    match converter.convert(&request, workspace) {
        Ok(conversion) if conversion.dry_run => {}
        Ok(conversion) => {
            info!(
                "ResultConvert: {:.3} {:.1}/{:.1} MB {}",
                ratio(conversion.output_bytes, conversion.input_bytes),
                megabytes(conversion.output_bytes),
                megabytes(conversion.input_bytes),
                input.display()
            );
            report.tally.converted += 1;
            report.outputs.push(output);
        }
        Err(err) if err.is_fatal() => {
            error!("aborting on {}: {err}", input.display());
            return Err(err);
        }
        Err(err) => {
            let stage = err
                .stage()
                .map(|stage| stage.to_string())
                .unwrap_or_default();
            error!("ResultFailed: {} [{stage}] {err}", input.display());
            report.tally.failed += 1;
            report.failures.push(input.to_path_buf());
        }
    }

    Ok(())
}
