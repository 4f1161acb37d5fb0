use std::{fs, path::PathBuf};

use tracing::{debug, info, warn};

use crate::{
    errors::PreconditionError,
    filter::{filter_pages, Selection},
    image::{ImageProbe, ImageTransform, Magick},
    reader::{self, ArchiveKind, Unpacker, Unrar},
    shrink::{ShrinkOptions, ShrinkReport, Shrinker},
    workspace::Workspace,
    writer::write_archive,
    Result,
};

/// One archive to convert, and how
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    input: PathBuf,
    output: PathBuf,
    pages: Selection,
    shrink: Option<ShrinkOptions>,
    dry_run: bool,
}

impl ConversionRequest {
    #[must_use]
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            pages: Selection::all(),
            shrink: None,
            dry_run: false,
        }
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
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    /// Nothing was done past the preconditions
    pub dry_run: bool,
    pub archive_kind: Option<ArchiveKind>,
    pub extracted: usize,
    pub excluded: Vec<PathBuf>,
    pub shrink: Option<ShrinkReport>,
    /// Archive entry names, in archive order
    pub entries: Vec<String>,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Runs the conversion stages with a given set of external tools
pub struct Converter {
    unpacker: Box<dyn Unpacker>,
    probe: Box<dyn ImageProbe>,
    transform: Box<dyn ImageTransform>,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(Unrar::default())
    }
}

impl Converter {
    #[must_use]
    pub fn new(unpacker: impl Unpacker + 'static) -> Self {
        Self {
            unpacker: Box::new(unpacker),
            probe: Box::new(Magick::default()),
            transform: Box::new(Magick::default()),
        }
    }

    #[must_use]
    pub fn set_probe(mut self, probe: impl ImageProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    #[must_use]
    pub fn set_transform(mut self, transform: impl ImageTransform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// Converts `request.input` into a stored zip at `request.output`, going
    /// through extraction, page filtering and, if asked, shrinking, inside
    /// `workspace`.
    ///
    /// The workspace is emptied before and after the conversion.
    ///
    /// ## Errors
    ///
    /// Fails on the first failing stage, see `Error::stage`. Only a workspace
    /// that can't be emptied is fatal, see `Error::is_fatal`.
    pub fn convert(
        &self,
        request: &ConversionRequest,
        workspace: &Workspace,
    ) -> Result<ConversionReport> {
        check_preconditions(request)?;
        let input_bytes = fs::metadata(&request.input)?.len();

        if request.dry_run {
            info!(
                "WHATIF: convert {} -> {}",
                request.input.display(),
                request.output.display()
            );
            return Ok(ConversionReport {
                dry_run: true,
                input_bytes,
                ..ConversionReport::default()
            });
        }

        if let Some(parent) = request.output.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                debug!("creating directory {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }

        workspace.prepare()?;
        let result = self.run_stages(request, workspace, input_bytes);

        if let Err(err) = workspace.clear() {
            warn!(
                "couldn't clear workspace {}: {err}",
                workspace.root().display()
            );
        }

        result
    }

    fn run_stages(
        &self,
        request: &ConversionRequest,
        workspace: &Workspace,
        input_bytes: u64,
    ) -> Result<ConversionReport> {
        let root = workspace.root();

        let extraction = reader::extract(&request.input, root, self.unpacker.as_ref())?;
        debug!(
            "extracted {} files from {}",
            extraction.entries.len(),
            request.input.display()
        );

        let filtered = filter_pages(root, workspace.files()?, &request.pages)?;
        if !filtered.excluded.is_empty() {
            info!(
                "excluded {} pages from {}",
                filtered.excluded.len(),
                request.input.display()
            );
        }

        let (files, shrink) = match request.shrink {
            Some(options) => {
                let shrinker = Shrinker::new(self.probe.as_ref(), self.transform.as_ref(), options);
                let report = shrinker.shrink_all(root, &filtered.kept)?;
                // Shrunk pages got renamed
                (workspace.files()?, Some(report))
            }
            None => (filtered.kept, None),
        };

        let written = write_archive(root, &files, &request.output)?;

        Ok(ConversionReport {
            dry_run: false,
            archive_kind: Some(extraction.kind),
            extracted: extraction.entries.len(),
            excluded: filtered.excluded,
            shrink,
            entries: written.entries,
            input_bytes,
            output_bytes: written.bytes,
        })
    }
}

fn check_preconditions(request: &ConversionRequest) -> Result<(), PreconditionError> {
    if !request.input.is_file() {
        return Err(PreconditionError::MissingInput(request.input.clone()));
    }
    if request.output.exists() {
        return Err(PreconditionError::OutputExists(request.output.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::{
        errors::{ExtractError, Stage},
        Error,
    };

    use super::*;

    struct NoUnpacker;

    impl Unpacker for NoUnpacker {
        fn unpack(&self, archive: &Path, _destination: &Path) -> Result<String, ExtractError> {
            Err(ExtractError::UnpackFailed {
                program: String::from("none"),
                status: String::from("not a rar"),
                output: archive.display().to_string(),
            })
        }
    }

    #[test]
    fn missing_input_is_a_precondition_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(temp_dir.path().join("ws"));
        let request = ConversionRequest::new(
            temp_dir.path().join("missing.cbr"),
            temp_dir.path().join("out.cbz"),
        );

        let err = Converter::new(NoUnpacker)
            .convert(&request, &workspace)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Precondition(PreconditionError::MissingInput(_))
        ));
        assert_eq!(err.stage(), Some(Stage::Prepare));
        assert!(!err.is_fatal());
    }

    #[test]
    fn existing_output_is_a_precondition_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("comic.cbr");
        let output = temp_dir.path().join("comic.cbz");
        fs::write(&input, b"rar").unwrap();
        fs::write(&output, b"zip").unwrap();
        let workspace = Workspace::new(temp_dir.path().join("ws"));

        let err = Converter::new(NoUnpacker)
            .convert(&ConversionRequest::new(&input, &output), &workspace)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Precondition(PreconditionError::OutputExists(_))
        ));
        assert_eq!(fs::read(&output).unwrap(), b"zip");
    }

    #[test]
    fn dry_run_touches_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("comic.cbr");
        let output = temp_dir.path().join("out/comic.cbz");
        fs::write(&input, b"rar").unwrap();
        let workspace = Workspace::new(temp_dir.path().join("ws"));

        let report = Converter::new(NoUnpacker)
            .convert(
                &ConversionRequest::new(&input, &output).set_dry_run(true),
                &workspace,
            )
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.input_bytes, 3);
        assert!(!output.exists());
        assert!(!temp_dir.path().join("out").exists());
        assert!(!workspace.root().exists());
    }

    #[test]
    fn failed_extraction_leaves_an_empty_workspace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("comic.cbr");
        let output = temp_dir.path().join("comic.cbz");
        fs::write(&input, b"not a zip").unwrap();
        let workspace = Workspace::new(temp_dir.path().join("ws"));

        let err = Converter::new(NoUnpacker)
            .convert(&ConversionRequest::new(&input, &output), &workspace)
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Extract));
        assert!(!output.exists());
        assert!(workspace.is_empty().unwrap());
    }
}
